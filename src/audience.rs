//! Audience conditions: boolean trees over user attributes and references to other audiences.
mod condition;
pub(crate) mod semantic_version;
mod user_attribute;

use serde::{Deserialize, Deserializer, Serialize};

pub use condition::{ConditionNode, LogicalOperator};
pub use user_attribute::{ConditionType, MatchType, UserAttribute};

use crate::{error::EvaluationError, user_context::UserContext};

/// A named, reusable condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audience {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Legacy datafiles encode conditions as a JSON string, newer ones inline.
    #[serde(deserialize_with = "deserialize_conditions")]
    pub conditions: ConditionNode,
}

fn deserialize_conditions<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<ConditionNode, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    let value = match value {
        // A bare string that is not JSON would be an audience id, which is not a valid set of
        // audience conditions.
        serde_json::Value::String(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom)?,
        other => other,
    };
    ConditionNode::try_from(value).map_err(serde::de::Error::custom)
}

/// Minimal configuration capability needed to evaluate conditions: resolving nested audience
/// references.
pub trait AudienceLookup {
    fn audience_by_id(&self, id: &str) -> Option<&Audience>;
}

/// Evaluate a condition tree for `user`.
///
/// Returns a typed error when the root cannot be decided (e.g., a required attribute is missing
/// and no other operand settles the result).
pub fn evaluate(
    conditions: &ConditionNode,
    user: &UserContext,
    lookup: &dyn AudienceLookup,
) -> Result<bool, EvaluationError> {
    conditions.evaluate(user, lookup)
}
