use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{error::EvaluationError, user_context::UserContext, TypedValue};

/// Kind of attribute a condition targets.
///
/// Unknown kinds are kept so that a datafile produced by a newer backend still parses; evaluating
/// such a condition fails with [`EvaluationError::UnsupportedConditionType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionType {
    CustomAttribute,
    ThirdPartyDimension,
    Unknown(String),
}

impl From<String> for ConditionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "custom_attribute" => ConditionType::CustomAttribute,
            "third_party_dimension" => ConditionType::ThirdPartyDimension,
            _ => ConditionType::Unknown(value),
        }
    }
}

impl From<ConditionType> for String {
    fn from(value: ConditionType) -> Self {
        match value {
            ConditionType::CustomAttribute => "custom_attribute".to_owned(),
            ConditionType::ThirdPartyDimension => "third_party_dimension".to_owned(),
            ConditionType::Unknown(s) => s,
        }
    }
}

/// Match operator of an attribute condition. A missing operator means [`MatchType::Exact`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MatchType {
    Exact,
    Exists,
    Substring,
    Lt,
    Le,
    Gt,
    Ge,
    SemverEq,
    SemverLt,
    SemverLe,
    SemverGt,
    SemverGe,
    Qualified,
    Unknown(String),
}

impl MatchType {
    fn as_str(&self) -> &str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Exists => "exists",
            MatchType::Substring => "substring",
            MatchType::Lt => "lt",
            MatchType::Le => "le",
            MatchType::Gt => "gt",
            MatchType::Ge => "ge",
            MatchType::SemverEq => "semver_eq",
            MatchType::SemverLt => "semver_lt",
            MatchType::SemverLe => "semver_le",
            MatchType::SemverGt => "semver_gt",
            MatchType::SemverGe => "semver_ge",
            MatchType::Qualified => "qualified",
            MatchType::Unknown(s) => s,
        }
    }
}

impl From<String> for MatchType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "exact" => MatchType::Exact,
            "exists" => MatchType::Exists,
            "substring" => MatchType::Substring,
            "lt" => MatchType::Lt,
            "le" => MatchType::Le,
            "gt" => MatchType::Gt,
            "ge" => MatchType::Ge,
            "semver_eq" => MatchType::SemverEq,
            "semver_lt" => MatchType::SemverLt,
            "semver_le" => MatchType::SemverLe,
            "semver_gt" => MatchType::SemverGt,
            "semver_ge" => MatchType::SemverGe,
            "qualified" => MatchType::Qualified,
            _ => MatchType::Unknown(value),
        }
    }
}

impl From<MatchType> for String {
    fn from(value: MatchType) -> Self {
        match value {
            MatchType::Unknown(s) => s,
            known => known.as_str().to_owned(),
        }
    }
}

/// A leaf condition over one user attribute, e.g.
/// `{"name": "age", "type": "custom_attribute", "match": "ge", "value": 21}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAttribute {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub condition_type: Option<ConditionType>,
    #[serde(rename = "match", default)]
    pub match_type: Option<MatchType>,
    #[serde(default)]
    pub value: Option<TypedValue>,
}

impl UserAttribute {
    pub fn evaluate(&self, user: &UserContext) -> Result<bool, EvaluationError> {
        let match_type = self.match_type.as_ref().unwrap_or(&MatchType::Exact);

        if let MatchType::Unknown(s) = match_type {
            return Err(EvaluationError::UnsupportedMatch(s.clone()));
        }

        if *match_type == MatchType::Qualified {
            // Segments are supplied by the host, not through attributes.
            let Some(TypedValue::String(segment)) = &self.value else {
                return Err(EvaluationError::InvalidConditionValue);
            };
            return Ok(user.is_qualified_for(segment));
        }

        match &self.condition_type {
            Some(ConditionType::CustomAttribute) => {}
            Some(other) => {
                return Err(EvaluationError::UnsupportedConditionType(
                    other.clone().into(),
                ))
            }
            None => {
                return Err(EvaluationError::UnsupportedConditionType(
                    "<missing>".to_owned(),
                ))
            }
        }

        let name = self
            .name
            .as_deref()
            .ok_or(EvaluationError::MissingAttributeName)?;
        let attribute = user.attributes().get(name);

        if *match_type == MatchType::Exists {
            return Ok(attribute.is_some_and(TypedValue::is_present));
        }

        let condition = self
            .value
            .as_ref()
            .ok_or(EvaluationError::MissingConditionValue)?;
        let attribute =
            attribute.ok_or_else(|| EvaluationError::MissingAttribute(name.to_owned()))?;
        if !attribute.is_present() {
            return Err(EvaluationError::NullAttribute(name.to_owned()));
        }

        let result = match match_type {
            MatchType::Exact => attribute.exact_match(condition),
            MatchType::Substring => attribute.substring_match(condition),
            MatchType::Lt => attribute.less_than(condition),
            MatchType::Le => attribute
                .numeric_cmp(condition)
                .map(|ordering| ordering != Ordering::Greater),
            MatchType::Gt => attribute.greater_than(condition),
            MatchType::Ge => attribute
                .numeric_cmp(condition)
                .map(|ordering| ordering != Ordering::Less),
            MatchType::SemverEq => attribute
                .semver_compare(condition)
                .map(|ordering| ordering == Ordering::Equal),
            MatchType::SemverLt => attribute
                .semver_compare(condition)
                .map(|ordering| ordering == Ordering::Less),
            MatchType::SemverLe => attribute
                .semver_compare(condition)
                .map(|ordering| ordering != Ordering::Greater),
            MatchType::SemverGt => attribute
                .semver_compare(condition)
                .map(|ordering| ordering == Ordering::Greater),
            MatchType::SemverGe => attribute
                .semver_compare(condition)
                .map(|ordering| ordering != Ordering::Less),
            // Handled above.
            MatchType::Exists | MatchType::Qualified | MatchType::Unknown(_) => Ok(false),
        };

        if let Err(err) = &result {
            log::debug!(target: "decision_core",
                        attribute = name,
                        match_type = match_type.as_str(),
                        user_id = user.user_id();
                        "condition could not be evaluated: {err}");
        }

        result
    }
}
