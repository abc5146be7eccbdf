use serde::{Deserialize, Deserializer, Serialize};

use crate::{error::EvaluationError, user_context::UserContext};

use super::{AudienceLookup, UserAttribute};

/// Logical operator heading a condition list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
    Not,
}

impl LogicalOperator {
    fn parse(s: &str) -> Option<LogicalOperator> {
        match s {
            "and" => Some(LogicalOperator::And),
            "or" => Some(LogicalOperator::Or),
            "not" => Some(LogicalOperator::Not),
            _ => None,
        }
    }
}

/// A node of an audience condition tree.
///
/// The datafile encodes trees as nested JSON arrays: `["and", "123", ["or", "456", "789"]]`. The
/// first element of a list is normally an operator; a list that starts with a leaf is treated as
/// an implicit `or`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConditionNode {
    /// Operator token. Only meaningful as the first element of a [`ConditionNode::List`].
    Operator(LogicalOperator),
    /// Reference to another audience by id.
    AudienceId(String),
    /// Predicate over a user attribute.
    Attribute(UserAttribute),
    /// Operator application or implicit `or` over the elements.
    List(Vec<ConditionNode>),
}

impl TryFrom<serde_json::Value> for ConditionNode {
    type Error = String;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;
        match value {
            Value::String(s) => Ok(match LogicalOperator::parse(&s) {
                Some(op) => ConditionNode::Operator(op),
                None => ConditionNode::AudienceId(s),
            }),
            Value::Object(_) => serde_json::from_value(value)
                .map(ConditionNode::Attribute)
                .map_err(|err| format!("invalid attribute condition: {err}")),
            Value::Array(items) => items
                .into_iter()
                .map(ConditionNode::try_from)
                .collect::<Result<_, _>>()
                .map(ConditionNode::List),
            other => Err(format!("unexpected condition node: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for ConditionNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        ConditionNode::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl ConditionNode {
    /// Evaluate the node for `user`.
    ///
    /// `Err` is the undecidable outcome: the error describes the first condition that could not
    /// be evaluated. Callers must not treat it as `false`.
    pub fn evaluate(
        &self,
        user: &UserContext,
        lookup: &dyn AudienceLookup,
    ) -> Result<bool, EvaluationError> {
        self.evaluate_on_path(user, lookup, &mut Vec::new())
    }

    /// `path` holds the ids of the audiences currently being evaluated, outermost first.
    fn evaluate_on_path(
        &self,
        user: &UserContext,
        lookup: &dyn AudienceLookup,
        path: &mut Vec<String>,
    ) -> Result<bool, EvaluationError> {
        match self {
            ConditionNode::Operator(op) => Err(EvaluationError::InvalidConditionFormat(format!(
                "operator {op:?} outside of operator position"
            ))),
            ConditionNode::AudienceId(id) => {
                if path.contains(id) {
                    return Err(EvaluationError::InvalidConditionFormat(format!(
                        "audience {id} references itself through {}",
                        path.join(" -> ")
                    )));
                }
                let audience = lookup
                    .audience_by_id(id)
                    .ok_or_else(|| EvaluationError::NoMatchingAudience(id.clone()))?;

                path.push(id.clone());
                let result = audience.conditions.evaluate_on_path(user, lookup, path);
                path.pop();

                log::trace!(target: "decision_core",
                            audience_id = id.as_str(),
                            user_id = user.user_id(),
                            result:? = result;
                            "evaluated audience");
                result
            }
            ConditionNode::Attribute(attribute) => attribute.evaluate(user),
            ConditionNode::List(items) => match items.split_first() {
                None => Err(EvaluationError::InvalidConditionFormat(
                    "empty condition list".to_owned(),
                )),
                Some((ConditionNode::Operator(op), operands)) => {
                    apply(*op, operands, user, lookup, path)
                }
                Some((ConditionNode::AudienceId(_) | ConditionNode::Attribute(_), _)) => {
                    apply(LogicalOperator::Or, items, user, lookup, path)
                }
                Some((ConditionNode::List(_), _)) => Err(EvaluationError::InvalidConditionFormat(
                    "condition list must start with an operator or a leaf".to_owned(),
                )),
            },
        }
    }
}

fn apply(
    op: LogicalOperator,
    operands: &[ConditionNode],
    user: &UserContext,
    lookup: &dyn AudienceLookup,
    path: &mut Vec<String>,
) -> Result<bool, EvaluationError> {
    match op {
        LogicalOperator::And => and(operands, user, lookup, path),
        LogicalOperator::Or => or(operands, user, lookup, path),
        LogicalOperator::Not => not(operands, user, lookup, path),
    }
}

/// `false` wins over undecidable operands; undecidable wins over `true`.
fn and(
    operands: &[ConditionNode],
    user: &UserContext,
    lookup: &dyn AudienceLookup,
    path: &mut Vec<String>,
) -> Result<bool, EvaluationError> {
    if operands.is_empty() {
        return Err(EvaluationError::InvalidConditionFormat(
            "\"and\" requires at least one operand".to_owned(),
        ));
    }

    let mut undecided = None;
    for operand in operands {
        match operand.evaluate_on_path(user, lookup, path) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) => {
                undecided.get_or_insert(err);
            }
        }
    }

    match undecided {
        Some(err) => Err(err),
        None => Ok(true),
    }
}

/// `true` wins over undecidable operands; undecidable wins over `false`.
fn or(
    operands: &[ConditionNode],
    user: &UserContext,
    lookup: &dyn AudienceLookup,
    path: &mut Vec<String>,
) -> Result<bool, EvaluationError> {
    if operands.is_empty() {
        return Err(EvaluationError::InvalidConditionFormat(
            "\"or\" requires at least one operand".to_owned(),
        ));
    }

    let mut undecided = None;
    for operand in operands {
        match operand.evaluate_on_path(user, lookup, path) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => {
                undecided.get_or_insert(err);
            }
        }
    }

    match undecided {
        Some(err) => Err(err),
        None => Ok(false),
    }
}

fn not(
    operands: &[ConditionNode],
    user: &UserContext,
    lookup: &dyn AudienceLookup,
    path: &mut Vec<String>,
) -> Result<bool, EvaluationError> {
    match operands {
        [operand] => operand
            .evaluate_on_path(user, lookup, path)
            .map(|result| !result),
        _ => Err(EvaluationError::InvalidConditionFormat(format!(
            "\"not\" requires exactly one operand, got {}",
            operands.len()
        ))),
    }
}
