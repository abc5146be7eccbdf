use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
};

use derive_more::From;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{audience::semantic_version, error::EvaluationError};

/// Largest integer magnitude that survives a round trip through `f64` (2^53).
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Type alias for a HashMap representing user attributes.
///
/// # Examples
/// ```
/// # use decision_core::{Attributes, TypedValue};
/// let attributes = [
///     ("age".to_owned(), 30.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("browser".to_owned(), "firefox".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, TypedValue>;

/// A value of a user attribute or of an audience condition.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `i64`, `i32`, `f64` and
/// `bool`.
///
/// When parsed from JSON, every number becomes [`TypedValue::Double`] so that `3` and `3.0` in a
/// datafile behave the same. Integers only appear when supplied natively by the host
/// application. `null` and other unrepresentable shapes become [`TypedValue::Other`].
#[derive(Debug, Clone, PartialEq, Serialize, From)]
#[serde(untagged)]
pub enum TypedValue {
    /// A string value.
    String(String),
    /// A signed integer.
    Int(i64),
    /// A double-precision number.
    Double(f64),
    /// A boolean value.
    Bool(bool),
    /// An ordered sequence of values.
    Array(Vec<TypedValue>),
    /// A mapping of string keys to values.
    Map(BTreeMap<String, TypedValue>),
    /// A null or otherwise unrepresentable value.
    Other,
}

impl TypedValue {
    /// Returns `true` for a value that can take part in comparisons (anything but `Other`).
    pub fn is_present(&self) -> bool {
        !matches!(self, TypedValue::Other)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value with integer-to-double promotion.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Int(i) => Some(*i as f64),
            TypedValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Checks that a numeric value lies within ±2^53. Non-numeric values pass unchanged.
    pub fn check_range(&self) -> Result<(), EvaluationError> {
        match self.as_f64() {
            Some(n) if !n.is_finite() || n.abs() > MAX_SAFE_INTEGER => {
                Err(EvaluationError::ValueOutOfRange)
            }
            _ => Ok(()),
        }
    }

    /// Whether the value can be used as the right-hand side of an exact match.
    fn is_exact_match_operand(&self) -> bool {
        match self {
            TypedValue::String(_) | TypedValue::Bool(_) | TypedValue::Int(_) => true,
            TypedValue::Double(d) => d.is_finite(),
            TypedValue::Array(_) | TypedValue::Map(_) | TypedValue::Other => false,
        }
    }

    /// Compares `self` (the attribute value) with a condition value for equality.
    ///
    /// Strings, booleans and numbers are comparable with values of the same kind; integers and
    /// doubles compare with numeric promotion. Anything else is an error.
    pub fn exact_match(&self, condition: &TypedValue) -> Result<bool, EvaluationError> {
        if !condition.is_exact_match_operand() {
            return Err(EvaluationError::InvalidConditionValue);
        }

        match (self, condition) {
            (TypedValue::String(a), TypedValue::String(b)) => Ok(a == b),
            (TypedValue::Bool(a), TypedValue::Bool(b)) => Ok(a == b),
            (TypedValue::Int(a), TypedValue::Int(b)) => {
                self.check_range()?;
                Ok(a == b)
            }
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(a_num), Some(b_num)) => {
                    self.check_range()?;
                    Ok(a_num == b_num)
                }
                _ => Err(EvaluationError::MismatchedType),
            },
        }
    }

    /// Returns `true` if `self` (the attribute value) contains the condition string.
    pub fn substring_match(&self, condition: &TypedValue) -> Result<bool, EvaluationError> {
        let TypedValue::String(needle) = condition else {
            return Err(EvaluationError::InvalidConditionValue);
        };
        let TypedValue::String(haystack) = self else {
            return Err(EvaluationError::MismatchedType);
        };
        Ok(haystack.contains(needle.as_str()))
    }

    /// Orders `self` (the attribute value) relative to a numeric condition value.
    pub fn numeric_cmp(&self, condition: &TypedValue) -> Result<Ordering, EvaluationError> {
        let Some(target) = condition.as_f64().filter(|n| n.is_finite()) else {
            return Err(EvaluationError::InvalidConditionValue);
        };
        let Some(value) = self.as_f64() else {
            return Err(EvaluationError::MismatchedType);
        };
        self.check_range()?;

        if let (TypedValue::Int(a), TypedValue::Int(b)) = (self, condition) {
            return Ok(a.cmp(b));
        }
        value
            .partial_cmp(&target)
            .ok_or(EvaluationError::ValueOutOfRange)
    }

    /// Returns `true` if `self` (the attribute value) is greater than the condition value.
    pub fn greater_than(&self, condition: &TypedValue) -> Result<bool, EvaluationError> {
        Ok(self.numeric_cmp(condition)? == Ordering::Greater)
    }

    /// Returns `true` if `self` (the attribute value) is less than the condition value.
    pub fn less_than(&self, condition: &TypedValue) -> Result<bool, EvaluationError> {
        Ok(self.numeric_cmp(condition)? == Ordering::Less)
    }

    /// Orders `self` (the attribute version) relative to the condition version.
    ///
    /// The comparison only goes as deep as the condition version, so `"2.1.5"` is equal to
    /// `"2.1"`.
    pub fn semver_compare(&self, condition: &TypedValue) -> Result<Ordering, EvaluationError> {
        let TypedValue::String(target) = condition else {
            return Err(EvaluationError::InvalidConditionValue);
        };
        let TypedValue::String(version) = self else {
            return Err(EvaluationError::MismatchedType);
        };
        semantic_version::compare(version, target)
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for TypedValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<serde_json::Value> for TypedValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::String(s) => TypedValue::String(s),
            Value::Number(n) => n.as_f64().map_or(TypedValue::Other, TypedValue::Double),
            Value::Bool(b) => TypedValue::Bool(b),
            Value::Array(items) => {
                TypedValue::Array(items.into_iter().map(TypedValue::from).collect())
            }
            Value::Object(map) => TypedValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, TypedValue::from(v)))
                    .collect(),
            ),
            Value::Null => TypedValue::Other,
        }
    }
}

impl<'de> Deserialize<'de> for TypedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(TypedValue::from)
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use serde_json::json;

    use crate::error::EvaluationError;

    use super::TypedValue;

    #[test]
    fn json_numbers_parse_as_doubles() {
        let value: TypedValue = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(value, TypedValue::Double(3.0));

        let value: TypedValue = serde_json::from_value(json!(null)).unwrap();
        assert_eq!(value, TypedValue::Other);

        let value: TypedValue = serde_json::from_value(json!({"a": [1, "b"]})).unwrap();
        let TypedValue::Map(map) = value else {
            panic!("expected map");
        };
        assert_eq!(
            map["a"],
            TypedValue::Array(vec![TypedValue::Double(1.0), "b".into()])
        );
    }

    #[test]
    fn exact_match_promotes_numbers() {
        assert_eq!(TypedValue::Int(3).exact_match(&TypedValue::Double(3.0)), Ok(true));
        assert_eq!(TypedValue::Double(3.5).exact_match(&TypedValue::Int(3)), Ok(false));
        assert_eq!(TypedValue::Int(7).exact_match(&TypedValue::Int(7)), Ok(true));
    }

    #[test]
    fn exact_match_compares_strings_and_bools() {
        assert_eq!(TypedValue::from("a").exact_match(&"a".into()), Ok(true));
        assert_eq!(TypedValue::from("a").exact_match(&"b".into()), Ok(false));
        assert_eq!(TypedValue::from(true).exact_match(&true.into()), Ok(true));
    }

    #[test]
    fn exact_match_rejects_cross_type_comparisons() {
        assert_eq!(
            TypedValue::from("3").exact_match(&TypedValue::Double(3.0)),
            Err(EvaluationError::MismatchedType)
        );
        assert_eq!(
            TypedValue::from(true).exact_match(&"true".into()),
            Err(EvaluationError::MismatchedType)
        );
    }

    #[test]
    fn exact_match_rejects_invalid_condition_values() {
        assert_eq!(
            TypedValue::from("a").exact_match(&TypedValue::Other),
            Err(EvaluationError::InvalidConditionValue)
        );
        assert_eq!(
            TypedValue::Double(1.0).exact_match(&TypedValue::Double(f64::INFINITY)),
            Err(EvaluationError::InvalidConditionValue)
        );
        assert_eq!(
            TypedValue::from("a").exact_match(&TypedValue::Array(vec![])),
            Err(EvaluationError::InvalidConditionValue)
        );
    }

    #[test]
    fn numeric_comparisons_check_range() {
        let huge = TypedValue::Double(2f64.powi(53) + 2.0);
        assert_eq!(
            huge.greater_than(&TypedValue::Double(1.0)),
            Err(EvaluationError::ValueOutOfRange)
        );
        assert_eq!(
            TypedValue::Int(i64::MAX).exact_match(&TypedValue::Int(1)),
            Err(EvaluationError::ValueOutOfRange)
        );
        assert_eq!(
            TypedValue::Int(1 << 53).less_than(&TypedValue::Double(1.0)),
            Ok(false)
        );
    }

    #[test]
    fn numeric_comparisons() {
        let ten = TypedValue::Int(10);
        assert_eq!(ten.greater_than(&TypedValue::Double(9.5)), Ok(true));
        assert_eq!(ten.less_than(&TypedValue::Double(9.5)), Ok(false));
        assert_eq!(ten.numeric_cmp(&TypedValue::Int(10)), Ok(Ordering::Equal));
        assert_eq!(
            TypedValue::from("10").greater_than(&TypedValue::Int(1)),
            Err(EvaluationError::MismatchedType)
        );
        assert_eq!(
            ten.greater_than(&"1".into()),
            Err(EvaluationError::InvalidConditionValue)
        );
    }

    #[test]
    fn substring_match() {
        assert_eq!(
            TypedValue::from("chrome-mobile").substring_match(&"mobile".into()),
            Ok(true)
        );
        assert_eq!(
            TypedValue::from("firefox").substring_match(&"mobile".into()),
            Ok(false)
        );
        assert_eq!(
            TypedValue::Int(1).substring_match(&"1".into()),
            Err(EvaluationError::MismatchedType)
        );
        assert_eq!(
            TypedValue::from("1").substring_match(&TypedValue::Int(1)),
            Err(EvaluationError::InvalidConditionValue)
        );
    }

    #[test]
    fn semver_compare_uses_condition_precision() {
        assert_eq!(
            TypedValue::from("2.1.5").semver_compare(&"2.1".into()),
            Ok(Ordering::Equal)
        );
        assert_eq!(
            TypedValue::from("2.0.9").semver_compare(&"2.1".into()),
            Ok(Ordering::Less)
        );
        assert_eq!(
            TypedValue::Double(2.1).semver_compare(&"2.1".into()),
            Err(EvaluationError::MismatchedType)
        );
    }
}
