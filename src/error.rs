use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cmab::CmabError;

/// Represents a result type for operations in the decision engine.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while loading configuration or resolving a
/// decision.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Datafile could not be parsed.
    #[error("invalid datafile: {0}")]
    DatafileInvalid(Arc<serde_json::Error>),

    /// Datafile declares a schema version this engine does not understand.
    #[error("unsupported datafile version: {version}")]
    UnsupportedDatafileVersion {
        /// Version declared by the datafile.
        version: String,
    },

    /// Configuration has not been set yet.
    #[error("configuration missing")]
    ConfigurationMissing,

    /// No flag with the requested key exists in the configuration.
    #[error("flag not found: {0}")]
    FlagNotFound(String),

    /// No experiment with the requested key or id exists in the configuration.
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    /// Flag references a rollout that does not exist in the configuration.
    #[error("rollout not found: {0}")]
    RolloutNotFound(String),

    /// Invalid prediction endpoint configuration.
    #[error("invalid prediction endpoint")]
    InvalidEndpoint(#[source] url::ParseError),

    /// Network error.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// Audience condition could not be decided.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    /// Contextual bandit decision failed.
    #[error(transparent)]
    Cmab(#[from] CmabError),
}

impl Error {
    /// Return `true` if the error is a normal running condition (e.g., caller asked for an
    /// unknown key) rather than a sign of misconfiguration.
    pub(crate) fn is_normal(&self) -> bool {
        matches!(self, Error::ConfigurationMissing | Error::FlagNotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::DatafileInvalid(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

/// Errors raised while evaluating an audience condition tree.
///
/// Any of these make the condition node that raised it undecidable. `and`/`or` nodes may still
/// reach a decision if another operand is decisive.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EvaluationError {
    /// Condition tree has an unexpected shape (empty list, missing operand, misplaced operator).
    #[error("invalid condition format: {0}")]
    InvalidConditionFormat(String),

    /// Condition references an audience id that is not present in the configuration.
    #[error("no audience with id {0}")]
    NoMatchingAudience(String),

    /// Condition `type` is not recognized.
    #[error("unsupported condition type: {0}")]
    UnsupportedConditionType(String),

    /// Condition `match` is not recognized.
    #[error("unsupported match type: {0}")]
    UnsupportedMatch(String),

    /// Condition has no attribute name.
    #[error("condition is missing attribute name")]
    MissingAttributeName,

    /// User did not provide the attribute the condition is evaluated against.
    #[error("missing attribute value for {0}")]
    MissingAttribute(String),

    /// User provided a null value for the attribute.
    #[error("null attribute value for {0}")]
    NullAttribute(String),

    /// Condition has no comparison value.
    #[error("condition is missing a value")]
    MissingConditionValue,

    /// Condition value has a type the match operator cannot work with.
    #[error("invalid condition value")]
    InvalidConditionValue,

    /// Attribute value type cannot be compared with the condition value.
    #[error("attribute value type does not match condition value type")]
    MismatchedType,

    /// Numeric attribute value lies outside of the safe integer range (±2^53).
    #[error("attribute value is out of range")]
    ValueOutOfRange,

    /// Version string is not a valid semantic version.
    #[error("invalid semantic version: {0}")]
    InvalidSemanticVersion(String),
}
