use serde::{Deserialize, Serialize};

/// Per-call options of [`DecisionEngine::decide`](crate::DecisionEngine::decide).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecideOption {
    /// Mark the decision as not to be reported as an impression.
    DisableDecisionEvent,
    /// `decide_all` and `decide_for_keys` only return enabled flags.
    EnabledFlagsOnly,
    /// Neither read nor write the user profile.
    IgnoreUserProfileService,
    /// Include informational reasons in the decision (errors are always included).
    IncludeReasons,
    /// Passed through to the host, which should not attach flag variables to the decision.
    ExcludeVariables,
    /// Fetch a fresh bandit decision without reading or writing the bandit cache.
    IgnoreCmabCache,
    /// Clear the whole bandit cache before deciding.
    ResetCmabCache,
    /// Drop the cached bandit decision of this user before deciding.
    InvalidateUserCmabCache,
}
