//! Decision resolution: forced decisions, whitelists, sticky user profiles, audience targeting,
//! bucketing, rollouts and bandits.
mod forced_variations;
mod options;
mod reasons;
mod service;
mod user_profile;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use forced_variations::ForcedVariations;
pub use options::DecideOption;
pub use reasons::DecisionReasons;
pub use service::{DecisionService, ExperimentDecision, FeatureDecision};
pub use user_profile::{
    Bucket, InMemoryUserProfileService, ProfileError, UserProfile, UserProfileService,
};

/// How the variation of a decision was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Forced decision set on the user context.
    Forced,
    /// Runtime forced variation or datafile whitelist.
    Whitelist,
    /// Variation recorded in the user profile.
    CachedProfile,
    /// Experiment audience and bucketing.
    Bucketed,
    /// Rollout rule.
    Rollout,
    /// Contextual bandit.
    Cmab,
    /// No variation applies.
    #[serde(rename = "none")]
    NoVariation,
}

/// Result of [`DecisionEngine::decide`](crate::DecisionEngine::decide).
///
/// Carries everything the host needs to report an impression without resolving the decision
/// again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub user_id: String,
    /// Key the decision was requested for: a flag key, or an experiment key.
    pub flag_key: String,
    pub variation_id: Option<String>,
    pub variation_key: Option<String>,
    /// Experiment or rollout rule that produced the variation.
    pub rule_id: Option<String>,
    pub rule_key: Option<String>,
    pub source: DecisionSource,
    /// Whether the feature is on for the user. `false` when there is no variation.
    pub enabled: bool,
    /// Correlation id of the prediction request for bandit decisions.
    pub cmab_uuid: Option<String>,
    /// `false` when the caller disabled the decision event.
    pub send_event: bool,
    /// The caller asked not to attach flag variables.
    pub exclude_variables: bool,
    pub reasons: Vec<String>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub(crate) fn new(
        user_id: &str,
        flag_key: &str,
        decision: FeatureDecision<'_>,
        options: &[DecideOption],
        reasons: DecisionReasons,
    ) -> Decision {
        Decision {
            user_id: user_id.to_owned(),
            flag_key: flag_key.to_owned(),
            variation_id: decision.variation.map(|v| v.id.clone()),
            variation_key: decision.variation.map(|v| v.key.clone()),
            rule_id: decision.rule.map(|rule| rule.id.clone()),
            rule_key: decision.rule.map(|rule| rule.key.clone()),
            source: decision.source,
            enabled: decision.variation.is_some_and(|v| v.feature_enabled),
            cmab_uuid: decision.cmab_uuid,
            send_event: !options.contains(&DecideOption::DisableDecisionEvent),
            exclude_variables: options.contains(&DecideOption::ExcludeVariables),
            reasons: reasons.into_vec(),
            decided_at: Utc::now(),
        }
    }

    /// Decision without a variation, e.g., when the key is unknown.
    pub(crate) fn empty(
        user_id: &str,
        flag_key: &str,
        options: &[DecideOption],
        reasons: DecisionReasons,
    ) -> Decision {
        Decision::new(
            user_id,
            flag_key,
            FeatureDecision {
                rule: None,
                variation: None,
                source: DecisionSource::NoVariation,
                cmab_uuid: None,
            },
            options,
            reasons,
        )
    }

    pub fn has_variation(&self) -> bool {
        self.variation_id.is_some()
    }
}
