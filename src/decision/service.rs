use std::sync::Arc;

use crate::{
    audience::{self, ConditionNode, LogicalOperator},
    bucketer,
    cmab::{CmabError, CmabService},
    project_config::{Experiment, FeatureFlag, ProjectConfig, Variation},
    user_context::{ForcedDecisionKey, UserContext},
    Error, Result,
};

use super::{
    DecideOption, DecisionReasons, DecisionSource, ForcedVariations, UserProfile,
    UserProfileService,
};

/// Variation resolved for a single experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentDecision<'a> {
    pub variation: &'a Variation,
    pub source: DecisionSource,
    /// Set for bandit decisions.
    pub cmab_uuid: Option<String>,
}

/// Outcome of resolving a feature flag.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDecision<'a> {
    /// Experiment or rollout rule that produced the variation. `None` for flag-level forced
    /// decisions and when no rule applies.
    pub rule: Option<&'a Experiment>,
    pub variation: Option<&'a Variation>,
    pub source: DecisionSource,
    pub cmab_uuid: Option<String>,
}

impl<'a> FeatureDecision<'a> {
    pub(crate) fn none() -> FeatureDecision<'a> {
        FeatureDecision {
            rule: None,
            variation: None,
            source: DecisionSource::NoVariation,
            cmab_uuid: None,
        }
    }

    fn forced(rule: Option<&'a Experiment>, variation: &'a Variation) -> FeatureDecision<'a> {
        FeatureDecision {
            rule,
            variation: Some(variation),
            source: DecisionSource::Forced,
            cmab_uuid: None,
        }
    }
}

/// Resolves which variation a user gets for an experiment or a feature flag.
///
/// Precedence for an experiment: runtime whitelist, datafile whitelist, user profile, audience
/// and bucketing (or the bandit for CMAB experiments). Feature flags additionally consult
/// forced decisions of the user context, then the flag's experiments in order, then its
/// rollout.
pub struct DecisionService {
    user_profile_service: Option<Arc<dyn UserProfileService>>,
    cmab_service: Option<Arc<CmabService>>,
    forced_variations: ForcedVariations,
}

impl DecisionService {
    pub fn new(
        user_profile_service: Option<Arc<dyn UserProfileService>>,
        cmab_service: Option<Arc<CmabService>>,
    ) -> DecisionService {
        DecisionService {
            user_profile_service,
            cmab_service,
            forced_variations: ForcedVariations::new(),
        }
    }

    pub fn forced_variations(&self) -> &ForcedVariations {
        &self.forced_variations
    }

    /// Resolve the variation of `user` in a single experiment.
    ///
    /// `Ok(None)` is a normal outcome (experiment not running, audience not met, not in
    /// traffic). `Err` is only returned when the bandit could not be consulted.
    pub async fn get_variation<'a>(
        &self,
        config: &'a ProjectConfig,
        experiment: &'a Experiment,
        user: &UserContext,
        options: &[DecideOption],
        reasons: &mut DecisionReasons,
    ) -> Result<Option<ExperimentDecision<'a>>> {
        let user_id = user.user_id();
        let experiment_key = experiment.key.as_str();

        if !experiment.is_running() {
            log::trace!(target: "decision_core", experiment_key, user_id; "experiment is not running");
            reasons.add_info(|| format!("Experiment \"{experiment_key}\" is not running."));
            return Ok(None);
        }

        if let Some(variation) = self.forced_variations.get(config, experiment_key, user_id) {
            reasons.add_info(|| format!(
                "Variation \"{}\" is mapped to experiment \"{experiment_key}\" and user \"{user_id}\" in the forced variation map.",
                variation.key
            ));
            return Ok(Some(ExperimentDecision {
                variation,
                source: DecisionSource::Whitelist,
                cmab_uuid: None,
            }));
        }

        if let Some(variation) = whitelisted_variation(experiment, user_id, reasons) {
            return Ok(Some(ExperimentDecision {
                variation,
                source: DecisionSource::Whitelist,
                cmab_uuid: None,
            }));
        }

        // Bandit decisions are kept sticky by the bandit cache, not by the profile.
        let use_profile = experiment.cmab.is_none()
            && !options.contains(&DecideOption::IgnoreUserProfileService);

        let profile = if use_profile {
            self.load_profile(user_id, reasons)
        } else {
            None
        };

        if let Some(profile) = &profile {
            if let Some(variation_id) = profile.variation_id(&experiment.id) {
                match experiment.variation_by_id(variation_id) {
                    Some(variation) => {
                        log::debug!(target: "decision_core",
                                    experiment_key,
                                    user_id,
                                    variation_key = variation.key.as_str();
                                    "found variation in user profile");
                        reasons.add_info(|| format!(
                            "Returning previously activated variation \"{}\" of experiment \"{experiment_key}\" for user \"{user_id}\" from user profile.",
                            variation.key
                        ));
                        return Ok(Some(ExperimentDecision {
                            variation,
                            source: DecisionSource::CachedProfile,
                            cmab_uuid: None,
                        }));
                    }
                    None => {
                        reasons.add_info(|| format!(
                            "User \"{user_id}\" was previously bucketed into variation with ID \"{variation_id}\" for experiment \"{experiment_key}\", but no matching variation was found."
                        ));
                    }
                }
            }
        }

        if !audience_allows(config, experiment, user, reasons) {
            reasons.add_info(|| format!(
                "User \"{user_id}\" does not meet conditions to be in experiment \"{experiment_key}\"."
            ));
            return Ok(None);
        }

        let bucketing_id = user.bucketing_id();

        if let Some(cmab) = &experiment.cmab {
            if let Err(not_bucketed) =
                bucketer::bucket_cmab_traffic(config, experiment, cmab, bucketing_id)
            {
                log::trace!(target: "decision_core", experiment_key, user_id; "{not_bucketed}");
                reasons.add_info(|| format!(
                    "User \"{user_id}\" is not in the bandit traffic of experiment \"{experiment_key}\"."
                ));
                return Ok(None);
            }

            let cmab_service = self.cmab_service.as_ref().ok_or(CmabError::NotConfigured)?;
            let decision = cmab_service
                .get_decision(config, user, &experiment.id, options)
                .await?;
            let variation = experiment
                .variation_by_id(&decision.variation_id)
                .ok_or_else(|| CmabError::UnknownVariation {
                    experiment_key: experiment.key.clone(),
                    variation_id: decision.variation_id.clone(),
                })?;

            log::debug!(target: "decision_core",
                        experiment_key,
                        user_id,
                        variation_key = variation.key.as_str(),
                        cmab_uuid = decision.cmab_uuid.as_str();
                        "bandit chose variation");
            reasons.add_info(|| format!(
                "User \"{user_id}\" is in variation \"{}\" of bandit experiment \"{experiment_key}\".",
                variation.key
            ));
            return Ok(Some(ExperimentDecision {
                variation,
                source: DecisionSource::Cmab,
                cmab_uuid: Some(decision.cmab_uuid),
            }));
        }

        match bucketer::bucket_experiment(config, experiment, bucketing_id) {
            Ok(variation) => {
                log::debug!(target: "decision_core",
                            experiment_key,
                            user_id,
                            variation_key = variation.key.as_str();
                            "bucketed user");
                reasons.add_info(|| format!(
                    "User \"{user_id}\" is in variation \"{}\" of experiment \"{experiment_key}\".",
                    variation.key
                ));
                if use_profile {
                    self.save_profile(profile, user_id, experiment, variation, reasons);
                }
                Ok(Some(ExperimentDecision {
                    variation,
                    source: DecisionSource::Bucketed,
                    cmab_uuid: None,
                }))
            }
            Err(not_bucketed) => {
                log::trace!(target: "decision_core", experiment_key, user_id; "{not_bucketed}");
                reasons.add_info(|| format!("User \"{user_id}\" is in no variation: {not_bucketed}."));
                Ok(None)
            }
        }
    }

    /// Resolve the variation of `user` for a feature flag.
    ///
    /// A failed bandit call ends the resolution with an error instead of falling through to the
    /// rollout.
    pub async fn get_variation_for_feature<'a>(
        &self,
        config: &'a ProjectConfig,
        flag: &'a FeatureFlag,
        user: &UserContext,
        options: &[DecideOption],
        reasons: &mut DecisionReasons,
    ) -> Result<FeatureDecision<'a>> {
        let flag_key = flag.key.as_str();

        if let Some(variation) = forced_flag_variation(config, flag, user, reasons) {
            return Ok(FeatureDecision::forced(None, variation));
        }

        for experiment_id in &flag.experiment_ids {
            let Some(experiment) = config.experiment_by_id(experiment_id) else {
                log::warn!(target: "decision_core",
                           flag_key,
                           experiment_id = experiment_id.as_str();
                           "flag references unknown experiment");
                reasons.add_error(Error::ExperimentNotFound(experiment_id.clone()).to_string());
                continue;
            };

            if let Some(variation) = forced_rule_variation(flag, experiment, user, reasons) {
                return Ok(FeatureDecision::forced(Some(experiment), variation));
            }

            if let Some(decision) = self
                .get_variation(config, experiment, user, options, reasons)
                .await?
            {
                return Ok(FeatureDecision {
                    rule: Some(experiment),
                    variation: Some(decision.variation),
                    source: decision.source,
                    cmab_uuid: decision.cmab_uuid,
                });
            }
        }

        self.get_variation_from_rollout(config, flag, user, reasons)
    }

    /// Walk the rollout rules of the flag.
    ///
    /// Every rule must pass its audience. A user that passes the audience of a rule but is not
    /// in its traffic skips straight to the last rule.
    fn get_variation_from_rollout<'a>(
        &self,
        config: &'a ProjectConfig,
        flag: &'a FeatureFlag,
        user: &UserContext,
        reasons: &mut DecisionReasons,
    ) -> Result<FeatureDecision<'a>> {
        let flag_key = flag.key.as_str();
        let user_id = user.user_id();

        if flag.rollout_id.trim().is_empty() {
            log::trace!(target: "decision_core", flag_key, user_id; "flag has no rollout");
            reasons.add_info(|| format!("The feature flag \"{flag_key}\" is not used in a rollout."));
            return Ok(FeatureDecision::none());
        }
        let rollout = config
            .rollout_by_id(&flag.rollout_id)
            .ok_or_else(|| Error::RolloutNotFound(flag.rollout_id.clone()))?;

        let rules = &rollout.experiments;
        let bucketing_id = user.bucketing_id();
        let mut index = 0;
        while let Some(rule) = rules.get(index) {
            let is_last = index + 1 == rules.len();
            let rule_key = rule.key.as_str();

            if let Some(variation) = forced_rule_variation(flag, rule, user, reasons) {
                return Ok(FeatureDecision::forced(Some(rule), variation));
            }

            if !audience_allows(config, rule, user, reasons) {
                reasons.add_info(|| format!(
                    "User \"{user_id}\" does not meet conditions for targeting rule \"{rule_key}\"."
                ));
                index += 1;
                continue;
            }

            match bucketer::bucket_experiment(config, rule, bucketing_id) {
                Ok(variation) => {
                    log::debug!(target: "decision_core",
                                flag_key,
                                rule_key,
                                user_id,
                                variation_key = variation.key.as_str();
                                "bucketed user into rollout rule");
                    reasons.add_info(|| format!(
                        "User \"{user_id}\" is in variation \"{}\" of targeting rule \"{rule_key}\".",
                        variation.key
                    ));
                    return Ok(FeatureDecision {
                        rule: Some(rule),
                        variation: Some(variation),
                        source: DecisionSource::Rollout,
                        cmab_uuid: None,
                    });
                }
                Err(not_bucketed) => {
                    log::trace!(target: "decision_core", flag_key, rule_key, user_id; "{not_bucketed}");
                    reasons.add_info(|| format!(
                        "User \"{user_id}\" is not in the traffic of targeting rule \"{rule_key}\"."
                    ));
                    if is_last {
                        break;
                    }
                    index = rules.len() - 1;
                }
            }
        }

        reasons.add_info(|| format!(
            "User \"{user_id}\" is not bucketed into any rollout rule of flag \"{flag_key}\"."
        ));
        Ok(FeatureDecision::none())
    }

    fn load_profile(&self, user_id: &str, reasons: &mut DecisionReasons) -> Option<UserProfile> {
        let service = self.user_profile_service.as_ref()?;
        match service.lookup(user_id) {
            Ok(Some(profile)) => Some(profile),
            Ok(None) => Some(UserProfile::new(user_id)),
            Err(err) => {
                log::warn!(target: "decision_core", user_id; "failed to look up user profile: {err}");
                reasons.add_info(|| format!("Unable to look up user profile of user \"{user_id}\"."));
                // Treated as a miss: the new bucketing result is still saved.
                Some(UserProfile::new(user_id))
            }
        }
    }

    fn save_profile(
        &self,
        profile: Option<UserProfile>,
        user_id: &str,
        experiment: &Experiment,
        variation: &Variation,
        reasons: &mut DecisionReasons,
    ) {
        let (Some(service), Some(mut profile)) = (&self.user_profile_service, profile) else {
            return;
        };
        profile.set_variation_id(experiment.id.clone(), variation.id.clone());
        match service.save(profile) {
            Ok(()) => {
                log::trace!(target: "decision_core",
                            user_id,
                            experiment_key = experiment.key.as_str();
                            "saved user profile");
            }
            Err(err) => {
                log::warn!(target: "decision_core", user_id; "failed to save user profile: {err}");
                reasons.add_info(|| format!("Unable to save user profile of user \"{user_id}\"."));
            }
        }
    }
}

/// Variation from the datafile whitelist of the experiment. Keys that do not name a variation
/// are ignored.
fn whitelisted_variation<'a>(
    experiment: &'a Experiment,
    user_id: &str,
    reasons: &mut DecisionReasons,
) -> Option<&'a Variation> {
    let variation_key = experiment.forced_variations.get(user_id)?;
    match experiment.variation_by_key(variation_key) {
        Some(variation) => {
            reasons.add_info(|| format!(
                "User \"{user_id}\" is forced in variation \"{variation_key}\" of experiment \"{}\".",
                experiment.key
            ));
            Some(variation)
        }
        None => {
            log::warn!(target: "decision_core",
                       experiment_key = experiment.key.as_str(),
                       user_id,
                       variation_key = variation_key.as_str();
                       "whitelisted variation not found");
            reasons.add_info(|| format!(
                "Variation \"{variation_key}\" forced for user \"{user_id}\" does not exist in experiment \"{}\".",
                experiment.key
            ));
            None
        }
    }
}

fn forced_flag_variation<'a>(
    config: &'a ProjectConfig,
    flag: &FeatureFlag,
    user: &UserContext,
    reasons: &mut DecisionReasons,
) -> Option<&'a Variation> {
    let variation_key = user.get_forced_decision(&ForcedDecisionKey::flag(flag.key.clone()))?;
    let variation = config.flag_variation_by_key(&flag.key, &variation_key);
    forced_decision_reason(
        reasons,
        &flag.key,
        None,
        user.user_id(),
        &variation_key,
        variation.is_some(),
    );
    variation
}

fn forced_rule_variation<'a>(
    flag: &FeatureFlag,
    rule: &'a Experiment,
    user: &UserContext,
    reasons: &mut DecisionReasons,
) -> Option<&'a Variation> {
    let key = ForcedDecisionKey::rule(flag.key.clone(), rule.key.clone());
    let variation_key = user.get_forced_decision(&key)?;
    let variation = rule.variation_by_key(&variation_key);
    forced_decision_reason(
        reasons,
        &flag.key,
        Some(&rule.key),
        user.user_id(),
        &variation_key,
        variation.is_some(),
    );
    variation
}

fn forced_decision_reason(
    reasons: &mut DecisionReasons,
    flag_key: &str,
    rule_key: Option<&str>,
    user_id: &str,
    variation_key: &str,
    valid: bool,
) {
    let target = match rule_key {
        Some(rule_key) => format!("flag ({flag_key}), rule ({rule_key})"),
        None => format!("flag ({flag_key})"),
    };
    if valid {
        log::debug!(target: "decision_core", flag_key, rule_key:?, user_id, variation_key;
                    "using forced decision");
        reasons.add_info(|| format!(
            "Variation ({variation_key}) is mapped to {target} and user ({user_id}) in the forced decision map."
        ));
    } else {
        log::warn!(target: "decision_core", flag_key, rule_key:?, user_id, variation_key;
                   "forced decision names unknown variation");
        reasons.add_info(|| format!(
            "Invalid variation is mapped to {target} and user ({user_id}) in the forced decision map."
        ));
    }
}

/// Whether the user passes the audience of the experiment or rule.
///
/// Full audience conditions take precedence over the audience id list. An empty condition
/// always passes. Conditions that cannot be decided do not pass.
fn audience_allows(
    config: &ProjectConfig,
    experiment: &Experiment,
    user: &UserContext,
    reasons: &mut DecisionReasons,
) -> bool {
    let audience_ids;
    let conditions = match &experiment.audience_conditions {
        Some(ConditionNode::List(items)) if items.is_empty() => return true,
        Some(conditions) => conditions,
        None if experiment.audience_ids.is_empty() => return true,
        None => {
            audience_ids = ConditionNode::List(
                std::iter::once(ConditionNode::Operator(LogicalOperator::Or))
                    .chain(experiment.audience_ids.iter().cloned().map(ConditionNode::AudienceId))
                    .collect(),
            );
            &audience_ids
        }
    };

    match audience::evaluate(conditions, user, config) {
        Ok(result) => {
            log::trace!(target: "decision_core",
                        experiment_key = experiment.key.as_str(),
                        user_id = user.user_id(),
                        result;
                        "evaluated audience conditions");
            reasons.add_info(|| format!(
                "Audiences for experiment \"{}\" collectively evaluated to {result}.",
                experiment.key
            ));
            result
        }
        Err(err) => {
            log::debug!(target: "decision_core",
                        experiment_key = experiment.key.as_str(),
                        user_id = user.user_id();
                        "audience conditions could not be evaluated: {err}");
            reasons.add_info(|| format!(
                "Audiences for experiment \"{}\" could not be evaluated: {err}.",
                experiment.key
            ));
            false
        }
    }
}
