use std::{collections::HashMap, sync::Arc};

use crate::{
    decision::{DecideOption, Decision, DecisionReasons, DecisionService, FeatureDecision},
    project_config::ProjectConfig,
    user_context::UserContext,
    ConfigurationStore, DecisionEngineConfig, Error, Result,
};

/// Decides flags and experiments for users against the current datafile.
///
/// In order to create an engine instance, first create [`DecisionEngineConfig`].
///
/// Decisions never fail: problems are reported in [`Decision::reasons`] and degrade the decision
/// to "no variation, disabled".
pub struct DecisionEngine {
    configuration_store: Arc<ConfigurationStore>,
    decision_service: DecisionService,
    default_options: Vec<DecideOption>,
}

impl DecisionEngine {
    /// Create a new `DecisionEngine` using the specified configuration.
    pub fn new(config: DecisionEngineConfig) -> Self {
        DecisionEngine {
            configuration_store: config.configuration_store,
            decision_service: DecisionService::new(
                config.user_profile_service,
                config.cmab_service,
            ),
            default_options: config.default_options,
        }
    }

    pub fn configuration_store(&self) -> &Arc<ConfigurationStore> {
        &self.configuration_store
    }

    /// Decide a feature flag, or a standalone experiment, for `user`.
    ///
    /// Only contextual bandit experiments actually wait on anything; every other decision
    /// completes without yielding.
    pub async fn decide(
        &self,
        user: &UserContext,
        key: &str,
        options: &[DecideOption],
    ) -> Decision {
        let options = self.merge_options(options);
        let Some(config) = self.configuration_store.get_configuration() else {
            log::warn!(target: "decision_core", flag_key = key, user_id = user.user_id();
                       "deciding before configuration has been set");
            let reasons = DecisionReasons::new(&options);
            return failed(user, key, &options, reasons, Error::ConfigurationMissing);
        };
        self.decide_with(&config, user, key, &options).await
    }

    /// Decide each of `keys`. With [`DecideOption::EnabledFlagsOnly`], disabled decisions are
    /// left out.
    pub async fn decide_for_keys<K: AsRef<str>>(
        &self,
        user: &UserContext,
        keys: impl IntoIterator<Item = K>,
        options: &[DecideOption],
    ) -> HashMap<String, Decision> {
        let options = self.merge_options(options);
        let enabled_only = options.contains(&DecideOption::EnabledFlagsOnly);
        // One snapshot for all keys, so that the decisions are consistent with each other.
        let config = self.configuration_store.get_configuration();

        let mut decisions = HashMap::new();
        for key in keys {
            let key = key.as_ref();
            let decision = match &config {
                Some(config) => self.decide_with(config, user, key, &options).await,
                None => {
                    let reasons = DecisionReasons::new(&options);
                    failed(user, key, &options, reasons, Error::ConfigurationMissing)
                }
            };
            if enabled_only && !decision.enabled {
                continue;
            }
            decisions.insert(key.to_owned(), decision);
        }
        decisions
    }

    /// Decide every feature flag of the current configuration.
    pub async fn decide_all(
        &self,
        user: &UserContext,
        options: &[DecideOption],
    ) -> HashMap<String, Decision> {
        let Some(config) = self.configuration_store.get_configuration() else {
            log::warn!(target: "decision_core", user_id = user.user_id();
                       "deciding before configuration has been set");
            return HashMap::new();
        };
        let keys = config
            .feature_flags()
            .map(|flag| flag.key.clone())
            .collect::<Vec<_>>();
        self.decide_for_keys(user, keys, options).await
    }

    /// Force `variation_key` for `user_id` in an experiment, or clear it with `None`. Returns
    /// `false` if there is no configuration or the keys are unknown.
    pub fn set_forced_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> bool {
        let Some(config) = self.configuration_store.get_configuration() else {
            return false;
        };
        self.decision_service
            .forced_variations()
            .set(&config, experiment_key, user_id, variation_key)
    }

    /// Key of the variation forced for `user_id` in an experiment.
    pub fn get_forced_variation(&self, experiment_key: &str, user_id: &str) -> Option<String> {
        let config = self.configuration_store.get_configuration()?;
        self.decision_service
            .forced_variations()
            .get(&config, experiment_key, user_id)
            .map(|variation| variation.key.clone())
    }

    async fn decide_with(
        &self,
        config: &ProjectConfig,
        user: &UserContext,
        key: &str,
        options: &[DecideOption],
    ) -> Decision {
        let mut reasons = DecisionReasons::new(options);
        match self.resolve(config, user, key, options, &mut reasons).await {
            Ok(decision) => {
                let decision = Decision::new(user.user_id(), key, decision, options, reasons);
                log::trace!(target: "decision_core",
                            flag_key = key,
                            user_id = user.user_id(),
                            decision:serde;
                            "decided");
                decision
            }
            Err(err) => failed(user, key, options, reasons, err),
        }
    }

    async fn resolve<'a>(
        &self,
        config: &'a ProjectConfig,
        user: &UserContext,
        key: &str,
        options: &[DecideOption],
        reasons: &mut DecisionReasons,
    ) -> Result<FeatureDecision<'a>> {
        if let Some(flag) = config.feature_flag_by_key(key) {
            return self
                .decision_service
                .get_variation_for_feature(config, flag, user, options, reasons)
                .await;
        }

        let experiment = config
            .experiment_by_key(key)
            .ok_or_else(|| Error::FlagNotFound(key.to_owned()))?;
        let decision = self
            .decision_service
            .get_variation(config, experiment, user, options, reasons)
            .await?;

        Ok(match decision {
            Some(decision) => FeatureDecision {
                rule: Some(experiment),
                variation: Some(decision.variation),
                source: decision.source,
                cmab_uuid: decision.cmab_uuid,
            },
            None => FeatureDecision::none(),
        })
    }

    fn merge_options(&self, options: &[DecideOption]) -> Vec<DecideOption> {
        let mut merged = self.default_options.clone();
        for option in options {
            if !merged.contains(option) {
                merged.push(*option);
            }
        }
        merged
    }
}

fn failed(
    user: &UserContext,
    key: &str,
    options: &[DecideOption],
    mut reasons: DecisionReasons,
    err: Error,
) -> Decision {
    if err.is_normal() {
        log::trace!(target: "decision_core", flag_key = key, user_id = user.user_id(); "{err}");
    } else {
        log::warn!(target: "decision_core", flag_key = key, user_id = user.user_id();
                   "error occurred while deciding: {err}");
    }
    reasons.add_error(err.to_string());
    Decision::empty(user.user_id(), key, options, reasons)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{
        cmab::{CmabConfig, CmabService, RetryConfig},
        decision::{DecideOption, DecisionSource},
        user_context::UserContext,
        Attributes, ConfigurationStore, DecisionEngine, DecisionEngineConfig, TypedValue,
    };

    fn store() -> Arc<ConfigurationStore> {
        let store = Arc::new(ConfigurationStore::new());
        store
            .set_datafile(&std::fs::read("tests/data/datafile.json").unwrap())
            .unwrap();
        store
    }

    fn engine() -> DecisionEngine {
        DecisionEngineConfig::new(store()).to_engine()
    }

    fn adult(user_id: &str) -> UserContext {
        let attributes: Attributes = [("age".to_owned(), TypedValue::Int(30))].into_iter().collect();
        UserContext::new(user_id, attributes)
    }

    #[tokio::test]
    async fn returns_empty_decision_while_no_configuration() {
        let _ = env_logger::builder().is_test(true).try_init();
        let engine = DecisionEngineConfig::new(Arc::new(ConfigurationStore::new())).to_engine();

        let decision = engine.decide(&adult("user-1"), "checkout_flag", &[]).await;

        assert!(!decision.has_variation());
        assert!(!decision.enabled);
        assert_eq!(decision.source, DecisionSource::NoVariation);
        assert_eq!(decision.reasons, vec!["configuration missing".to_owned()]);
        assert!(engine.decide_all(&adult("user-1"), &[]).await.is_empty());
        assert!(!engine.set_forced_variation("checkout_test", "user-1", Some("treatment")));
    }

    #[tokio::test]
    async fn decides_flag() {
        let engine = engine();

        let decision = engine.decide(&adult("user-4"), "checkout_flag", &[]).await;

        assert_eq!(decision.user_id, "user-4");
        assert_eq!(decision.flag_key, "checkout_flag");
        assert_eq!(decision.variation_key.as_deref(), Some("treatment"));
        assert_eq!(decision.variation_id.as_deref(), Some("var_treatment"));
        assert_eq!(decision.rule_key.as_deref(), Some("checkout_test"));
        assert_eq!(decision.rule_id.as_deref(), Some("exp_checkout"));
        assert_eq!(decision.source, DecisionSource::Bucketed);
        assert!(decision.enabled);
        assert!(decision.send_event);
        assert!(!decision.exclude_variables);
        assert!(decision.cmab_uuid.is_none());
        assert!(decision.reasons.is_empty());
    }

    #[tokio::test]
    async fn decides_standalone_experiment() {
        let engine = engine();

        let decision = engine.decide(&adult("user-1"), "checkout_test", &[]).await;

        assert_eq!(decision.flag_key, "checkout_test");
        assert_eq!(decision.variation_key.as_deref(), Some("control"));
        assert_eq!(decision.rule_id.as_deref(), Some("exp_checkout"));
        assert!(!decision.enabled);
    }

    #[tokio::test]
    async fn unknown_key_is_reported() {
        let engine = engine();

        let decision = engine.decide(&adult("user-1"), "nope", &[]).await;

        assert!(!decision.has_variation());
        assert_eq!(decision.reasons, vec!["flag not found: nope".to_owned()]);
    }

    #[tokio::test]
    async fn options_shape_the_decision() {
        let engine = DecisionEngineConfig::new(store())
            .with_default_options([DecideOption::IncludeReasons])
            .to_engine();

        let decision = engine
            .decide(
                &adult("user-1"),
                "checkout_flag",
                &[DecideOption::DisableDecisionEvent, DecideOption::ExcludeVariables],
            )
            .await;

        assert!(!decision.send_event);
        assert!(decision.exclude_variables);
        assert!(!decision.reasons.is_empty());
    }

    #[tokio::test]
    async fn decide_all_and_enabled_flags_only() {
        let engine = engine();
        let user = adult("user-4");

        let all = engine.decide_all(&user, &[]).await;
        let mut keys = all.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, ["checkout_flag", "cmab_flag", "dark_flag", "group_flag"]);

        let enabled = engine
            .decide_all(&user, &[DecideOption::EnabledFlagsOnly])
            .await;
        let enabled = enabled
            .into_iter()
            .map(|(key, decision)| (key, decision.variation_key.unwrap_or_default()))
            .collect::<HashMap<_, _>>();
        assert_eq!(
            enabled,
            HashMap::from([
                ("checkout_flag".to_owned(), "treatment".to_owned()),
                ("group_flag".to_owned(), "g1".to_owned()),
            ])
        );

        let some = engine
            .decide_for_keys(&user, ["checkout_flag", "nope"], &[])
            .await;
        assert_eq!(some.len(), 2);
        assert!(!some["nope"].enabled);
    }

    #[tokio::test]
    async fn forced_variations_through_engine() {
        let engine = engine();

        assert!(engine.set_forced_variation("checkout_test", "user-4", Some("control")));
        assert_eq!(
            engine.get_forced_variation("checkout_test", "user-4").as_deref(),
            Some("control")
        );

        let decision = engine.decide(&adult("user-4"), "checkout_flag", &[]).await;
        assert_eq!(decision.variation_key.as_deref(), Some("control"));
        assert_eq!(decision.source, DecisionSource::Whitelist);

        assert!(engine.set_forced_variation("checkout_test", "user-4", None));
        assert_eq!(engine.get_forced_variation("checkout_test", "user-4"), None);
    }

    #[test]
    fn decision_wire_format() {
        let decision = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(engine().decide(&adult("user-4"), "checkout_flag", &[]));

        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["flagKey"], json!("checkout_flag"));
        assert_eq!(value["ruleKey"], json!("checkout_test"));
        assert_eq!(value["source"], json!("bucketed"));
        assert_eq!(value["cmabUuid"], json!(null));
        assert!(value["decidedAt"].is_string());
    }

    fn cmab_engine(server: &MockServer) -> DecisionEngine {
        let config = CmabConfig::new()
            .with_prediction_endpoint(format!("{}/predict", server.uri()))
            .with_request_timeout(Duration::from_millis(500))
            .with_retry(
                RetryConfig::new()
                    .with_max_retries(1)
                    .with_initial_backoff(Duration::from_millis(1)),
            );
        let cmab_service = CmabService::from_config(&config).unwrap();
        DecisionEngineConfig::new(store())
            .with_cmab_service(Arc::new(cmab_service))
            .to_engine()
    }

    #[tokio::test]
    async fn bandit_decision_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict/exp_cmab"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"predictions": [{"variation_id": "var_cmab_a"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;
        let engine = cmab_engine(&server);

        let first = engine.decide(&adult("user-1"), "cmab_flag", &[]).await;
        let second = engine.decide(&adult("user-1"), "cmab_flag", &[]).await;

        assert_eq!(first.source, DecisionSource::Cmab);
        assert_eq!(first.variation_key.as_deref(), Some("cmab_a"));
        assert_eq!(first.rule_key.as_deref(), Some("cmab_test"));
        assert!(first.enabled);
        assert!(first.cmab_uuid.is_some());
        // Served from the bandit cache.
        assert_eq!(first.cmab_uuid, second.cmab_uuid);
    }

    #[tokio::test]
    async fn bandit_failure_disables_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;
        let engine = cmab_engine(&server);

        let decision = engine.decide(&adult("user-1"), "cmab_flag", &[]).await;

        assert!(!decision.has_variation());
        assert!(!decision.enabled);
        assert_eq!(decision.source, DecisionSource::NoVariation);
        assert_eq!(decision.reasons.len(), 1);
        assert!(decision.reasons[0].contains("after 2 attempts"));
    }
}
