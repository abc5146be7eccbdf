use std::sync::Arc;

use crate::{
    cmab::CmabService,
    decision::{DecideOption, UserProfileService},
    ConfigurationStore, DecisionEngine,
};

/// Configuration for [`DecisionEngine`].
pub struct DecisionEngineConfig {
    pub(crate) configuration_store: Arc<ConfigurationStore>,
    pub(crate) user_profile_service: Option<Arc<dyn UserProfileService>>,
    pub(crate) cmab_service: Option<Arc<CmabService>>,
    pub(crate) default_options: Vec<DecideOption>,
}

impl DecisionEngineConfig {
    /// Create a configuration reading datafiles from `configuration_store`.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use decision_core::{ConfigurationStore, DecisionEngineConfig};
    /// let store = Arc::new(ConfigurationStore::new());
    /// DecisionEngineConfig::new(store);
    /// ```
    pub fn new(configuration_store: Arc<ConfigurationStore>) -> Self {
        DecisionEngineConfig {
            configuration_store,
            user_profile_service: None,
            cmab_service: None,
            default_options: Vec::new(),
        }
    }

    /// Set a user profile service to make bucketing sticky across configuration changes.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use decision_core::{ConfigurationStore, DecisionEngineConfig, InMemoryUserProfileService};
    /// let config = DecisionEngineConfig::new(Arc::new(ConfigurationStore::new()))
    ///     .with_user_profile_service(Arc::new(InMemoryUserProfileService::new()));
    /// ```
    pub fn with_user_profile_service(
        mut self,
        user_profile_service: Arc<dyn UserProfileService>,
    ) -> Self {
        self.user_profile_service = Some(user_profile_service);
        self
    }

    /// Set the service resolving contextual bandit experiments. Without it, bandit experiments
    /// decide to no variation with an error reason.
    pub fn with_cmab_service(mut self, cmab_service: Arc<CmabService>) -> Self {
        self.cmab_service = Some(cmab_service);
        self
    }

    /// Options applied to every decision in addition to the per-call ones.
    pub fn with_default_options(mut self, options: impl IntoIterator<Item = DecideOption>) -> Self {
        self.default_options = options.into_iter().collect();
        self
    }

    /// Create a new [`DecisionEngine`] using the specified configuration.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use decision_core::{ConfigurationStore, DecisionEngine, DecisionEngineConfig};
    /// let engine: DecisionEngine =
    ///     DecisionEngineConfig::new(Arc::new(ConfigurationStore::new())).to_engine();
    /// ```
    pub fn to_engine(self) -> DecisionEngine {
        DecisionEngine::new(self)
    }
}
