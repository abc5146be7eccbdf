use std::{collections::HashMap, sync::RwLock};

use crate::project_config::{ProjectConfig, Variation};

/// Runtime whitelist: user id to experiment id to variation id.
///
/// Entries are stored by id so that they keep pointing at the same variation when keys are
/// renamed in a later datafile revision.
#[derive(Debug, Default)]
pub struct ForcedVariations {
    map: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl ForcedVariations {
    pub fn new() -> ForcedVariations {
        ForcedVariations::default()
    }

    /// Force `variation_key` for `user_id` in the experiment, or clear the entry with `None`.
    ///
    /// Returns `false` if the experiment or variation does not exist or the key is blank.
    pub fn set(
        &self,
        config: &ProjectConfig,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> bool {
        let Some(experiment) = config.experiment_by_key(experiment_key.trim()) else {
            log::warn!(target: "decision_core", experiment_key, user_id;
                       "cannot force variation for unknown experiment");
            return false;
        };

        let Ok(mut map) = self.map.write() else {
            return false;
        };

        let Some(variation_key) = variation_key else {
            if let Some(experiments) = map.get_mut(user_id) {
                experiments.remove(&experiment.id);
            }
            return true;
        };

        let variation_key = variation_key.trim();
        if variation_key.is_empty() {
            return false;
        }
        let Some(variation) = experiment.variation_by_key(variation_key) else {
            log::warn!(target: "decision_core", experiment_key, user_id, variation_key;
                       "cannot force unknown variation");
            return false;
        };

        map.entry(user_id.to_owned())
            .or_default()
            .insert(experiment.id.clone(), variation.id.clone());
        log::debug!(target: "decision_core", experiment_key, user_id, variation_key;
                    "set forced variation");
        true
    }

    /// Variation forced for `user_id` in the experiment, if it still exists.
    pub fn get<'a>(
        &self,
        config: &'a ProjectConfig,
        experiment_key: &str,
        user_id: &str,
    ) -> Option<&'a Variation> {
        let experiment = config.experiment_by_key(experiment_key.trim())?;
        let map = self.map.read().ok()?;
        let variation_id = map.get(user_id)?.get(&experiment.id)?;
        experiment.variation_by_id(variation_id)
    }
}
