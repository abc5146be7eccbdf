use std::sync::{Arc, RwLock};

use crate::{project_config::ProjectConfig, Result};

/// `ConfigurationStore` provides a Sync storage for the current datafile that allows concurrent
/// access for readers and writers.
///
/// Decisions take a snapshot of the configuration when they start, so a configuration swapped in
/// concurrently only affects decisions started afterwards.
#[derive(Debug, Default)]
pub struct ConfigurationStore {
    configuration: RwLock<Option<Arc<ProjectConfig>>>,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self {
            configuration: RwLock::new(None),
        }
    }

    pub fn get_configuration(&self) -> Option<Arc<ProjectConfig>> {
        // self.configuration.read() should always return Ok(). Err() is possible only if the lock
        // is poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let configuration = self.configuration.read().ok()?;
        configuration.clone()
    }

    /// Set new configuration, returning the previous one.
    pub fn set_configuration(&self, config: ProjectConfig) -> Option<Arc<ProjectConfig>> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Some(Arc::new(config));

        let mut configuration_slot = self.configuration.write().ok()?;
        std::mem::replace(&mut configuration_slot, new_value)
    }

    /// Parse `datafile` and make it the current configuration. On error, the current
    /// configuration is kept.
    pub fn set_datafile(&self, datafile: &[u8]) -> Result<()> {
        let config = ProjectConfig::from_json(datafile).inspect_err(|err| {
            log::warn!(target: "decision_core", "rejected datafile: {err}");
        })?;
        log::debug!(target: "decision_core",
                    revision = config.revision();
                    "updated configuration");
        self.set_configuration(config);
        Ok(())
    }
}
