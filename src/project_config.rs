//! Parsed and indexed datafile.
mod models;

use std::collections::HashMap;

pub use models::{
    Attribute, Cmab, Datafile, Experiment, ExperimentStatus, FeatureFlag, Group, GroupPolicy,
    Rollout, TrafficAllocation, TryParse, Variation,
};

use serde::Deserialize;

use crate::{
    audience::{Audience, AudienceLookup},
    Error, Result,
};

/// Datafile schema versions this engine understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["2", "3", "4"];

/// Read-only view over a datafile with lookups by id and key.
///
/// Built once per datafile revision and shared between decisions (usually through
/// [`ConfigurationStore`](crate::ConfigurationStore)).
#[derive(Debug)]
pub struct ProjectConfig {
    version: String,
    project_id: String,
    revision: String,
    experiments: HashMap<String, Experiment>,
    experiment_ids_by_key: HashMap<String, String>,
    groups: HashMap<String, Group>,
    audiences: HashMap<String, Audience>,
    attributes_by_key: HashMap<String, Attribute>,
    attribute_keys_by_id: HashMap<String, String>,
    feature_flags: HashMap<String, FeatureFlag>,
    rollouts: HashMap<String, Rollout>,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: String,
}

impl ProjectConfig {
    /// Parse a datafile, rejecting schema versions that are not supported.
    pub fn from_json(datafile: &[u8]) -> Result<ProjectConfig> {
        // Checking the version first so that a datafile of an unknown schema reports the
        // version rather than a parse error somewhere deep inside.
        let VersionProbe { version } = serde_json::from_slice(datafile)?;
        if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
            log::warn!(target: "decision_core", version = version.as_str(); "unsupported datafile version");
            return Err(Error::UnsupportedDatafileVersion { version });
        }

        let datafile: Datafile = serde_json::from_slice(datafile)?;
        Ok(ProjectConfig::from_datafile(datafile))
    }

    pub fn from_datafile(datafile: Datafile) -> ProjectConfig {
        let mut experiments = HashMap::new();
        for experiment in datafile.experiments {
            experiments.insert(experiment.id.clone(), experiment);
        }

        let mut groups = HashMap::new();
        for group in datafile.groups {
            for experiment in &group.experiments {
                let mut experiment = experiment.clone();
                experiment.group_id = Some(group.id.clone());
                experiments.insert(experiment.id.clone(), experiment);
            }
            groups.insert(group.id.clone(), group);
        }

        let experiment_ids_by_key = experiments
            .values()
            .map(|experiment| (experiment.key.clone(), experiment.id.clone()))
            .collect();

        let mut audiences = HashMap::new();
        for audience in datafile
            .audiences
            .into_iter()
            .chain(datafile.typed_audiences)
        {
            match audience {
                TryParse::Parsed(audience) => {
                    audiences.insert(audience.id.clone(), audience);
                }
                TryParse::ParseFailed(value) => {
                    log::warn!(target: "decision_core",
                               audience:serde = value;
                               "failed to parse audience, conditions referencing it will not evaluate");
                }
            }
        }

        let attribute_keys_by_id = datafile
            .attributes
            .iter()
            .map(|attribute| (attribute.id.clone(), attribute.key.clone()))
            .collect();
        let attributes_by_key = datafile
            .attributes
            .into_iter()
            .map(|attribute| (attribute.key.clone(), attribute))
            .collect();

        let feature_flags = datafile
            .feature_flags
            .into_iter()
            .map(|flag| (flag.key.clone(), flag))
            .collect();

        let rollouts = datafile
            .rollouts
            .into_iter()
            .map(|rollout| (rollout.id.clone(), rollout))
            .collect();

        ProjectConfig {
            version: datafile.version,
            project_id: datafile.project_id,
            revision: datafile.revision,
            experiments,
            experiment_ids_by_key,
            groups,
            audiences,
            attributes_by_key,
            attribute_keys_by_id,
            feature_flags,
            rollouts,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn experiment_by_id(&self, id: &str) -> Option<&Experiment> {
        self.experiments.get(id)
    }

    pub fn experiment_by_key(&self, key: &str) -> Option<&Experiment> {
        let id = self.experiment_ids_by_key.get(key)?;
        self.experiments.get(id)
    }

    pub fn group_by_id(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn attribute_by_key(&self, key: &str) -> Option<&Attribute> {
        self.attributes_by_key.get(key)
    }

    pub fn attribute_key_by_id(&self, id: &str) -> Option<&str> {
        self.attribute_keys_by_id.get(id).map(String::as_str)
    }

    pub fn feature_flag_by_key(&self, key: &str) -> Option<&FeatureFlag> {
        self.feature_flags.get(key)
    }

    pub fn feature_flags(&self) -> impl Iterator<Item = &FeatureFlag> {
        self.feature_flags.values()
    }

    /// Rollout by id. Surrounding whitespace is ignored and an empty id means "no rollout".
    pub fn rollout_by_id(&self, id: &str) -> Option<&Rollout> {
        let id = id.trim();
        if id.is_empty() {
            return None;
        }
        self.rollouts.get(id)
    }

    /// Find a variation by key among every rule (experiments and rollout rules) of a flag.
    pub fn flag_variation_by_key(&self, flag_key: &str, variation_key: &str) -> Option<&Variation> {
        let flag = self.feature_flag_by_key(flag_key)?;
        let experiment_rules = flag
            .experiment_ids
            .iter()
            .filter_map(|id| self.experiment_by_id(id));
        let rollout_rules = self
            .rollout_by_id(&flag.rollout_id)
            .into_iter()
            .flat_map(|rollout| rollout.experiments.iter());

        experiment_rules
            .chain(rollout_rules)
            .find_map(|rule| rule.variation_by_key(variation_key))
    }
}

/// Configuration built from `tests/data/datafile.json`.
#[cfg(test)]
pub(crate) fn test_config() -> ProjectConfig {
    let datafile = std::fs::read("tests/data/datafile.json").unwrap();
    ProjectConfig::from_json(&datafile).unwrap()
}

impl AudienceLookup for ProjectConfig {
    fn audience_by_id(&self, id: &str) -> Option<&Audience> {
        self.audiences.get(id)
    }
}
