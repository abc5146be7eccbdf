use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::audience::{Audience, ConditionNode};

/// Datafile as published by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datafile {
    pub version: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Audiences are wrapped in `TryParse` so that one audience in a newer format does not make
    /// the whole datafile unusable. Conditions referencing it fail to evaluate instead.
    #[serde(default)]
    pub audiences: Vec<TryParse<Audience>>,
    /// Audiences with structured conditions. Take precedence over `audiences` with the same id.
    #[serde(default)]
    pub typed_audiences: Vec<TryParse<Audience>>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub rollouts: Vec<Rollout>,
    #[serde(default)]
    pub feature_flags: Vec<FeatureFlag>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExperimentStatus {
    Running,
    Launched,
    Paused,
    NotStarted,
    Archived,
    Unknown(String),
}

impl From<String> for ExperimentStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Running" => ExperimentStatus::Running,
            "Launched" => ExperimentStatus::Launched,
            "Paused" => ExperimentStatus::Paused,
            "Not started" => ExperimentStatus::NotStarted,
            "Archived" => ExperimentStatus::Archived,
            _ => ExperimentStatus::Unknown(value),
        }
    }
}

impl From<ExperimentStatus> for String {
    fn from(value: ExperimentStatus) -> Self {
        match value {
            ExperimentStatus::Running => "Running".to_owned(),
            ExperimentStatus::Launched => "Launched".to_owned(),
            ExperimentStatus::Paused => "Paused".to_owned(),
            ExperimentStatus::NotStarted => "Not started".to_owned(),
            ExperimentStatus::Archived => "Archived".to_owned(),
            ExperimentStatus::Unknown(s) => s,
        }
    }
}

/// An experiment, or a rule of a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub key: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub layer_id: String,
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    #[serde(default)]
    pub audience_ids: Vec<String>,
    /// Takes precedence over `audience_ids` when present.
    #[serde(default)]
    pub audience_conditions: Option<ConditionNode>,
    /// Datafile whitelist: user id to variation key.
    #[serde(default)]
    pub forced_variations: HashMap<String, String>,
    #[serde(default)]
    pub cmab: Option<Cmab>,
    /// Mutex group this experiment belongs to. Filled in while indexing the datafile.
    #[serde(skip)]
    pub group_id: Option<String>,
}

impl Experiment {
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    pub fn variation_by_id(&self, id: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == id)
    }

    pub fn variation_by_key(&self, key: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub feature_enabled: bool,
}

/// Upper bound (inclusive) of a bucket range and the entity (variation or experiment) it maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficAllocation {
    pub entity_id: String,
    pub end_of_range: u32,
}

/// Contextual bandit descriptor of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cmab {
    /// Share of traffic (out of 10000) that enters the bandit.
    pub traffic_allocation: u32,
    /// Ids of the attributes sent to the prediction endpoint.
    #[serde(default)]
    pub attribute_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GroupPolicy {
    /// Experiments are mutually exclusive.
    Random,
    /// Experiments may overlap; the group does not take part in bucketing.
    Overlapping,
    Unknown(String),
}

impl From<String> for GroupPolicy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "random" => GroupPolicy::Random,
            "overlapping" => GroupPolicy::Overlapping,
            _ => GroupPolicy::Unknown(value),
        }
    }
}

impl From<GroupPolicy> for String {
    fn from(value: GroupPolicy) -> Self {
        match value {
            GroupPolicy::Random => "random".to_owned(),
            GroupPolicy::Overlapping => "overlapping".to_owned(),
            GroupPolicy::Unknown(s) => s,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub policy: GroupPolicy,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub id: String,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
    #[serde(default)]
    pub rollout_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: String,
    pub key: String,
}
