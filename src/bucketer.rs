//! Deterministic traffic allocation.
//!
//! A user is placed into one of [`MAX_TRAFFIC_VALUE`] buckets by hashing the bucketing id
//! together with the id of the entity being allocated (an experiment or a mutex group). Traffic
//! allocation ranges then map the bucket to an entity.
use std::io::Cursor;

use crate::project_config::{
    Cmab, Experiment, GroupPolicy, ProjectConfig, TrafficAllocation, Variation,
};

/// Number of buckets.
pub const MAX_TRAFFIC_VALUE: u32 = 10_000;

const HASH_SEED: u32 = 1;
const MAX_HASH_VALUE: f64 = 4_294_967_296.0; // 2^32

/// Entity id of the synthetic range used to gate bandit traffic.
const CMAB_ENTITY_ID: &str = "$";

/// Reason a user did not get a variation from bucketing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotBucketed {
    /// Bucket value fell outside of every allocated range.
    #[error("user is not in any traffic range of experiment {experiment_key}")]
    NoTraffic { experiment_key: String },

    /// Mutex group allocated the user to a different experiment (or none).
    #[error("user is excluded from experiment {experiment_key} by mutex group {group_id}")]
    ExcludedByGroup {
        experiment_key: String,
        group_id: String,
    },

    /// Experiment belongs to a group that is not in the configuration.
    #[error("group {group_id} of experiment {experiment_key} not found")]
    UnknownGroup {
        experiment_key: String,
        group_id: String,
    },

    /// Allocation points to a variation the experiment does not have.
    #[error("bucketed variation {variation_id} not found in experiment {experiment_key}")]
    UnknownVariation {
        experiment_key: String,
        variation_id: String,
    },
}

/// Bucket value in `[0, MAX_TRAFFIC_VALUE)` for a hashing key (bucketing id followed by entity
/// id).
pub fn bucket_value(bucketing_key: &str) -> u32 {
    // Reading from an in-memory cursor cannot fail.
    let hash = murmur3::murmur3_32(&mut Cursor::new(bucketing_key.as_bytes()), HASH_SEED)
        .unwrap_or(0);
    let ratio = f64::from(hash) / MAX_HASH_VALUE;
    (ratio * f64::from(MAX_TRAFFIC_VALUE)) as u32
}

/// Find the entity of the first range whose (inclusive) upper bound is at or above
/// `bucket_value`. An empty entity id marks unallocated traffic.
pub fn bucket_to_entity(ranges: &[TrafficAllocation], bucket_value: u32) -> Option<&str> {
    ranges
        .iter()
        .find(|range| bucket_value <= range.end_of_range)
        .map(|range| range.entity_id.as_str())
        .filter(|entity_id| !entity_id.is_empty())
}

/// Allocate `bucketing_id` into one of `ranges` for the entity `entity_id`.
pub fn allocate<'a>(
    bucketing_id: &str,
    entity_id: &str,
    ranges: &'a [TrafficAllocation],
) -> Option<&'a str> {
    let value = bucket_value(&format!("{bucketing_id}{entity_id}"));
    let entity = bucket_to_entity(ranges, value);
    log::trace!(target: "decision_core",
                bucketing_id,
                entity_id,
                bucket_value = value,
                allocated:? = entity;
                "allocated traffic");
    entity
}

/// Bucket a user into one of the experiment's variations, respecting mutex groups.
pub fn bucket_experiment<'a>(
    config: &ProjectConfig,
    experiment: &'a Experiment,
    bucketing_id: &str,
) -> Result<&'a Variation, NotBucketed> {
    check_group(config, experiment, bucketing_id)?;

    let variation_id = allocate(bucketing_id, &experiment.id, &experiment.traffic_allocation)
        .ok_or_else(|| NotBucketed::NoTraffic {
            experiment_key: experiment.key.clone(),
        })?;

    experiment
        .variation_by_id(variation_id)
        .ok_or_else(|| NotBucketed::UnknownVariation {
            experiment_key: experiment.key.clone(),
            variation_id: variation_id.to_owned(),
        })
}

/// Check whether the user falls into the share of traffic handed to the bandit.
///
/// The bandit picks the variation itself, so only a single range is consulted here.
pub fn bucket_cmab_traffic(
    config: &ProjectConfig,
    experiment: &Experiment,
    cmab: &Cmab,
    bucketing_id: &str,
) -> Result<(), NotBucketed> {
    check_group(config, experiment, bucketing_id)?;

    let ranges = [TrafficAllocation {
        entity_id: CMAB_ENTITY_ID.to_owned(),
        end_of_range: cmab.traffic_allocation,
    }];
    allocate(bucketing_id, &experiment.id, &ranges)
        .map(|_| ())
        .ok_or_else(|| NotBucketed::NoTraffic {
            experiment_key: experiment.key.clone(),
        })
}

/// For experiments in a random-policy group, the group decides which single experiment the user
/// may enter.
fn check_group(
    config: &ProjectConfig,
    experiment: &Experiment,
    bucketing_id: &str,
) -> Result<(), NotBucketed> {
    let Some(group_id) = &experiment.group_id else {
        return Ok(());
    };
    let group = config
        .group_by_id(group_id)
        .ok_or_else(|| NotBucketed::UnknownGroup {
            experiment_key: experiment.key.clone(),
            group_id: group_id.clone(),
        })?;

    if group.policy != GroupPolicy::Random {
        return Ok(());
    }

    match allocate(bucketing_id, &group.id, &group.traffic_allocation) {
        Some(selected) if selected == experiment.id => Ok(()),
        _ => Err(NotBucketed::ExcludedByGroup {
            experiment_key: experiment.key.clone(),
            group_id: group_id.clone(),
        }),
    }
}
