//! Client-side decision engine for feature flags and experiments.
//!
//! # Overview
//!
//! The engine revolves around a [`DecisionEngine`] that decides feature flags for users, where
//! each user is a [`UserContext`] with a unique id and typed attributes. Deciding a flag results
//! in a [`Decision`]: which variation (if any) the user gets, whether the feature is enabled,
//! and which rule produced it.
//!
//! Decisions are made locally against a datafile held by a [`ConfigurationStore`]. Fetching the
//! datafile is left to the host.
//!
//! Variations are resolved in order of precedence:
//! 1. forced decisions set on the user context,
//! 2. whitelists (set at runtime or in the datafile),
//! 3. the user profile, if a [`UserProfileService`] is configured,
//! 4. audience targeting and deterministic bucketing, or a contextual bandit for CMAB
//!    experiments,
//! 5. rollout rules of the flag.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! [`DecisionEngine::decide`] never fails: an error degrades the decision to "no variation,
//! disabled" and is reported in [`Decision::reasons`]. The reasons are valuable for debugging and
//! usually indicate that developer's attention is needed.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages
//! under the `decision_core` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into decisions.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod audience;
pub mod bucketer;
pub mod cmab;
mod config;
mod configuration_store;
pub mod decision;
mod engine;
mod error;
pub mod lru_cache;
pub mod project_config;
mod typed_value;
mod user_context;

pub use config::DecisionEngineConfig;
pub use configuration_store::ConfigurationStore;
pub use decision::{
    DecideOption, Decision, DecisionSource, InMemoryUserProfileService, UserProfile,
    UserProfileService,
};
pub use engine::DecisionEngine;
pub use error::{Error, EvaluationError, Result};
pub use project_config::ProjectConfig;
pub use typed_value::{Attributes, TypedValue};
pub use user_context::{ForcedDecisionKey, UserContext, BUCKETING_ID_ATTRIBUTE};
