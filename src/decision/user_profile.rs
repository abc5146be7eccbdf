use std::{collections::HashMap, sync::RwLock};

use serde::{Deserialize, Serialize};

/// Error returned by a [`UserProfileService`] implementation. Never aborts a decision.
pub type ProfileError = Box<dyn std::error::Error + Send + Sync>;

/// Variation a user was bucketed into for an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub variation_id: String,
}

/// Sticky bucketing record of a user: experiment id to the variation they were given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub experiment_bucket_map: HashMap<String, Bucket>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> UserProfile {
        UserProfile {
            user_id: user_id.into(),
            experiment_bucket_map: HashMap::new(),
        }
    }

    pub fn variation_id(&self, experiment_id: &str) -> Option<&str> {
        self.experiment_bucket_map
            .get(experiment_id)
            .map(|bucket| bucket.variation_id.as_str())
    }

    pub fn set_variation_id(
        &mut self,
        experiment_id: impl Into<String>,
        variation_id: impl Into<String>,
    ) {
        self.experiment_bucket_map.insert(
            experiment_id.into(),
            Bucket {
                variation_id: variation_id.into(),
            },
        );
    }
}

/// Host-provided persistence of user profiles.
///
/// Implementations are called on the decision path and should be fast. Errors are logged and
/// treated as a cache miss.
pub trait UserProfileService: Send + Sync {
    fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>, ProfileError>;

    fn save(&self, profile: UserProfile) -> Result<(), ProfileError>;
}

/// [`UserProfileService`] keeping profiles in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryUserProfileService {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl InMemoryUserProfileService {
    pub fn new() -> InMemoryUserProfileService {
        InMemoryUserProfileService::default()
    }
}

impl UserProfileService for InMemoryUserProfileService {
    fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>, ProfileError> {
        let profiles = self
            .profiles
            .read()
            .map_err(|_| "user profile store is poisoned")?;
        Ok(profiles.get(user_id).cloned())
    }

    fn save(&self, profile: UserProfile) -> Result<(), ProfileError> {
        let mut profiles = self
            .profiles
            .write()
            .map_err(|_| "user profile store is poisoned")?;
        profiles.insert(profile.user_id.clone(), profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{InMemoryUserProfileService, UserProfile, UserProfileService};

    #[test]
    fn profile_wire_format() {
        let mut profile = UserProfile::new("user-1");
        profile.set_variation_id("exp_1", "var_1");

        assert_eq!(
            serde_json::to_value(&profile).unwrap(),
            json!({
                "user_id": "user-1",
                "experiment_bucket_map": {"exp_1": {"variation_id": "var_1"}}
            })
        );
    }

    #[test]
    fn in_memory_round_trip() {
        let service = InMemoryUserProfileService::new();
        assert_eq!(service.lookup("user-1").unwrap(), None);

        let mut profile = UserProfile::new("user-1");
        profile.set_variation_id("exp_1", "var_1");
        service.save(profile).unwrap();

        let profile = service.lookup("user-1").unwrap().unwrap();
        assert_eq!(profile.variation_id("exp_1"), Some("var_1"));
        assert_eq!(profile.variation_id("exp_2"), None);
    }
}
