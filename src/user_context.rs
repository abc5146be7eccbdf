use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};

use crate::{Attributes, TypedValue};

/// Reserved attribute that overrides the user id as the bucketing input.
pub const BUCKETING_ID_ATTRIBUTE: &str = "$opt_bucketing_id";

/// Key of a forced decision: a whole flag, or a single rule (experiment or rollout rule) of a
/// flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForcedDecisionKey {
    pub flag_key: String,
    pub rule_key: Option<String>,
}

impl ForcedDecisionKey {
    /// Force a variation for every rule of the flag.
    pub fn flag(flag_key: impl Into<String>) -> ForcedDecisionKey {
        ForcedDecisionKey {
            flag_key: flag_key.into(),
            rule_key: None,
        }
    }

    /// Force a variation for a single rule of the flag.
    pub fn rule(flag_key: impl Into<String>, rule_key: impl Into<String>) -> ForcedDecisionKey {
        ForcedDecisionKey {
            flag_key: flag_key.into(),
            rule_key: Some(rule_key.into()),
        }
    }
}

/// The user a decision is made for: id, attributes, externally qualified segments and runtime
/// forced decisions.
///
/// Forced decisions can be changed through a shared reference, so a context may be kept around
/// and reused for many decisions.
#[derive(Debug)]
pub struct UserContext {
    user_id: String,
    attributes: Attributes,
    qualified_segments: Option<HashSet<String>>,
    forced_decisions: RwLock<HashMap<ForcedDecisionKey, String>>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, attributes: Attributes) -> UserContext {
        UserContext {
            user_id: user_id.into(),
            attributes,
            qualified_segments: None,
            forced_decisions: RwLock::new(HashMap::new()),
        }
    }

    /// Attach the set of segments the user qualifies for (used by `qualified` conditions).
    pub fn with_qualified_segments(
        mut self,
        segments: impl IntoIterator<Item = impl Into<String>>,
    ) -> UserContext {
        self.qualified_segments = Some(segments.into_iter().map(Into::into).collect());
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<TypedValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Identifier used as the bucketing input: the reserved bucketing attribute when it is a
    /// non-empty string, the user id otherwise.
    pub fn bucketing_id(&self) -> &str {
        match self.attributes.get(BUCKETING_ID_ATTRIBUTE) {
            Some(TypedValue::String(id)) if !id.is_empty() => id,
            Some(_) => {
                log::warn!(target: "decision_core", user_id = self.user_id.as_str();
                           "bucketing id attribute is not a non-empty string, using user id");
                &self.user_id
            }
            None => &self.user_id,
        }
    }

    pub fn is_qualified_for(&self, segment: &str) -> bool {
        self.qualified_segments
            .as_ref()
            .is_some_and(|segments| segments.contains(segment))
    }

    /// Force `variation_key` for the flag or rule. Returns `false` if the value could not be
    /// stored.
    pub fn set_forced_decision(
        &self,
        key: ForcedDecisionKey,
        variation_key: impl Into<String>,
    ) -> bool {
        let variation_key = variation_key.into();
        let Ok(mut forced_decisions) = self.forced_decisions.write() else {
            return false;
        };
        forced_decisions.insert(key, variation_key);
        true
    }

    pub fn get_forced_decision(&self, key: &ForcedDecisionKey) -> Option<String> {
        let forced_decisions = self.forced_decisions.read().ok()?;
        forced_decisions.get(key).cloned()
    }

    /// Returns `true` if a forced decision was removed.
    pub fn remove_forced_decision(&self, key: &ForcedDecisionKey) -> bool {
        self.forced_decisions
            .write()
            .is_ok_and(|mut forced_decisions| forced_decisions.remove(key).is_some())
    }

    pub fn remove_all_forced_decisions(&self) -> bool {
        let Ok(mut forced_decisions) = self.forced_decisions.write() else {
            return false;
        };
        forced_decisions.clear();
        true
    }
}

impl Clone for UserContext {
    fn clone(&self) -> Self {
        let forced_decisions = self
            .forced_decisions
            .read()
            .map(|it| it.clone())
            .unwrap_or_default();
        UserContext {
            user_id: self.user_id.clone(),
            attributes: self.attributes.clone(),
            qualified_segments: self.qualified_segments.clone(),
            forced_decisions: RwLock::new(forced_decisions),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::{ForcedDecisionKey, UserContext, BUCKETING_ID_ATTRIBUTE};

    #[test]
    fn bucketing_id_prefers_reserved_attribute() {
        let mut user = UserContext::new("user-1", HashMap::new());
        assert_eq!(user.bucketing_id(), "user-1");

        user.set_attribute(BUCKETING_ID_ATTRIBUTE, "device-9");
        assert_eq!(user.bucketing_id(), "device-9");

        user.set_attribute(BUCKETING_ID_ATTRIBUTE, "");
        assert_eq!(user.bucketing_id(), "user-1");

        user.set_attribute(BUCKETING_ID_ATTRIBUTE, 42);
        assert_eq!(user.bucketing_id(), "user-1");
    }

    #[test]
    fn qualified_segments() {
        let user = UserContext::new("user-1", HashMap::new());
        assert!(!user.is_qualified_for("vip"));

        let user = user.with_qualified_segments(["vip", "beta"]);
        assert!(user.is_qualified_for("vip"));
        assert!(!user.is_qualified_for("churned"));
    }

    #[test]
    fn forced_decisions_set_get_remove() {
        let user = UserContext::new("user-1", HashMap::new());
        let flag = ForcedDecisionKey::flag("checkout");
        let rule = ForcedDecisionKey::rule("checkout", "exp_1");

        assert!(user.set_forced_decision(flag.clone(), "on"));
        assert!(user.set_forced_decision(rule.clone(), "off"));
        assert_eq!(user.get_forced_decision(&flag).as_deref(), Some("on"));
        assert_eq!(user.get_forced_decision(&rule).as_deref(), Some("off"));

        assert!(user.remove_forced_decision(&flag));
        assert!(!user.remove_forced_decision(&flag));
        assert_eq!(user.get_forced_decision(&flag), None);

        assert!(user.remove_all_forced_decisions());
        assert_eq!(user.get_forced_decision(&rule), None);
    }

    #[test]
    fn forced_decisions_can_be_set_from_another_thread() {
        let user = Arc::new(UserContext::new("user-1", HashMap::new()));

        {
            let user = user.clone();
            let _ = std::thread::spawn(move || {
                user.set_forced_decision(ForcedDecisionKey::flag("checkout"), "on");
            })
            .join();
        }

        assert!(user
            .get_forced_decision(&ForcedDecisionKey::flag("checkout"))
            .is_some());
    }

    #[test]
    fn clone_copies_forced_decisions() {
        let user = UserContext::new("user-1", HashMap::new());
        user.set_forced_decision(ForcedDecisionKey::flag("checkout"), "on");

        let copy = user.clone();
        user.remove_all_forced_decisions();

        assert_eq!(
            copy.get_forced_decision(&ForcedDecisionKey::flag("checkout"))
                .as_deref(),
            Some("on")
        );
    }
}
