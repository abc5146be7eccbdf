use std::{io::Cursor, sync::Arc};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    decision::DecideOption, lru_cache::LruCache, project_config::ProjectConfig,
    user_context::UserContext, Error,
};

use super::{CmabAttributes, CmabClient, CmabConfig, CmabDecision, CmabError, HttpCmabClient};

/// Cached bandit decision for a (user, rule) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmabCacheEntry {
    /// Hash of the attributes the decision was made for.
    pub attributes_hash: String,
    pub variation_id: String,
    pub cmab_uuid: String,
}

/// Resolves bandit decisions, caching them per (user, rule).
///
/// Concurrent requests for the same (user, rule) are serialized through a fixed pool of locks,
/// so only one of them reaches the prediction endpoint and the rest read its result from the
/// cache. Unrelated keys that land on the same lock only wait for each other.
pub struct CmabService {
    cache: LruCache<String, CmabCacheEntry>,
    client: Arc<dyn CmabClient>,
    locks: Vec<Mutex<()>>,
}

impl CmabService {
    pub fn new(config: &CmabConfig, client: Arc<dyn CmabClient>) -> CmabService {
        let lock_shards = config.lock_shards.max(1);
        CmabService {
            cache: LruCache::new(config.cache_size, config.cache_timeout),
            client,
            locks: (0..lock_shards).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Create a service that talks to the configured prediction endpoint over HTTP.
    pub fn from_config(config: &CmabConfig) -> Result<CmabService, Error> {
        let client = HttpCmabClient::new(config)?;
        Ok(CmabService::new(config, Arc::new(client)))
    }

    pub fn cache(&self) -> &LruCache<String, CmabCacheEntry> {
        &self.cache
    }

    /// Get the bandit decision for `user` in the CMAB experiment `rule_id`.
    ///
    /// Honors [`DecideOption::IgnoreCmabCache`], [`DecideOption::ResetCmabCache`] and
    /// [`DecideOption::InvalidateUserCmabCache`].
    pub async fn get_decision(
        &self,
        config: &ProjectConfig,
        user: &UserContext,
        rule_id: &str,
        options: &[DecideOption],
    ) -> Result<CmabDecision, CmabError> {
        let _guard = self.lock_for(user.user_id(), rule_id).lock().await;

        let attributes = filter_attributes(config, user, rule_id)?;

        if options.contains(&DecideOption::IgnoreCmabCache) {
            return self.fetch(rule_id, user.user_id(), &attributes).await;
        }

        if options.contains(&DecideOption::ResetCmabCache) {
            self.cache.reset();
        }

        let cache_key = cache_key(user.user_id(), rule_id);
        if options.contains(&DecideOption::InvalidateUserCmabCache) {
            self.cache.remove(&cache_key);
        }

        let attributes_hash = hash_attributes(&attributes);

        if let Some(entry) = self.cache.lookup(&cache_key) {
            if entry.attributes_hash == attributes_hash {
                log::debug!(target: "decision_core",
                            rule_id,
                            user_id = user.user_id();
                            "cmab cache hit");
                return Ok(CmabDecision {
                    variation_id: entry.variation_id,
                    cmab_uuid: entry.cmab_uuid,
                });
            }
            log::debug!(target: "decision_core",
                        rule_id,
                        user_id = user.user_id();
                        "cmab attributes changed, invalidating cached decision");
            self.cache.remove(&cache_key);
        }

        let decision = self.fetch(rule_id, user.user_id(), &attributes).await?;
        self.cache.save(
            cache_key,
            CmabCacheEntry {
                attributes_hash,
                variation_id: decision.variation_id.clone(),
                cmab_uuid: decision.cmab_uuid.clone(),
            },
        );
        Ok(decision)
    }

    async fn fetch(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &CmabAttributes,
    ) -> Result<CmabDecision, CmabError> {
        let cmab_uuid = Uuid::new_v4().to_string();
        let variation_id = self
            .client
            .fetch_decision(rule_id, user_id, attributes, &cmab_uuid)
            .await?;
        Ok(CmabDecision {
            variation_id,
            cmab_uuid,
        })
    }

    fn lock_for(&self, user_id: &str, rule_id: &str) -> &Mutex<()> {
        let key = format!("{user_id}{rule_id}");
        let hash = murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), 1).unwrap_or(0);
        // `locks` is never empty.
        &self.locks[hash as usize % self.locks.len()]
    }
}

/// Keep only the attributes the bandit of `rule_id` is configured to look at.
fn filter_attributes(
    config: &ProjectConfig,
    user: &UserContext,
    rule_id: &str,
) -> Result<CmabAttributes, CmabError> {
    let cmab = config
        .experiment_by_id(rule_id)
        .and_then(|experiment| experiment.cmab.as_ref())
        .ok_or_else(|| CmabError::NotCmabExperiment(rule_id.to_owned()))?;

    let attributes = cmab
        .attribute_ids
        .iter()
        .filter_map(|id| {
            let Some(key) = config.attribute_key_by_id(id) else {
                log::warn!(target: "decision_core", rule_id, attribute_id = id.as_str();
                           "cmab attribute not found in configuration");
                return None;
            };
            let value = user.attributes().get(key)?;
            Some((key.to_owned(), value.clone()))
        })
        .collect();

    Ok(attributes)
}

/// Length-prefixed so that different (user, rule) splits never collide.
fn cache_key(user_id: &str, rule_id: &str) -> String {
    format!("{}-{}-{}", user_id.len(), user_id, rule_id)
}

/// Stable hash of sorted (key, value) pairs.
fn hash_attributes(attributes: &CmabAttributes) -> String {
    let pairs = attributes.iter().collect::<Vec<_>>();
    // Serializing string keys and attribute values into memory cannot fail.
    let serialized = serde_json::to_vec(&pairs).unwrap_or_default();
    let hash = murmur3::murmur3_32(&mut Cursor::new(serialized), 1).unwrap_or(0);
    format!("{hash:08x}")
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use crate::{
        cmab::{CmabAttributes, CmabClient, CmabConfig, CmabError},
        decision::DecideOption,
        project_config::test_config,
        user_context::UserContext,
        Attributes, TypedValue,
    };

    use super::{cache_key, hash_attributes, CmabService};

    const RULE_ID: &str = "exp_cmab";

    /// Answers with a fixed variation and counts calls.
    struct FakeClient {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FakeClient {
        fn new() -> Arc<FakeClient> {
            Arc::new(FakeClient {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CmabClient for FakeClient {
        async fn fetch_decision(
            &self,
            _rule_id: &str,
            _user_id: &str,
            _attributes: &CmabAttributes,
            _cmab_uuid: &str,
        ) -> Result<String, CmabError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(CmabError::HttpStatus(500));
            }
            Ok("var_cmab_a".to_owned())
        }
    }

    fn user(age: f64, extra: &str) -> UserContext {
        let attributes: Attributes = [
            ("age".to_owned(), TypedValue::Double(age)),
            ("country".to_owned(), TypedValue::from("us")),
            // Not one of the bandit's attributes.
            ("plan".to_owned(), TypedValue::from(extra)),
        ]
        .into_iter()
        .collect();
        UserContext::new("user-1", attributes)
    }

    fn service(client: Arc<FakeClient>) -> CmabService {
        CmabService::new(&CmabConfig::new(), client)
    }

    #[test]
    fn cache_key_is_length_prefixed() {
        assert_eq!(cache_key("user-1", "rule"), "6-user-1-rule");
        assert_ne!(cache_key("a-1", "2"), cache_key("a", "1-2"));
    }

    #[test]
    fn attribute_hash_is_order_independent_and_value_sensitive() {
        let a: CmabAttributes = [("x".to_owned(), TypedValue::Int(1)), ("y".to_owned(), "z".into())]
            .into_iter()
            .collect();
        let b: CmabAttributes = [("y".to_owned(), "z".into()), ("x".to_owned(), TypedValue::Int(1))]
            .into_iter()
            .collect();
        let c: CmabAttributes = [("x".to_owned(), TypedValue::Int(2)), ("y".to_owned(), "z".into())]
            .into_iter()
            .collect();

        assert_eq!(hash_attributes(&a), hash_attributes(&b));
        assert_ne!(hash_attributes(&a), hash_attributes(&c));
        assert_eq!(hash_attributes(&a).len(), 8);
    }

    #[tokio::test]
    async fn identical_requests_hit_the_network_once() {
        let config = test_config();
        let client = FakeClient::new();
        let service = service(client.clone());

        let first = service.get_decision(&config, &user(30.0, "free"), RULE_ID, &[]).await.unwrap();
        let second = service.get_decision(&config, &user(30.0, "free"), RULE_ID, &[]).await.unwrap();

        assert_eq!(client.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(first.variation_id, "var_cmab_a");
    }

    #[tokio::test]
    async fn changing_a_bandit_attribute_refetches() {
        let config = test_config();
        let client = FakeClient::new();
        let service = service(client.clone());

        let first = service.get_decision(&config, &user(30.0, "free"), RULE_ID, &[]).await.unwrap();
        let second = service.get_decision(&config, &user(31.0, "free"), RULE_ID, &[]).await.unwrap();

        assert_eq!(client.calls(), 2);
        assert_ne!(first.cmab_uuid, second.cmab_uuid);
        assert_eq!(service.cache().len(), 1);
    }

    #[tokio::test]
    async fn other_attributes_do_not_affect_cache() {
        let config = test_config();
        let client = FakeClient::new();
        let service = service(client.clone());

        service.get_decision(&config, &user(30.0, "free"), RULE_ID, &[]).await.unwrap();
        service.get_decision(&config, &user(30.0, "paid"), RULE_ID, &[]).await.unwrap();

        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn cache_options() {
        let config = test_config();
        let client = FakeClient::new();
        let service = service(client.clone());
        let user = user(30.0, "free");

        service.get_decision(&config, &user, RULE_ID, &[]).await.unwrap();
        assert_eq!(client.calls(), 1);

        service
            .get_decision(&config, &user, RULE_ID, &[DecideOption::IgnoreCmabCache])
            .await
            .unwrap();
        assert_eq!(client.calls(), 2);
        // Bypassing the cache does not overwrite it.
        service.get_decision(&config, &user, RULE_ID, &[]).await.unwrap();
        assert_eq!(client.calls(), 2);

        service
            .get_decision(&config, &user, RULE_ID, &[DecideOption::InvalidateUserCmabCache])
            .await
            .unwrap();
        assert_eq!(client.calls(), 3);

        service
            .get_decision(&config, &user, RULE_ID, &[DecideOption::ResetCmabCache])
            .await
            .unwrap();
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn reset_clears_other_users() {
        let config = test_config();
        let client = FakeClient::new();
        let service = service(client.clone());

        let other = UserContext::new("user-2", HashMap::new());
        service.get_decision(&config, &other, RULE_ID, &[]).await.unwrap();
        service
            .get_decision(&config, &user(30.0, "free"), RULE_ID, &[DecideOption::ResetCmabCache])
            .await
            .unwrap();

        assert_eq!(service.cache().len(), 1);
        service.get_decision(&config, &other, RULE_ID, &[]).await.unwrap();
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let config = test_config();
        let client = Arc::new(FakeClient {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: true,
        });
        let service = service(client.clone());

        assert!(service.get_decision(&config, &user(30.0, "free"), RULE_ID, &[]).await.is_err());
        assert!(service.cache().is_empty());
    }

    #[tokio::test]
    async fn rejects_non_cmab_rules() {
        let config = test_config();
        let service = service(FakeClient::new());
        let result = service
            .get_decision(&config, &user(30.0, "free"), "exp_checkout", &[])
            .await;
        assert!(matches!(result, Err(CmabError::NotCmabExperiment(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_for_same_key_are_single_flight() {
        let config = Arc::new(test_config());
        let client = Arc::new(FakeClient {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
            fail: false,
        });
        let service = Arc::new(service(client.clone()));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let config = config.clone();
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .get_decision(&config, &user(30.0, "free"), RULE_ID, &[])
                        .await
                })
            })
            .collect();

        let mut uuids = Vec::new();
        for task in tasks {
            uuids.push(task.await.unwrap().unwrap().cmab_uuid);
        }

        assert_eq!(client.calls(), 1);
        assert!(uuids.iter().all(|uuid| *uuid == uuids[0]));
    }

    /// Only answers once `parties` requests are in flight at the same time.
    struct RendezvousClient {
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl CmabClient for RendezvousClient {
        async fn fetch_decision(
            &self,
            _rule_id: &str,
            _user_id: &str,
            _attributes: &CmabAttributes,
            _cmab_uuid: &str,
        ) -> Result<String, CmabError> {
            tokio::time::timeout(Duration::from_secs(2), self.barrier.wait())
                .await
                .map_err(|_| CmabError::HttpStatus(503))?;
            Ok("var_cmab_b".to_owned())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn requests_for_different_users_proceed_in_parallel() {
        let config = Arc::new(test_config());
        let client = Arc::new(RendezvousClient {
            barrier: tokio::sync::Barrier::new(2),
        });
        let service = Arc::new(CmabService::new(&CmabConfig::new(), client));

        // "user-1" and "user-2" map to different locks of the default pool.
        let tasks: Vec<_> = ["user-1", "user-2"]
            .into_iter()
            .map(|user_id| {
                let config = config.clone();
                let service = service.clone();
                tokio::spawn(async move {
                    let user = UserContext::new(user_id, HashMap::new());
                    service.get_decision(&config, &user, RULE_ID, &[]).await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().variation_id, "var_cmab_b");
        }
        assert_eq!(service.cache().len(), 2);
    }
}
