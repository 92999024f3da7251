//! Named throttlers sharing one store client.

use std::collections::HashMap;

use tracing::debug;

use super::throttler::{Throttler, ThrottlerConfig};
use crate::config::LimiterConfig;
use crate::error::{GatekeeperError, Result};
use crate::store::StoreClient;

/// A set of throttlers addressed by name.
///
/// Every throttler writes under its own key namespace, so limiters never see
/// each other's counters even though they share the store and its breaker.
#[derive(Debug, Clone)]
pub struct LimiterRegistry {
    store: StoreClient,
    limiters: HashMap<String, Throttler>,
}

impl LimiterRegistry {
    /// Create an empty registry over `store`.
    pub fn new(store: StoreClient) -> Self {
        Self {
            store,
            limiters: HashMap::new(),
        }
    }

    /// Build a throttler for every configured limiter.
    pub fn from_config(store: StoreClient, limiters: &[LimiterConfig]) -> Result<Self> {
        let mut registry = Self::new(store);
        for limiter in limiters {
            registry.register(&limiter.name, limiter.throttler_config())?;
        }
        Ok(registry)
    }

    /// Add a throttler under `name`.
    ///
    /// Fails if the name is taken or another throttler already uses the
    /// same key namespace.
    pub fn register(&mut self, name: &str, config: ThrottlerConfig) -> Result<&Throttler> {
        if self.limiters.contains_key(name) {
            return Err(GatekeeperError::Config(format!(
                "duplicate limiter name: {name}"
            )));
        }
        if let Some((other, _)) = self
            .limiters
            .iter()
            .find(|(_, t)| t.config().key_type == config.key_type)
        {
            return Err(GatekeeperError::Config(format!(
                "limiters {other} and {name} share key namespace {}",
                config.key_type
            )));
        }

        let throttler = Throttler::new(self.store.clone(), config)?;
        debug!(
            name = name,
            key_type = %throttler.config().key_type,
            limit = throttler.config().attempt_limit,
            "Registered limiter"
        );

        Ok(self.limiters.entry(name.to_string()).or_insert(throttler))
    }

    /// Look up a throttler by name.
    pub fn get(&self, name: &str) -> Option<&Throttler> {
        self.limiters.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limiters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The shared store client.
    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_limiters;
    use crate::store::{BreakerConfig, MemoryBackend};
    use crate::throttle::Id;
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> StoreClient {
        StoreClient::new("test", Arc::new(MemoryBackend::new()), BreakerConfig::default()).unwrap()
    }

    fn throttler_config(key_type: &str, attempt_limit: i64) -> ThrottlerConfig {
        ThrottlerConfig {
            key_type: key_type.to_string(),
            attempt_limit,
            attempt_window: Duration::from_secs(60),
            base_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(3600),
            timeout_scale_factor: 2.0,
        }
    }

    #[test]
    fn test_from_default_config() {
        let registry = LimiterRegistry::from_config(store(), &default_limiters()).unwrap();

        assert_eq!(registry.names(), vec!["request", "user_login", "user_register"]);
        assert_eq!(registry.get("request").unwrap().config().attempt_limit, 400);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = LimiterRegistry::new(store());
        registry.register("login", throttler_config("user_login", 10)).unwrap();

        let err = registry
            .register("login", throttler_config("other", 10))
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::Config(_)));
    }

    #[test]
    fn test_shared_namespace_rejected() {
        let mut registry = LimiterRegistry::new(store());
        registry.register("a", throttler_config("shared", 10)).unwrap();

        assert!(registry.register("b", throttler_config("shared", 10)).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_limiter_rejected() {
        let mut registry = LimiterRegistry::new(store());
        assert!(registry.register("bad", throttler_config("bad", -1)).is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_limiters_are_isolated() {
        let mut registry = LimiterRegistry::new(store());
        registry.register("login", throttler_config("user_login", 1)).unwrap();
        registry.register("register", throttler_config("user_register", 1)).unwrap();

        let ids = [Id::new("user", "alice")];
        let login = registry.get("login").unwrap();
        let register = registry.get("register").unwrap();

        assert!(!login.incr(&ids).await.unwrap());
        assert!(login.incr(&ids).await.unwrap());

        assert!(!register.timed_out(&ids).await.unwrap());
        assert!(!register.incr(&ids).await.unwrap());
        assert_eq!(register.tracker().get_attempts(&ids[0]).await.unwrap(), 1);
    }
}
