//! Caller-owned registry of connection sources.
//!
//! A [`PoolRegistry`] hands out one shared [`ConnectionSource`] per distinct
//! set of connection parameters. It holds no process-wide state; whoever
//! owns the registry owns the pools in it.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tds_client::ConnectionConfig;

use crate::config::PoolConfig;
use crate::connector::{ConnectionFactory, TcpConnector};
use crate::error::PoolError;
use crate::source::ConnectionSource;

/// The connection parameters that make two pools interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    host: String,
    port: u16,
    packet_size: usize,
    statement_cache_size: usize,
    prelogin: Bytes,
    login7: Bytes,
}

impl PoolKey {
    /// Host this key connects to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this key connects to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<&ConnectionConfig> for PoolKey {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            packet_size: config.packet_size,
            statement_cache_size: config.statement_cache_size,
            prelogin: config.prelogin.clone(),
            login7: config.login7.clone(),
        }
    }
}

/// Connection sources keyed by connection parameters.
#[derive(Debug)]
pub struct PoolRegistry {
    config: PoolConfig,
    pools: Mutex<HashMap<PoolKey, Arc<ConnectionSource>>>,
}

impl PoolRegistry {
    /// Create an empty registry. New sources use `config`.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            config,
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// The configuration applied to new sources.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The source for `connection`, created over TCP on first use.
    pub fn get_or_create(
        &self,
        connection: &ConnectionConfig,
    ) -> Result<Arc<ConnectionSource>, PoolError> {
        connection
            .validate()
            .map_err(PoolError::ConnectionCreation)?;
        self.get_or_insert_with(PoolKey::from(connection), || {
            Arc::new(TcpConnector::new(connection.clone()))
        })
    }

    /// The source for `key`, built from `factory` on first use.
    ///
    /// `factory` runs only when no live source is registered for `key`. A
    /// closed source is replaced.
    pub fn get_or_insert_with<F>(
        &self,
        key: PoolKey,
        factory: F,
    ) -> Result<Arc<ConnectionSource>, PoolError>
    where
        F: FnOnce() -> Arc<dyn ConnectionFactory>,
    {
        let mut pools = self.pools.lock();
        if let Some(source) = pools.get(&key) {
            if !source.is_closed() {
                return Ok(Arc::clone(source));
            }
        }
        let source = ConnectionSource::new(self.config.clone(), factory())?;
        tracing::debug!(host = %key.host, port = key.port, "registered connection source");
        pools.insert(key, Arc::clone(&source));
        Ok(source)
    }

    /// The registered source for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &PoolKey) -> Option<Arc<ConnectionSource>> {
        self.pools.lock().get(key).cloned()
    }

    /// Unregister the source for `key` without closing it.
    pub fn remove(&self, key: &PoolKey) -> Option<Arc<ConnectionSource>> {
        self.pools.lock().remove(key)
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Check if no source is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Unregister and close every source.
    pub async fn close_all(&self) {
        let sources: Vec<_> = self.pools.lock().drain().map(|(_, source)| source).collect();
        for source in sources {
            source.close().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_follows_connection_parameters() {
        let base = ConnectionConfig::new().host("db1").port(1433);
        let same = base.clone();
        let other_port = base.clone().port(1434);
        let other_login = base.clone().login7(Bytes::from_static(b"other"));

        assert_eq!(PoolKey::from(&base), PoolKey::from(&same));
        assert_ne!(PoolKey::from(&base), PoolKey::from(&other_port));
        assert_ne!(PoolKey::from(&base), PoolKey::from(&other_login));
        assert_eq!(PoolKey::from(&base).host(), "db1");
    }

    #[test]
    fn test_registry_rejects_invalid_config() {
        assert!(PoolRegistry::new(PoolConfig::new().max_connections(0)).is_err());
    }

    #[test]
    fn test_same_key_shares_source() {
        let registry = PoolRegistry::new(PoolConfig::default()).unwrap();
        let config = ConnectionConfig::new().host("db1");

        let a = registry.get_or_create(&config).unwrap();
        let b = registry.get_or_create(&config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.get_or_create(&config.clone().port(2000)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(&PoolKey::from(&config)).unwrap();
        assert!(Arc::ptr_eq(&a, &removed));
        assert_eq!(registry.len(), 1);
    }
}
