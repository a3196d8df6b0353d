//! Pool integration for MySQL drivers.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use sqlwire_core::Result;
use sqlwire_pool::{ConnectionFactory, Pool, PoolConfig, PoolRegistry, PooledConnection};

use crate::compress::BufferPool;
use crate::config::MySqlConfig;
use crate::driver::Driver;
use crate::tracing_driver::new_driver;

/// Registry keyed by [`MySqlConfig::pool_key`].
pub type MySqlPoolRegistry = PoolRegistry<MySqlConnectionFactory>;

/// Opens drivers for one settings key.
///
/// All drivers of a pool share one compression [`BufferPool`].
#[derive(Debug)]
pub struct MySqlConnectionFactory {
    config: MySqlConfig,
    buffers: Arc<BufferPool>,
}

impl MySqlConnectionFactory {
    pub fn new(config: MySqlConfig) -> Self {
        Self {
            config,
            buffers: Arc::new(BufferPool::new()),
        }
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Pool sizing and reuse policy taken from the connection settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.config.max_pool_size)
            .min_size(self.config.min_pool_size)
            .lifetime(self.config.connection_lifetime)
            .reset_on_checkout(self.config.connection_reset)
            .max_idle_time(self.config.max_idle_time)
    }
}

impl ConnectionFactory for MySqlConnectionFactory {
    type Connection = Box<dyn Driver>;

    fn connect(&self) -> Result<Box<dyn Driver>> {
        let mut driver = new_driver(self.config.clone(), Some(Arc::clone(&self.buffers)));
        driver.open()?;
        Ok(driver)
    }

    fn validate(&self, conn: &mut Box<dyn Driver>) -> Result<()> {
        conn.ping()
    }

    fn reset(&self, conn: &mut Box<dyn Driver>) -> Result<()> {
        conn.reset()
    }

    fn is_broken(&self, conn: &Box<dyn Driver>) -> bool {
        conn.is_broken()
    }

    fn created_at(&self, conn: &Box<dyn Driver>) -> Instant {
        conn.created_at()
    }

    fn close(&self, mut conn: Box<dyn Driver>) {
        conn.close();
    }
}

/// A driver from [`connect`]: pooled, or owned outright when pooling is
/// off.
pub enum Connection {
    Pooled(PooledConnection<MySqlConnectionFactory>),
    Direct(Box<dyn Driver>),
}

impl Connection {
    pub fn is_pooled(&self) -> bool {
        matches!(self, Connection::Pooled(_))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pooled", &self.is_pooled())
            .field("thread_id", &self.thread_id())
            .finish()
    }
}

impl Deref for Connection {
    type Target = dyn Driver;

    fn deref(&self) -> &Self::Target {
        match self {
            Connection::Pooled(conn) => &***conn,
            Connection::Direct(driver) => &**driver,
        }
    }
}

impl DerefMut for Connection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Connection::Pooled(conn) => &mut ***conn,
            Connection::Direct(driver) => &mut **driver,
        }
    }
}

/// Get a driver for `config`.
///
/// With pooling on, the driver comes from the pool for
/// `config.pool_key()`, waiting up to `connect_timeout` for a free slot.
pub fn connect(registry: &MySqlPoolRegistry, config: &MySqlConfig) -> Result<Connection> {
    if !config.pooling {
        let mut driver = new_driver(config.clone(), None);
        driver.open()?;
        return Ok(Connection::Direct(driver));
    }

    let pool = registry.get_pool(&config.pool_key(), || {
        let factory = MySqlConnectionFactory::new(config.clone());
        let pool_config = factory.pool_config();
        Pool::new(factory, pool_config)
    })?;
    Ok(Connection::Pooled(pool.checkout(config.connect_timeout)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_config_from_settings() {
        let config = MySqlConfig::new()
            .min_pool_size(2)
            .max_pool_size(7)
            .connection_lifetime(Duration::from_secs(60))
            .connection_reset(true)
            .max_idle_time(Duration::from_secs(30));
        let pool_config = MySqlConnectionFactory::new(config).pool_config();
        assert_eq!(pool_config.min_size, 2);
        assert_eq!(pool_config.max_size, 7);
        assert_eq!(pool_config.lifetime, Duration::from_secs(60));
        assert!(pool_config.reset_on_checkout);
        assert_eq!(pool_config.max_idle_time, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_pool_sizes_are_rejected() {
        let registry = MySqlPoolRegistry::new();
        let config = MySqlConfig::new().min_pool_size(5).max_pool_size(1);
        let err = connect(&registry, &config).unwrap_err();
        assert!(matches!(err, sqlwire_core::Error::Pool(_)));
        assert!(registry.pool(&config.pool_key()).is_none());
    }

    #[test]
    fn test_unreachable_server_fails_without_pool() {
        let registry = MySqlPoolRegistry::new();
        let config = MySqlConfig::new()
            .host("192.0.2.1")
            .connect_timeout(Duration::from_millis(100))
            .pooling(false);
        assert!(connect(&registry, &config).is_err());
        assert!(registry.pool(&config.pool_key()).is_none());
    }
}
