//! Blocking connection pooling for SQLWire.
//!
//! A [`Pool`] hands out connections made by a [`ConnectionFactory`] and
//! takes them back when the [`PooledConnection`] guard drops. Pools are
//! partitioned by a normalized settings key in a [`PoolRegistry`], so two
//! configurations that would open identical physical connections share
//! one pool.
//!
//! Checkout order is LIFO: the most recently returned connection is handed
//! out first, which lets the rest age out under `max_idle_time`.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sqlwire_core::{Error, PoolError, PoolErrorKind, Result};

/// Creates, checks and disposes of the connections a pool manages.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send;

    /// Open a new connection.
    fn connect(&self) -> Result<Self::Connection>;

    /// Cheap liveness check run before an idle connection is reused.
    fn validate(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Clear session state before reuse.
    fn reset(&self, conn: &mut Self::Connection) -> Result<()>;

    /// The connection hit a fatal error and must not be reused.
    fn is_broken(&self, conn: &Self::Connection) -> bool;

    fn created_at(&self, conn: &Self::Connection) -> Instant;

    /// Dispose of a connection. Errors are swallowed.
    fn close(&self, conn: Self::Connection);
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections pre-created on first checkout
    pub min_size: usize,
    /// Upper bound on idle plus in-use connections
    pub max_size: usize,
    /// Maximum connection age; zero means unlimited
    pub lifetime: Duration,
    /// Reset session state on every reuse
    pub reset_on_checkout: bool,
    /// Idle connections older than this are evicted down to `min_size`
    pub max_idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 100,
            lifetime: Duration::ZERO,
            reset_on_checkout: false,
            max_idle_time: Duration::from_secs(180),
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    pub fn min_size(mut self, n: usize) -> Self {
        self.min_size = n;
        self
    }

    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn reset_on_checkout(mut self, enabled: bool) -> Self {
        self.reset_on_checkout = enabled;
        self
    }

    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(pool_error(PoolErrorKind::Config, "max pool size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(pool_error(
                PoolErrorKind::Config,
                format!(
                    "min pool size {} exceeds max pool size {}",
                    self.min_size, self.max_size
                ),
            ));
        }
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle plus in-use connections
    pub total_connections: usize,
    pub idle_connections: usize,
    /// Checked out, or reserved while being created
    pub active_connections: usize,
    /// Threads blocked in checkout
    pub pending_requests: usize,
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

#[derive(Debug)]
struct IdleConnection<C> {
    conn: C,
    since: Instant,
}

#[derive(Debug)]
struct PoolState<C> {
    /// Most recently returned at the back
    idle: VecDeque<IdleConnection<C>>,
    in_use: usize,
    waiting: usize,
    /// Bumped by `clear`; connections from older generations are discarded
    /// on release.
    generation: u64,
    warmed: bool,
    closed: bool,
}

/// A bounded pool of connections from one factory.
pub struct Pool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    available: Condvar,
}

impl<F: ConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: 0,
                waiting: 0,
                generation: 0,
                warmed: false,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total_connections: state.idle.len() + state.in_use,
            idle_connections: state.idle.len(),
            active_connections: state.in_use,
            pending_requests: state.waiting,
        }
    }

    /// Check a connection out, waiting up to `timeout` for one to free up.
    pub fn checkout(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection<F>> {
        let deadline = Instant::now() + timeout;
        self.warm_up();

        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(pool_error(PoolErrorKind::Closed, "pool is closed"));
            }

            if let Some(idle) = state.idle.pop_back() {
                state.in_use += 1;
                let generation = state.generation;
                drop(state);
                if let Some(conn) = self.revive(idle.conn) {
                    tracing::debug!(stats = ?self.stats(), "pool checkout (reused)");
                    return Ok(PooledConnection::new(Arc::clone(self), conn, generation));
                }
                state = self.state.lock();
                state.in_use -= 1;
                continue;
            }

            if state.idle.len() + state.in_use < self.config.max_size {
                state.in_use += 1;
                let generation = state.generation;
                drop(state);
                return match self.factory.connect() {
                    Ok(conn) => {
                        tracing::debug!(stats = ?self.stats(), "pool checkout (new)");
                        Ok(PooledConnection::new(Arc::clone(self), conn, generation))
                    }
                    Err(err) => {
                        self.state.lock().in_use -= 1;
                        self.available.notify_one();
                        Err(err)
                    }
                };
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    max_size = self.config.max_size,
                    waited_ms = timeout.as_millis() as u64,
                    "pool exhausted"
                );
                return Err(pool_error(
                    PoolErrorKind::Exhausted,
                    "timeout getting connection from the pool",
                ));
            }
            state.waiting += 1;
            self.available.wait_until(&mut state, deadline);
            state.waiting -= 1;
        }
    }

    /// Make an idle connection ready for reuse, or dispose of it.
    fn revive(&self, mut conn: F::Connection) -> Option<F::Connection> {
        if self.factory.is_broken(&conn) || self.expired(&conn) {
            self.factory.close(conn);
            return None;
        }
        if let Err(err) = self.factory.validate(&mut conn) {
            tracing::debug!(error = %err, "idle connection failed validation");
            self.factory.close(conn);
            return None;
        }
        if self.config.reset_on_checkout {
            if let Err(err) = self.factory.reset(&mut conn) {
                tracing::debug!(error = %err, "connection reset failed");
                self.factory.close(conn);
                return None;
            }
        }
        Some(conn)
    }

    fn expired(&self, conn: &F::Connection) -> bool {
        !self.config.lifetime.is_zero()
            && self.factory.created_at(conn).elapsed() >= self.config.lifetime
    }

    /// Create `min_size` connections the first time the pool is used.
    fn warm_up(&self) {
        let needed = {
            let mut state = self.state.lock();
            if state.warmed {
                return;
            }
            state.warmed = true;
            let needed = self
                .config
                .min_size
                .saturating_sub(state.idle.len() + state.in_use);
            state.in_use += needed;
            needed
        };
        if needed == 0 {
            return;
        }

        let mut created = Vec::with_capacity(needed);
        for _ in 0..needed {
            match self.factory.connect() {
                Ok(conn) => created.push(conn),
                Err(err) => {
                    tracing::warn!(error = %err, "pool warm-up connect failed");
                    break;
                }
            }
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        state.in_use -= needed;
        tracing::debug!(created = created.len(), min_size = self.config.min_size, "pool warmed");
        state
            .idle
            .extend(created.into_iter().map(|conn| IdleConnection { conn, since: now }));
        drop(state);
        self.available.notify_all();
    }

    fn release(&self, conn: F::Connection, generation: u64) {
        let mut state = self.state.lock();
        state.in_use -= 1;
        let discard = state.closed
            || generation != state.generation
            || self.factory.is_broken(&conn)
            || self.expired(&conn);
        if discard {
            drop(state);
            tracing::debug!("pool release (discarded)");
            self.factory.close(conn);
        } else {
            state.idle.push_back(IdleConnection {
                conn,
                since: Instant::now(),
            });
            drop(state);
            tracing::debug!("pool release");
        }
        self.available.notify_one();
    }

    fn forget(&self) {
        self.state.lock().in_use -= 1;
        self.available.notify_one();
    }

    /// Close idle connections now; in-use ones are closed on release.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.idle.drain(..).collect()
        };
        tracing::info!(closed = drained.len(), "pool cleared");
        for idle in drained {
            self.factory.close(idle.conn);
        }
        self.available.notify_all();
    }

    /// Clear and refuse further checkouts.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.clear();
    }

    /// Evict connections idle longer than `max_idle_time`, keeping at
    /// least `min_size` idle. Returns how many were closed.
    pub fn remove_idle(&self, now: Instant) -> usize {
        let evicted: Vec<_> = {
            let mut state = self.state.lock();
            let mut evicted = Vec::new();
            while state.idle.len() > self.config.min_size {
                let stale = state.idle.front().is_some_and(|idle| {
                    now.saturating_duration_since(idle.since) >= self.config.max_idle_time
                });
                if !stale {
                    break;
                }
                if let Some(idle) = state.idle.pop_front() {
                    evicted.push(idle);
                }
            }
            evicted
        };
        let count = evicted.len();
        if count > 0 {
            tracing::debug!(evicted = count, "evicted idle connections");
        }
        for idle in evicted {
            self.factory.close(idle.conn);
        }
        count
    }
}

/// A connection checked out of a [`Pool`], returned on drop.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<Pool<F>>,
    conn: Option<F::Connection>,
    generation: u64,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(pool: Arc<Pool<F>>, conn: F::Connection, generation: u64) -> Self {
        Self {
            pool,
            conn: Some(conn),
            generation,
        }
    }

    pub fn pool(&self) -> &Arc<Pool<F>> {
        &self.pool
    }

    /// Take the connection out of pool accounting.
    pub fn detach(mut self) -> Option<F::Connection> {
        let conn = self.conn.take();
        if conn.is_some() {
            self.pool.forget();
        }
        conn
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `detach` and `drop` take the connection, both by value.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.generation);
        }
    }
}

type PoolMap<F> = Arc<Mutex<HashMap<String, Arc<Pool<F>>>>>;

struct Cleaner {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

/// One pool per normalized settings key.
pub struct PoolRegistry<F: ConnectionFactory> {
    pools: PoolMap<F>,
    cleaner: Option<Cleaner>,
}

impl<F: ConnectionFactory> Default for PoolRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PoolRegistry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.pools.lock().len())
            .field("cleaner", &self.cleaner.is_some())
            .finish()
    }
}

impl<F: ConnectionFactory> PoolRegistry<F> {
    pub fn new() -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            cleaner: None,
        }
    }

    /// Pool for `key`, created with `create` the first time.
    pub fn get_pool(
        &self,
        key: &str,
        create: impl FnOnce() -> Result<Pool<F>>,
    ) -> Result<Arc<Pool<F>>> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(key) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(create()?);
        pools.insert(key.to_string(), Arc::clone(&pool));
        tracing::debug!(pools = pools.len(), "pool created");
        Ok(pool)
    }

    pub fn pool(&self, key: &str) -> Option<Arc<Pool<F>>> {
        self.pools.lock().get(key).cloned()
    }

    pub fn clear_pool(&self, key: &str) {
        if let Some(pool) = self.pool(key) {
            pool.clear();
        }
    }

    pub fn clear_all_pools(&self) {
        for pool in self.snapshot() {
            pool.clear();
        }
    }

    /// Evict stale idle connections from every pool.
    pub fn clean_idle(&self) -> usize {
        clean_idle(&self.pools)
    }

    fn snapshot(&self) -> Vec<Arc<Pool<F>>> {
        self.pools.lock().values().cloned().collect()
    }

    /// Run [`Self::clean_idle`] every `interval` on a background thread
    /// until the registry is dropped.
    pub fn start_cleaner(&mut self, interval: Duration) -> Result<()> {
        if self.cleaner.is_some() {
            return Ok(());
        }
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let pools = Arc::clone(&self.pools);
        let signal = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("sqlwire-pool-cleaner".to_string())
            .spawn(move || {
                let (stopped, wake) = &*signal;
                let mut stopped = stopped.lock();
                while !*stopped {
                    if wake.wait_for(&mut stopped, interval).timed_out() {
                        clean_idle(&pools);
                    }
                }
            })
            .map_err(Error::Io)?;
        self.cleaner = Some(Cleaner { stop, handle });
        Ok(())
    }
}

fn clean_idle<F: ConnectionFactory>(pools: &PoolMap<F>) -> usize {
    let pools: Vec<_> = pools.lock().values().cloned().collect();
    let now = Instant::now();
    pools.iter().map(|pool| pool.remove_idle(now)).sum()
}

impl<F: ConnectionFactory> Drop for PoolRegistry<F> {
    fn drop(&mut self) {
        if let Some(cleaner) = self.cleaner.take() {
            let (stopped, wake) = &*cleaner.stop;
            *stopped.lock() = true;
            wake.notify_all();
            let _ = cleaner.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlwire_core::ConnectionErrorKind;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct MockConn {
        id: usize,
        broken: bool,
        created_at: Instant,
    }

    #[derive(Debug, Default)]
    struct MockFactory {
        next_id: AtomicUsize,
        closed: AtomicUsize,
        resets: AtomicUsize,
        fail_connect: AtomicBool,
        fail_validate: AtomicBool,
    }

    impl ConnectionFactory for MockFactory {
        type Connection = MockConn;

        fn connect(&self) -> Result<MockConn> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(Error::connection(ConnectionErrorKind::Refused, "refused"));
            }
            Ok(MockConn {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                broken: false,
                created_at: Instant::now(),
            })
        }

        fn validate(&self, _conn: &mut MockConn) -> Result<()> {
            if self.fail_validate.load(Ordering::SeqCst) {
                Err(Error::connection(ConnectionErrorKind::Disconnected, "gone"))
            } else {
                Ok(())
            }
        }

        fn reset(&self, _conn: &mut MockConn) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_broken(&self, conn: &MockConn) -> bool {
            conn.broken
        }

        fn created_at(&self, conn: &MockConn) -> Instant {
            conn.created_at
        }

        fn close(&self, _conn: MockConn) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(config: PoolConfig) -> Arc<Pool<MockFactory>> {
        Arc::new(Pool::new(MockFactory::default(), config).unwrap())
    }

    const WAIT: Duration = Duration::from_millis(50);

    #[test]
    fn test_config_validation() {
        assert!(Pool::new(MockFactory::default(), PoolConfig::new(0)).is_err());
        assert!(Pool::new(MockFactory::default(), PoolConfig::new(2).min_size(3)).is_err());
    }

    #[test]
    fn test_reuse_is_lifo() {
        let pool = pool(PoolConfig::new(4));
        let a = pool.checkout(WAIT).unwrap();
        let b = pool.checkout(WAIT).unwrap();
        let (a_id, b_id) = (a.id, b.id);
        drop(a);
        drop(b);

        let c = pool.checkout(WAIT).unwrap();
        assert_eq!(c.id, b_id);
        let d = pool.checkout(WAIT).unwrap();
        assert_eq!(d.id, a_id);
        assert_eq!(pool.factory().next_id.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exhausted_after_timeout() {
        let pool = pool(PoolConfig::new(1));
        let _held = pool.checkout(WAIT).unwrap();
        let start = Instant::now();
        let err = pool.checkout(WAIT).unwrap_err();
        assert!(start.elapsed() >= WAIT);
        assert!(matches!(err, Error::Pool(ref p) if p.kind == PoolErrorKind::Exhausted));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_waiter_gets_released_connection() {
        let pool = pool(PoolConfig::new(1));
        let held = pool.checkout(WAIT).unwrap();
        let id = held.id;

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.checkout(Duration::from_secs(5)).map(|c| c.id))
        };
        while pool.stats().pending_requests == 0 {
            std::thread::yield_now();
        }
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn test_broken_connection_is_discarded() {
        let pool = pool(PoolConfig::new(2));
        let mut conn = pool.checkout(WAIT).unwrap();
        conn.broken = true;
        drop(conn);

        assert_eq!(pool.stats().total_connections, 0);
        assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_validation_creates_fresh_connection() {
        let pool = pool(PoolConfig::new(2));
        drop(pool.checkout(WAIT).unwrap());
        pool.factory().fail_validate.store(true, Ordering::SeqCst);

        let conn = pool.checkout(WAIT).unwrap();
        assert_eq!(conn.id, 1);
        assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_failure_releases_slot() {
        let pool = pool(PoolConfig::new(1));
        pool.factory().fail_connect.store(true, Ordering::SeqCst);
        assert!(pool.checkout(WAIT).is_err());
        assert_eq!(pool.stats(), PoolStats::default());

        pool.factory().fail_connect.store(false, Ordering::SeqCst);
        assert!(pool.checkout(WAIT).is_ok());
    }

    #[test]
    fn test_reset_on_checkout() {
        let pool = pool(PoolConfig::new(1).reset_on_checkout(true));
        drop(pool.checkout(WAIT).unwrap());
        assert_eq!(pool.factory().resets.load(Ordering::SeqCst), 0);
        drop(pool.checkout(WAIT).unwrap());
        assert_eq!(pool.factory().resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expired_lifetime_is_not_reused() {
        let pool = pool(PoolConfig::new(1).lifetime(Duration::from_millis(1)));
        let conn = pool.checkout(WAIT).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        drop(conn);
        assert_eq!(pool.stats().idle_connections, 0);
        assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_discards_in_use_on_release() {
        let pool = pool(PoolConfig::new(3));
        let held = pool.checkout(WAIT).unwrap();
        drop(pool.checkout(WAIT).unwrap());
        assert_eq!(pool.stats().idle_connections, 1);

        pool.clear();
        assert_eq!(pool.stats().idle_connections, 0);
        drop(held);
        assert_eq!(pool.stats().total_connections, 0);
        assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closed_pool_refuses_checkout() {
        let pool = pool(PoolConfig::new(1));
        pool.close();
        let err = pool.checkout(WAIT).unwrap_err();
        assert!(matches!(err, Error::Pool(ref p) if p.kind == PoolErrorKind::Closed));
    }

    #[test]
    fn test_min_size_warm_up_and_idle_eviction() {
        let pool = pool(PoolConfig::new(5).min_size(2).max_idle_time(Duration::ZERO));
        let extra: Vec<_> = (0..4).map(|_| pool.checkout(WAIT).unwrap()).collect();
        assert_eq!(pool.factory().next_id.load(Ordering::SeqCst), 4);
        drop(extra);
        assert_eq!(pool.stats().idle_connections, 4);

        let evicted = pool.remove_idle(Instant::now());
        assert_eq!(evicted, 2);
        assert_eq!(pool.stats().idle_connections, 2);
    }

    #[test]
    fn test_detach_frees_slot() {
        let pool = pool(PoolConfig::new(1));
        let conn = pool.checkout(WAIT).unwrap().detach().unwrap();
        assert_eq!(conn.id, 0);
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(pool.checkout(WAIT).is_ok());
    }

    #[test]
    fn test_concurrent_checkouts_stay_bounded_and_unique() {
        const MAX: usize = 3;
        let pool = pool(PoolConfig::new(MAX));
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let in_use = Arc::clone(&in_use);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let conn = pool.checkout(Duration::from_secs(10)).unwrap();
                        assert!(in_use.lock().insert(conn.id), "connection handed out twice");
                        let stats = pool.stats();
                        assert!(stats.total_connections <= MAX);
                        std::thread::yield_now();
                        assert!(in_use.lock().remove(&conn.id));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert!(stats.idle_connections <= MAX);
        assert!(pool.factory().next_id.load(Ordering::SeqCst) <= MAX);
    }

    #[test]
    fn test_registry_partitions_by_key() {
        let registry: PoolRegistry<MockFactory> = PoolRegistry::new();
        let a = registry
            .get_pool("a", || Pool::new(MockFactory::default(), PoolConfig::new(1)))
            .unwrap();
        let a2 = registry
            .get_pool("a", || panic!("pool already exists"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &a2));

        let b = registry
            .get_pool("b", || Pool::new(MockFactory::default(), PoolConfig::new(1)))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        drop(a.checkout(WAIT).unwrap());
        registry.clear_all_pools();
        assert_eq!(a.stats().idle_connections, 0);
        assert!(registry.pool("missing").is_none());
    }

    #[test]
    fn test_registry_cleaner_thread() {
        let mut registry: PoolRegistry<MockFactory> = PoolRegistry::new();
        let pool = registry
            .get_pool("k", || {
                Pool::new(
                    MockFactory::default(),
                    PoolConfig::new(2).max_idle_time(Duration::ZERO),
                )
            })
            .unwrap();
        drop(pool.checkout(WAIT).unwrap());
        registry.start_cleaner(Duration::from_millis(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().idle_connections > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.stats().idle_connections, 0);
        drop(registry);
    }
}
