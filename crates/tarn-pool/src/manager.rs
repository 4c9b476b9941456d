//! Alias → pool registry with explicit start-up and teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tarn_core::{ConnectionFactory, PoolDefinition, PoolError, PoolResult, PoolSnapshot};
use tracing::{info, warn};

use crate::pool::{ConnectionPool, PooledConnection};
use crate::scheduler::SweepScheduler;

/// Owns every registered pool and the sweep workers they share.
///
/// Created explicitly and torn down with [`PoolManager::shutdown`]; there is
/// no process-wide instance.
pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    scheduler: SweepScheduler,
    shut_down: AtomicBool,
}

impl PoolManager {
    /// Start a manager with `workers` shared sweep workers. Must be called
    /// from within a tokio runtime.
    pub fn new(workers: usize) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            scheduler: SweepScheduler::start(workers),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a built pool and start its housekeeping and prototyping.
    pub fn register(&self, pool: Arc<ConnectionPool>) -> PoolResult<Arc<ConnectionPool>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown(pool.alias().to_string()));
        }
        let alias = pool.alias().to_string();
        {
            let mut pools = self.pools.write();
            if pools.contains_key(&alias) {
                return Err(PoolError::AlreadyRegistered(alias));
            }
            if !self.scheduler.register(&pool) {
                return Err(PoolError::AlreadyRegistered(alias));
            }
            pools.insert(alias.clone(), pool.clone());
        }

        let definition = pool.definition();
        info!(
            alias = %alias,
            min = definition.minimum_connection_count,
            max = definition.maximum_connection_count,
            spare = definition.prototype_count,
            "pool registered"
        );
        Ok(pool)
    }

    /// Build a pool with the default validator and register it.
    pub fn register_definition(
        &self,
        alias: &str,
        definition: PoolDefinition,
        factory: Arc<dyn ConnectionFactory>,
    ) -> PoolResult<Arc<ConnectionPool>> {
        let pool = ConnectionPool::builder(alias, definition, factory).build()?;
        self.register(pool)
    }

    pub fn pool(&self, alias: &str) -> PoolResult<Arc<ConnectionPool>> {
        self.pools
            .read()
            .get(alias)
            .cloned()
            .ok_or_else(|| PoolError::PoolNotFound(alias.to_string()))
    }

    /// Registered aliases, sorted.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.pools.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn acquire(&self, alias: &str) -> PoolResult<PooledConnection> {
        self.pool(alias)?.acquire()
    }

    pub fn kill_connection(&self, alias: &str, id: u64, merciful: bool) -> PoolResult<bool> {
        self.pool(alias)?.kill_connection(id, merciful)
    }

    pub fn kill_all(&self, alias: &str, merciful: bool) -> PoolResult<usize> {
        Ok(self.pool(alias)?.kill_all(merciful))
    }

    pub fn snapshot(&self, alias: &str, detail: bool) -> PoolResult<PoolSnapshot> {
        Ok(self.pool(alias)?.snapshot(detail))
    }

    pub fn update_definition(&self, alias: &str, definition: PoolDefinition) -> PoolResult<()> {
        self.pool(alias)?.update_definition(definition)
    }

    /// Deregister a pool and shut it down, waiting up to `delay` for
    /// checkouts to drain. Returns the number of force-closed connections.
    pub async fn remove(&self, alias: &str, delay: Duration) -> PoolResult<usize> {
        let pool = self
            .pools
            .write()
            .remove(alias)
            .ok_or_else(|| PoolError::PoolNotFound(alias.to_string()))?;
        let forced = pool.shutdown(delay).await;
        info!(alias = %alias, forced, "pool removed");
        Ok(forced)
    }

    /// Shut down every pool within one shared `delay`, then stop the sweep
    /// workers. Repeated calls are logged and ignored.
    pub async fn shutdown(&self, delay: Duration) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            warn!("pool manager already shut down, ignoring duplicate shutdown");
            return;
        }
        let pools: Vec<Arc<ConnectionPool>> = self.pools.write().drain().map(|(_, p)| p).collect();
        info!(pools = pools.len(), delay = ?delay, "pool manager shutting down");

        let deadline = Instant::now().checked_add(delay);
        for pool in pools {
            let remaining = match deadline {
                Some(at) => at.saturating_duration_since(Instant::now()),
                None => delay,
            };
            pool.shutdown(remaining).await;
        }
        self.scheduler.shutdown().await;
        info!("pool manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("aliases", &self.aliases())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
