//! Connection pool — one alias, one definition, one set of handles.
//!
//! # Architecture
//!
//! ```text
//! acquire()
//!   → fast-fail: live >= max and nothing available → CapacityExhausted
//!   → throttle: nothing available and too many builds in flight → Throttled
//!   → round-robin reuse scan: Available → Active
//!   → build on demand via ConnectionFactory: Offline → Active
//! PooledConnection::drop / close()
//!   → marked for expiry: Active → Null, destroy
//!   → otherwise: Active → Available
//! Shared sweep workers (see `scheduler`)
//!   → sweep(): validate, expire, kill stuck checkouts, recompute health
//!   → prototype(): top up towards minimum / spare target
//! ```
//!
//! The pool is always held in an `Arc`; background jobs keep only a `Weak`
//! reference so dropping the last handle on a pool lets it go.

mod allocator;
mod connection;
mod housekeeper;
mod prototyper;

pub use connection::PooledConnection;
pub use housekeeper::SweepReport;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tarn_core::{
    ConnectionFactory, ConnectionListener, DeathReason, DefinitionListener, HealthListener,
    HealthState, PoolDefinition, PoolError, PoolResult, PoolSnapshot, SqlValidator, Status,
    Validator,
};
use tracing::{debug, info, warn};

use crate::counters::StatusCounters;
use crate::events::Listeners;
use crate::handle::Handle;
use crate::registry::HandleRegistry;
use crate::scheduler::SchedulerHandle;

/// Poll interval while waiting for checkouts to drain on shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Builder for a [`ConnectionPool`].
pub struct PoolBuilder {
    alias: String,
    definition: PoolDefinition,
    factory: Arc<dyn ConnectionFactory>,
    validator: Arc<dyn Validator>,
    listeners: Listeners,
}

impl PoolBuilder {
    /// Replace the default [`SqlValidator`].
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn connection_listener(self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listeners.add_connection(listener);
        self
    }

    pub fn health_listener(self, listener: Arc<dyn HealthListener>) -> Self {
        self.listeners.add_health(listener);
        self
    }

    pub fn definition_listener(self, listener: Arc<dyn DefinitionListener>) -> Self {
        self.listeners.add_definition(listener);
        self
    }

    pub fn build(self) -> PoolResult<Arc<ConnectionPool>> {
        if self.alias.trim().is_empty() {
            return Err(PoolError::InvalidDefinition(
                "pool alias must not be empty".to_string(),
            ));
        }
        self.definition.validate()?;

        let PoolBuilder {
            alias,
            definition,
            factory,
            validator,
            listeners,
        } = self;

        Ok(Arc::new_cyclic(|self_ref| ConnectionPool {
            alias,
            definition: ArcSwap::from_pointee(definition),
            factory,
            validator,
            registry: HandleRegistry::new(),
            counters: StatusCounters::new(),
            next_id: Mutex::new(1),
            building: AtomicUsize::new(0),
            recently_started: AtomicUsize::new(0),
            served: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            last_refusal: Mutex::new(None),
            health: Mutex::new(HealthState::default()),
            shutting_down: AtomicBool::new(false),
            prototype_pending: AtomicBool::new(false),
            listeners,
            scheduler: OnceLock::new(),
            self_ref: self_ref.clone(),
        }))
    }
}

/// A pool of connections for one alias.
pub struct ConnectionPool {
    alias: String,
    /// Swapped whole on update; readers load one consistent value.
    definition: ArcSwap<PoolDefinition>,
    factory: Arc<dyn ConnectionFactory>,
    validator: Arc<dyn Validator>,
    registry: HandleRegistry,
    counters: StatusCounters,
    /// Allocation lock: serializes ID assignment and build reservations.
    next_id: Mutex<u64>,
    /// Connections currently inside `ConnectionFactory::build`.
    building: AtomicUsize,
    /// Checkouts younger than the recently-started threshold as of the last
    /// sweep, plus every checkout served since.
    recently_started: AtomicUsize,
    served: AtomicU64,
    refused: AtomicU64,
    last_refusal: Mutex<Option<Instant>>,
    health: Mutex<HealthState>,
    shutting_down: AtomicBool,
    /// Set while a prototype job is queued, so repeated wakes coalesce.
    prototype_pending: AtomicBool,
    listeners: Listeners,
    scheduler: OnceLock<SchedulerHandle>,
    self_ref: Weak<ConnectionPool>,
}

impl ConnectionPool {
    /// Start building a pool for `alias`.
    pub fn builder(
        alias: &str,
        definition: PoolDefinition,
        factory: Arc<dyn ConnectionFactory>,
    ) -> PoolBuilder {
        PoolBuilder {
            alias: alias.to_string(),
            definition,
            factory,
            validator: Arc::new(SqlValidator),
            listeners: Listeners::default(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The current definition.
    pub fn definition(&self) -> Arc<PoolDefinition> {
        self.definition.load_full()
    }

    pub fn health(&self) -> HealthState {
        *self.health.lock()
    }

    pub fn live_count(&self) -> usize {
        self.counters.live()
    }

    pub fn available_count(&self) -> usize {
        self.counters.get(Status::Available)
    }

    pub fn active_count(&self) -> usize {
        self.counters.get(Status::Active)
    }

    pub fn offline_count(&self) -> usize {
        self.counters.get(Status::Offline)
    }

    pub fn building_count(&self) -> usize {
        self.building.load(Ordering::SeqCst)
    }

    pub fn served_count(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn refused_count(&self) -> u64 {
        self.refused.load(Ordering::SeqCst)
    }

    /// Number of handles in the registry.
    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add_connection(listener);
    }

    pub fn add_health_listener(&self, listener: Arc<dyn HealthListener>) {
        self.listeners.add_health(listener);
    }

    pub fn add_definition_listener(&self, listener: Arc<dyn DefinitionListener>) {
        self.listeners.add_definition(listener);
    }

    /// Hand the pool to the shared sweep workers. Only the first call wins.
    pub(crate) fn attach(&self, scheduler: SchedulerHandle) -> bool {
        self.scheduler.set(scheduler).is_ok()
    }

    /// Ask the shared workers for a prototype pass. No-op when detached,
    /// shutting down, or when a pass is already queued.
    pub fn wake_prototyper(&self) {
        if self.is_shutting_down() {
            return;
        }
        let Some(scheduler) = self.scheduler.get() else {
            return;
        };
        if self.prototype_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        scheduler.schedule_prototype(self.self_ref.clone());
    }

    /// Called by the worker that picked up the queued prototype job.
    pub(crate) fn clear_prototype_pending(&self) {
        self.prototype_pending.store(false, Ordering::SeqCst);
    }

    /// Recompute aggregate health and notify listeners on change.
    fn calculate_health(&self, recently_started: usize) -> HealthState {
        let definition = self.definition();
        let available = self.counters.get(Status::Available);
        let active = self.counters.get(Status::Active);
        let refused_recently = self
            .last_refusal
            .lock()
            .is_some_and(|at| at.elapsed() < definition.overload_without_refusal_lifetime());

        let next = if available == 0 && recently_started == 0 {
            HealthState::Down
        } else if refused_recently {
            HealthState::Overloaded
        } else if active > 0 {
            HealthState::Busy
        } else {
            HealthState::Quiet
        };

        let previous = std::mem::replace(&mut *self.health.lock(), next);
        if previous != next {
            info!(alias = %self.alias, from = %previous, to = %next, "pool health changed");
            self.listeners.health_changed(&self.alias, next);
        }
        next
    }

    /// Recompute health from the aggregate counts. Does not scan the
    /// registry; the recently-started count is refreshed by each sweep.
    pub fn refresh_health(&self) -> HealthState {
        self.calculate_health(self.recently_started.load(Ordering::SeqCst))
    }

    fn record_refusal(&self) {
        self.refused.fetch_add(1, Ordering::SeqCst);
        *self.last_refusal.lock() = Some(Instant::now());
    }

    /// Physically close a handle that has already reached `Null`, remove it
    /// from the registry, and notify listeners.
    fn destroy(&self, handle: &Handle, reason: DeathReason) {
        handle.close_connection();
        self.registry.remove(handle.id());
        debug!(
            alias = %self.alias,
            id = handle.id(),
            reason = %reason,
            live = self.counters.live(),
            "destroyed connection"
        );
        self.listeners.death(&self.alias, handle.id(), reason);
    }

    /// Force a handle to `Null` from whatever status it is in and destroy it.
    /// Returns `false` if someone else already did.
    fn expire(&self, handle: &Handle, reason: DeathReason) -> bool {
        if handle.force_null(&self.counters) {
            self.destroy(handle, reason);
            true
        } else {
            false
        }
    }

    /// Run the validator against a handle's connection.
    fn validate_handle(&self, definition: &PoolDefinition, handle: &Handle) -> bool {
        handle
            .with_connection(|conn| self.validator.validate(definition, conn))
            .unwrap_or(false)
    }

    /// Kill one connection by ID.
    ///
    /// A merciful kill only takes an idle connection; an active one is
    /// marked for expiry instead and `false` is returned.
    pub fn kill_connection(&self, id: u64, merciful: bool) -> PoolResult<bool> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| PoolError::ConnectionNotFound {
                alias: self.alias.clone(),
                id,
            })?;

        let killed = if merciful {
            if handle.transition(Status::Available, Status::Offline, &self.counters)
                && handle.transition(Status::Offline, Status::Null, &self.counters)
            {
                self.destroy(&handle, DeathReason::ManualKill);
                true
            } else {
                handle.mark_for_expiry();
                false
            }
        } else {
            self.expire(&handle, DeathReason::ManualKill)
        };

        info!(alias = %self.alias, id, merciful, killed, "kill connection requested");
        self.refresh_health();
        self.wake_prototyper();
        Ok(killed)
    }

    /// Kill every connection. Merciful kills leave active connections
    /// marked for expiry. Returns the number destroyed now.
    pub fn kill_all(&self, merciful: bool) -> usize {
        let mut killed = 0;
        for handle in self.registry.snapshot().iter() {
            let done = if merciful {
                if handle.transition(Status::Available, Status::Offline, &self.counters)
                    && handle.transition(Status::Offline, Status::Null, &self.counters)
                {
                    self.destroy(handle, DeathReason::ManualKill);
                    true
                } else {
                    handle.mark_for_expiry();
                    false
                }
            } else {
                self.expire(handle, DeathReason::ManualKill)
            };
            if done {
                killed += 1;
            }
        }
        info!(alias = %self.alias, merciful, killed, "kill all connections requested");
        self.refresh_health();
        self.wake_prototyper();
        killed
    }

    /// Replace the definition atomically.
    pub fn update_definition(&self, definition: PoolDefinition) -> PoolResult<()> {
        definition.validate()?;
        let definition = Arc::new(definition);
        self.definition.store(definition.clone());
        info!(
            alias = %self.alias,
            max = definition.maximum_connection_count,
            min = definition.minimum_connection_count,
            spare = definition.prototype_count,
            "pool definition updated"
        );
        self.listeners.definition_changed(&self.alias, &definition);
        self.wake_prototyper();
        Ok(())
    }

    /// Diagnostic snapshot; `detail` adds one entry per connection.
    pub fn snapshot(&self, detail: bool) -> PoolSnapshot {
        let definition = self.definition();
        let now = Instant::now();
        let connections = if detail {
            self.registry
                .snapshot()
                .iter()
                .map(|h| h.snapshot(now))
                .collect()
        } else {
            Vec::new()
        };

        PoolSnapshot {
            alias: self.alias.clone(),
            health: self.health(),
            live: self.live_count(),
            available: self.available_count(),
            active: self.active_count(),
            offline: self.offline_count(),
            building: self.building_count(),
            served: self.served_count(),
            refused: self.refused_count(),
            maximum_connection_count: definition.maximum_connection_count,
            minimum_connection_count: definition.minimum_connection_count,
            connections,
        }
    }

    /// Stop accepting acquisitions, wait up to `delay` for checkouts to
    /// drain, then force-close every remaining connection.
    ///
    /// Returns the number of active connections that were force-closed.
    /// A repeated call is logged and returns 0.
    pub async fn shutdown(&self, delay: Duration) -> usize {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!(alias = %self.alias, "pool already shutting down, ignoring duplicate shutdown");
            return 0;
        }
        info!(alias = %self.alias, delay = ?delay, "pool shutdown started");

        // No deadline when the delay is too large to represent.
        let deadline = Instant::now().checked_add(delay);
        loop {
            let active = self.active_count();
            if active == 0 {
                debug!(alias = %self.alias, "all checkouts drained");
                break;
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                warn!(
                    alias = %self.alias,
                    remaining = active,
                    "drain delay expired, force-closing active connections"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let mut force_closed = 0;
        let mut closed = 0;
        for handle in self.registry.snapshot().iter() {
            let was_active = handle.status() == Status::Active;
            if self.expire(handle, DeathReason::Shutdown) {
                closed += 1;
                if was_active {
                    force_closed += 1;
                }
            }
        }

        info!(alias = %self.alias, closed, force_closed, "pool shutdown complete");
        force_closed
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("alias", &self.alias)
            .field("live", &self.live_count())
            .field("health", &self.health())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
