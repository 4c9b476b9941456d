//! Request path: `acquire` and `release`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tarn_core::{DeathReason, PoolDefinition, PoolError, PoolResult, Status};
use tracing::{debug, warn};

use super::{ConnectionPool, PooledConnection};
use crate::handle::{Handle, ReleaseOutcome};

/// Holds one slot of the new-build throttle until dropped.
pub(super) struct BuildPermit<'a> {
    building: &'a AtomicUsize,
}

impl Drop for BuildPermit<'_> {
    fn drop(&mut self) {
        self.building.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Label for the calling thread, used when the caller gives none.
fn current_requester() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

impl ConnectionPool {
    /// Borrow a connection, labelled with the current thread.
    ///
    /// Never waits: when nothing can be handed out the call fails with a
    /// capacity error and the caller decides whether to retry.
    pub fn acquire(self: &Arc<Self>) -> PoolResult<PooledConnection> {
        self.acquire_as(&current_requester())
    }

    /// Borrow a connection on behalf of `requester`.
    pub fn acquire_as(self: &Arc<Self>, requester: &str) -> PoolResult<PooledConnection> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown(self.alias.clone()));
        }

        let definition = self.definition();
        let result = self.try_acquire(&definition, requester);

        match &result {
            Ok(conn) => {
                self.served.fetch_add(1, Ordering::SeqCst);
                self.recently_started.fetch_add(1, Ordering::SeqCst);
                if definition.trace {
                    debug!(alias = %self.alias, id = conn.id(), requester, "connection served");
                }
            }
            Err(err) => {
                self.record_refusal();
                if err.is_capacity() {
                    debug!(alias = %self.alias, requester, error = %err, "acquire refused");
                } else {
                    warn!(alias = %self.alias, requester, error = %err, "acquire failed");
                }
            }
        }

        self.refresh_health();
        self.wake_prototyper();
        result
    }

    fn try_acquire(
        self: &Arc<Self>,
        definition: &PoolDefinition,
        requester: &str,
    ) -> PoolResult<PooledConnection> {
        let available = self.counters.get(Status::Available);
        let live = self.counters.live();
        if live >= definition.maximum_connection_count && available < 1 {
            return Err(PoolError::CapacityExhausted {
                alias: self.alias.clone(),
                active: self.counters.get(Status::Active),
                max: definition.maximum_connection_count,
            });
        }

        let building = self.building.load(Ordering::SeqCst);
        if available < 1 && building >= definition.simultaneous_build_throttle {
            warn!(
                alias = %self.alias,
                building,
                limit = definition.simultaneous_build_throttle,
                "new-build throttle tripped"
            );
            return Err(PoolError::Throttled {
                alias: self.alias.clone(),
                building,
                limit: definition.simultaneous_build_throttle,
            });
        }

        if let Some((handle, checkout)) = self.claim_available(definition) {
            handle.set_requester(requester);
            debug!(alias = %self.alias, id = handle.id(), requester, "reused connection");
            return Ok(PooledConnection::new(self.clone(), handle, checkout));
        }

        let (handle, permit) = self.build_handle(definition, "on demand")?;
        self.commit_build(&handle, permit);
        let Some(checkout) = handle.claim(Status::Offline, &self.counters) else {
            self.expire(&handle, DeathReason::SetupFailed);
            return Err(PoolError::Build {
                alias: self.alias.clone(),
                message: format!("connection #{} could not be brought online", handle.id()),
            });
        };
        handle.set_requester(requester);
        self.listeners.birth(&self.alias, handle.id());
        if self.is_shutting_down() && self.expire(&handle, DeathReason::Shutdown) {
            return Err(PoolError::ShuttingDown(self.alias.clone()));
        }
        Ok(PooledConnection::new(self.clone(), handle, checkout))
    }

    /// Round-robin reuse scan: each registered handle is tried at most once.
    fn claim_available(&self, definition: &PoolDefinition) -> Option<(Arc<Handle>, u64)> {
        let handles = self.registry.snapshot();
        for _ in 0..handles.len() {
            let index = self.registry.next_index(handles.len())?;
            let handle = &handles[index];
            let Some(checkout) = handle.claim(Status::Available, &self.counters) else {
                continue;
            };
            if definition.test_before_use && !self.validate_handle(definition, handle) {
                debug!(alias = %self.alias, id = handle.id(), "connection failed test before use");
                self.expire(handle, DeathReason::UseTestFailed);
                continue;
            }
            return Some((handle.clone(), checkout));
        }
        None
    }

    /// Reserve a build slot under the allocation lock.
    ///
    /// Counts builds in flight towards the maximum so concurrent builders
    /// cannot overshoot it.
    pub(super) fn reserve_build(
        &self,
        definition: &PoolDefinition,
    ) -> PoolResult<(u64, BuildPermit<'_>)> {
        let mut next_id = self.next_id.lock();
        let building = self.building.load(Ordering::SeqCst);
        if building >= definition.simultaneous_build_throttle {
            return Err(PoolError::Throttled {
                alias: self.alias.clone(),
                building,
                limit: definition.simultaneous_build_throttle,
            });
        }
        if self.counters.live() + building >= definition.maximum_connection_count {
            return Err(PoolError::CapacityExhausted {
                alias: self.alias.clone(),
                active: self.counters.get(Status::Active),
                max: definition.maximum_connection_count,
            });
        }
        self.building.fetch_add(1, Ordering::SeqCst);
        let id = *next_id;
        *next_id += 1;
        Ok((
            id,
            BuildPermit {
                building: &self.building,
            },
        ))
    }

    /// Build one connection through the factory. The handle comes back
    /// `Offline`, uncounted, and not yet in the registry; its build slot
    /// stays held until [`commit_build`](Self::commit_build).
    pub(super) fn build_handle(
        &self,
        definition: &PoolDefinition,
        reason: &str,
    ) -> PoolResult<(Arc<Handle>, BuildPermit<'_>)> {
        let (id, permit) = self.reserve_build(definition)?;
        let raw = self.factory.build(definition).map_err(|message| PoolError::Build {
            alias: self.alias.clone(),
            message,
        })?;

        debug!(alias = %self.alias, id, reason, "built connection");
        Ok((Arc::new(Handle::new(id, raw)), permit))
    }

    /// Count a built handle and publish it. The build slot is released only
    /// once the handle is visible in the registry, so a counter recount never
    /// sees a counted handle it cannot find.
    pub(super) fn commit_build(&self, handle: &Arc<Handle>, permit: BuildPermit<'_>) {
        self.counters.added(Status::Offline);
        self.registry.insert(handle.clone());
        drop(permit);
    }

    /// Return a checkout. Best-effort: a stale or repeated release is logged
    /// and ignored.
    pub(super) fn release(&self, handle: &Arc<Handle>, checkout: u64) {
        let definition = self.definition();

        if definition.test_after_use
            && handle.is_checked_out_by(checkout)
            && !self.validate_handle(&definition, handle)
        {
            debug!(alias = %self.alias, id = handle.id(), "connection failed test after use");
            if handle.transition(Status::Active, Status::Null, &self.counters) {
                self.destroy(handle, DeathReason::UseTestFailed);
            }
        } else {
            match handle.release(checkout, &self.counters) {
                ReleaseOutcome::Returned => {
                    debug!(alias = %self.alias, id = handle.id(), "released connection");
                }
                ReleaseOutcome::Expired => {
                    self.destroy(handle, DeathReason::MarkedForExpiry);
                }
                ReleaseOutcome::NotCheckedOut => {
                    debug!(
                        alias = %self.alias,
                        id = handle.id(),
                        "release ignored, connection no longer checked out"
                    );
                    return;
                }
            }
        }

        self.refresh_health();
        self.wake_prototyper();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::collections::HashSet;
    use tarn_core::HealthState;

    fn make_pool(definition: PoolDefinition) -> (Arc<ConnectionPool>, Arc<MockFactory>) {
        let factory = MockFactory::new();
        let pool = ConnectionPool::builder("main", definition, factory.clone())
            .build()
            .unwrap();
        (pool, factory)
    }

    #[test]
    fn acquire_builds_then_reuses() {
        let (pool, factory) = make_pool(definition(0, 2));
        let first = pool.acquire().unwrap();
        let id = first.id();
        drop(first);
        assert_eq!(pool.available_count(), 1);

        let second = pool.acquire().unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(factory.builds(), 1);
        assert_eq!(pool.served_count(), 2);
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let (pool, _) = make_pool(definition(0, 3));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert!(a.id() < b.id() && b.id() < c.id());
    }

    #[test]
    fn capacity_exhausted_when_full() {
        let (pool, factory) = make_pool(definition(0, 1));
        let _held = pool.acquire().unwrap();

        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, PoolError::CapacityExhausted { max: 1, .. }));
        assert!(err.is_capacity());
        assert_eq!(pool.refused_count(), 1);
        assert_eq!(factory.builds(), 1);
        assert_eq!(pool.health(), HealthState::Overloaded);
    }

    #[test]
    fn build_failure_is_refused_not_retried() {
        let (pool, factory) = make_pool(definition(0, 2));
        factory.should_fail.store(true, Ordering::SeqCst);

        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, PoolError::Build { .. }));
        assert_eq!(pool.refused_count(), 1);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.building_count(), 0);
    }

    #[test]
    fn throttle_limits_builds_in_flight() {
        let (pool, _) = make_pool(definition(0, 5));
        let definition = pool.definition();
        let mut permits = Vec::new();
        for _ in 0..definition.simultaneous_build_throttle.min(5) {
            if let Ok((_, permit)) = pool.reserve_build(&definition) {
                permits.push(permit);
            }
        }
        assert_eq!(pool.building_count(), 5);
        assert!(pool.reserve_build(&definition).is_err());

        drop(permits);
        assert_eq!(pool.building_count(), 0);
    }

    #[test]
    fn throttle_trips_before_capacity() {
        let mut def = definition(0, 10);
        def.simultaneous_build_throttle = 1;
        let (pool, _) = make_pool(def);
        let definition = pool.definition();

        let (_, permit) = pool.reserve_build(&definition).unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, PoolError::Throttled { limit: 1, .. }));
        drop(permit);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn double_release_is_a_no_op() {
        let (pool, _) = make_pool(definition(0, 2));
        let mut conn = pool.acquire().unwrap();
        conn.close();
        conn.close();
        drop(conn);
        assert_eq!(pool.available_count(), 1);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn test_before_use_skips_broken_connection() {
        let (pool, factory) = make_pool(definition(0, 3).with_test_sql("SELECT 1"));
        let mut def = (*pool.definition()).clone();
        def.test_before_use = true;
        pool.update_definition(def).unwrap();

        let conn = pool.acquire().unwrap();
        let broken = conn.id();
        drop(conn);

        factory.healthy.store(false, Ordering::SeqCst);
        let conn = pool.acquire().unwrap();
        assert_ne!(conn.id(), broken);
        assert_eq!(factory.builds(), 2);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_after_use_destroys_broken_connection() {
        let mut def = definition(0, 2).with_test_sql("SELECT 1");
        def.test_after_use = true;
        let (pool, factory) = make_pool(def);

        let conn = pool.acquire().unwrap();
        factory.healthy.store(false, Ordering::SeqCst);
        drop(conn);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(factory.closes(), 1);
    }

    #[test]
    fn concurrent_acquire_never_double_issues() {
        let (pool, _) = make_pool(definition(0, 4));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..200 {
                        if let Ok(conn) = pool.acquire() {
                            assert!(pool.live_count() <= 4);
                            seen.push((conn.id(), conn.checkout()));
                        }
                    }
                    seen
                })
            })
            .collect();

        let mut checkouts = HashSet::new();
        for t in threads {
            for entry in t.join().unwrap() {
                assert!(checkouts.insert(entry), "checkout issued twice: {entry:?}");
            }
        }
        assert!(pool.live_count() <= 4);
        assert_eq!(pool.active_count(), 0);
    }
}
