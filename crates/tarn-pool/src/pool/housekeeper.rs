//! Periodic sweep: validation, age expiry, stuck-checkout kills, health.

use std::sync::atomic::Ordering;
use std::time::Instant;

use serde::Serialize;
use tarn_core::{DeathReason, HealthState, Mark, Status};
use tracing::{debug, info, warn};

use super::ConnectionPool;
use crate::handle::Handle;

const RECOUNT_ATTEMPTS: usize = 3;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Idle connections that passed validation.
    pub validated: usize,
    pub failed_validation: usize,
    /// Idle connections destroyed for age or an expiry mark.
    pub expired: usize,
    /// Active connections past their lifetime, marked for expiry.
    pub marked: usize,
    pub stuck_killed: usize,
    pub recently_started: usize,
    /// Statuses whose incremental counter disagreed with a stable recount.
    pub counter_drift: usize,
    pub health: HealthState,
}

impl ConnectionPool {
    /// Run one housekeeping pass over every handle.
    ///
    /// Iterates newest first over a registry snapshot, so handles removed
    /// mid-sweep are simply skipped by the failed transitions.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if self.is_shutting_down() {
            report.health = self.health();
            return report;
        }

        let definition = self.definition();
        let now = Instant::now();
        let lifetime = definition.maximum_connection_lifetime();
        let max_active = definition.maximum_active_time();
        let recent = definition.recently_started_threshold();

        for handle in self.registry.snapshot().iter().rev() {
            if handle.transition(Status::Available, Status::Offline, &self.counters) {
                self.sweep_idle(handle, now, &mut report);
                continue;
            }

            let Some(active_for) = handle.active_for(now) else {
                continue;
            };
            if active_for > max_active {
                let requester = handle.requester().unwrap_or_else(|| "unknown".to_string());
                let last_command = handle.last_command();
                warn!(
                    alias = %self.alias,
                    id = handle.id(),
                    active_ms = active_for.as_millis() as u64,
                    requester = %requester,
                    last_command = last_command.as_deref().unwrap_or("-"),
                    "connection active too long, killing"
                );
                if self.expire(handle, DeathReason::ActiveTooLong) {
                    report.stuck_killed += 1;
                }
                continue;
            }
            if handle.age(now) > lifetime && handle.mark() != Mark::MarkedForExpiry {
                handle.mark_for_expiry();
                report.marked += 1;
                debug!(alias = %self.alias, id = handle.id(), "active connection past lifetime, marked for expiry");
            }
            if active_for < recent {
                report.recently_started += 1;
            }
        }

        report.counter_drift = self.verify_counters();
        self.recently_started.store(report.recently_started, Ordering::SeqCst);
        report.health = self.calculate_health(report.recently_started);

        if definition.verbose {
            info!(alias = %self.alias, ?report, live = self.counters.live(), "housekeeping sweep");
        } else {
            debug!(alias = %self.alias, ?report, live = self.counters.live(), "housekeeping sweep");
        }

        self.wake_prototyper();
        report
    }

    /// Handle already moved `Available -> Offline` by the sweep.
    fn sweep_idle(&self, handle: &Handle, now: Instant, report: &mut SweepReport) {
        let definition = self.definition();
        let too_old = handle.age(now) > definition.maximum_connection_lifetime();

        if too_old || handle.mark() == Mark::MarkedForExpiry {
            if handle.transition(Status::Offline, Status::Null, &self.counters) {
                let reason = if too_old {
                    DeathReason::Expired
                } else {
                    DeathReason::MarkedForExpiry
                };
                self.destroy(handle, reason);
                report.expired += 1;
            }
            return;
        }

        if !self.validate_handle(&definition, handle) {
            if handle.transition(Status::Offline, Status::Null, &self.counters) {
                self.destroy(handle, DeathReason::ValidationFailed);
                report.failed_validation += 1;
            }
            return;
        }

        if handle.transition(Status::Offline, Status::Available, &self.counters) {
            report.validated += 1;
        }
    }

    /// Recount statuses from the registry and report drift from the
    /// incremental counters. Never corrects them.
    ///
    /// A pass is only compared when no build was in flight and the counters
    /// did not move while it ran; otherwise it is retried a few times and
    /// then skipped until the next sweep.
    fn verify_counters(&self) -> usize {
        for _ in 0..RECOUNT_ATTEMPTS {
            if self.building_count() > 0 {
                return 0;
            }
            let before = self.counters.generation();
            let mut counted = [0usize; 3];
            for handle in self.registry.snapshot().iter() {
                if let Some(i) = handle.status().counter_index() {
                    counted[i] += 1;
                }
            }
            let tracked = Status::COUNTED.map(|status| self.counters.get(status));
            if self.counters.generation() != before {
                continue;
            }

            let mut drifted = 0;
            for (i, status) in Status::COUNTED.into_iter().enumerate() {
                let Some(slot) = status.counter_index() else {
                    continue;
                };
                if counted[slot] != tracked[i] {
                    drifted += 1;
                    warn!(
                        alias = %self.alias,
                        status = %status,
                        counted = counted[slot],
                        tracked = tracked[i],
                        "status counter drift"
                    );
                }
            }
            return drifted;
        }
        debug!(alias = %self.alias, "counters busy, recount skipped");
        0
    }
}
