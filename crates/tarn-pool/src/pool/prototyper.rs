//! Background top-up towards the minimum and spare-target counts.

use tarn_core::{DeathReason, PoolDefinition, Status};
use tracing::{debug, warn};

use super::ConnectionPool;

impl ConnectionPool {
    /// Build connections until neither the minimum nor the spare target
    /// calls for another one. Returns the number built.
    ///
    /// Stops at the first build failure; the next wake or sweep retries.
    pub fn prototype(&self) -> usize {
        let mut built = 0;
        loop {
            if self.is_shutting_down() {
                break;
            }
            let definition = self.definition();
            let Some(reason) = self.prototype_reason(&definition) else {
                break;
            };

            let (handle, permit) = match self.build_handle(&definition, reason) {
                Ok(built) => built,
                Err(err) => {
                    if err.is_capacity() {
                        debug!(alias = %self.alias, reason, error = %err, "prototyping deferred");
                    } else {
                        warn!(alias = %self.alias, reason, error = %err, "prototyping failed");
                    }
                    break;
                }
            };

            self.commit_build(&handle, permit);
            if !handle.transition(Status::Offline, Status::Available, &self.counters) {
                self.expire(&handle, DeathReason::SetupFailed);
                break;
            }
            self.listeners.birth(&self.alias, handle.id());
            if self.is_shutting_down() {
                self.expire(&handle, DeathReason::Shutdown);
                break;
            }
            built += 1;
        }

        if built > 0 {
            debug!(alias = %self.alias, built, live = self.counters.live(), "prototyped connections");
            self.refresh_health();
        }
        built
    }

    fn prototype_reason(&self, definition: &PoolDefinition) -> Option<&'static str> {
        let building = self.building_count();
        let live = self.counters.live();
        if live + building >= definition.maximum_connection_count {
            None
        } else if live + building < definition.minimum_connection_count {
            Some("minimum")
        } else if self.counters.get(Status::Available) + building < definition.prototype_count {
            Some("spare target")
        } else {
            None
        }
    }
}
