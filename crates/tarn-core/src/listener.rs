//! Listener traits for pool events.
//!
//! Listeners are fire-and-forget. The pool catches panics raised inside a
//! callback and logs them; a failing listener never aborts a pool operation.

use std::time::Duration;

use crate::definition::PoolDefinition;
use crate::types::{DeathReason, HealthState};

/// Connection lifecycle notifications.
pub trait ConnectionListener: Send + Sync {
    /// A connection was built and brought online.
    fn on_birth(&self, _alias: &str, _id: u64) {}
    /// A connection was destroyed.
    fn on_death(&self, _alias: &str, _id: u64, _reason: DeathReason) {}
    /// A command completed successfully.
    fn on_execute(&self, _alias: &str, _command: &str, _elapsed: Duration) {}
    /// A command failed.
    fn on_fail(&self, _alias: &str, _command: &str, _error: &str) {}
}

/// Aggregate health notifications.
pub trait HealthListener: Send + Sync {
    fn on_health_changed(&self, alias: &str, state: HealthState);
}

/// Definition hot-swap notifications.
pub trait DefinitionListener: Send + Sync {
    fn on_definition_changed(&self, alias: &str, definition: &PoolDefinition);
}
