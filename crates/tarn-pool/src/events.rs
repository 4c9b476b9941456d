//! Listener registration and panic-isolated dispatch.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tarn_core::{
    ConnectionListener, DeathReason, DefinitionListener, HealthListener, HealthState,
    PoolDefinition,
};
use tracing::error;

#[derive(Default)]
pub(crate) struct Listeners {
    connection: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    health: RwLock<Vec<Arc<dyn HealthListener>>>,
    definition: RwLock<Vec<Arc<dyn DefinitionListener>>>,
}

impl Listeners {
    pub fn add_connection(&self, listener: Arc<dyn ConnectionListener>) {
        self.connection.write().push(listener);
    }

    pub fn add_health(&self, listener: Arc<dyn HealthListener>) {
        self.health.write().push(listener);
    }

    pub fn add_definition(&self, listener: Arc<dyn DefinitionListener>) {
        self.definition.write().push(listener);
    }

    pub fn birth(&self, alias: &str, id: u64) {
        let listeners = self.connection.read().clone();
        dispatch(alias, "on_birth", &listeners, |l| l.on_birth(alias, id));
    }

    pub fn death(&self, alias: &str, id: u64, reason: DeathReason) {
        let listeners = self.connection.read().clone();
        dispatch(alias, "on_death", &listeners, |l| l.on_death(alias, id, reason));
    }

    pub fn execute(&self, alias: &str, command: &str, elapsed: Duration) {
        let listeners = self.connection.read().clone();
        dispatch(alias, "on_execute", &listeners, |l| {
            l.on_execute(alias, command, elapsed)
        });
    }

    pub fn fail(&self, alias: &str, command: &str, message: &str) {
        let listeners = self.connection.read().clone();
        dispatch(alias, "on_fail", &listeners, |l| l.on_fail(alias, command, message));
    }

    pub fn health_changed(&self, alias: &str, state: HealthState) {
        let listeners = self.health.read().clone();
        dispatch(alias, "on_health_changed", &listeners, |l| {
            l.on_health_changed(alias, state)
        });
    }

    pub fn definition_changed(&self, alias: &str, definition: &PoolDefinition) {
        let listeners = self.definition.read().clone();
        dispatch(alias, "on_definition_changed", &listeners, |l| {
            l.on_definition_changed(alias, definition)
        });
    }
}

/// Invoke `f` on every listener; a panicking listener is logged and skipped.
fn dispatch<L: ?Sized>(alias: &str, callback: &str, listeners: &[Arc<L>], f: impl Fn(&L)) {
    for listener in listeners {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(&**listener))) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%alias, callback, error = %message, "listener panicked");
        }
    }
}
