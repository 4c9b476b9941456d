//! The borrowed connection handed to callers.

use std::sync::Arc;
use std::time::Instant;

use tarn_core::{DeathReason, PoolError, PoolResult};
use tracing::{debug, warn};

use super::ConnectionPool;
use crate::handle::Handle;

/// A connection checked out of a [`ConnectionPool`].
///
/// Forwards commands to the physical connection and returns it to the pool
/// on [`close`](Self::close) or drop, whichever comes first. Once the pool
/// has taken the connection back (killed, expired, shut down), every call
/// returns [`PoolError::Closed`].
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    handle: Arc<Handle>,
    checkout: u64,
    released: bool,
}

impl PooledConnection {
    pub(super) fn new(pool: Arc<ConnectionPool>, handle: Arc<Handle>, checkout: u64) -> Self {
        Self {
            pool,
            handle,
            checkout,
            released: false,
        }
    }

    /// Pool-assigned connection ID.
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Checkout sequence number, unique per connection.
    pub fn checkout(&self) -> u64 {
        self.checkout
    }

    pub fn alias(&self) -> &str {
        self.pool.alias()
    }

    /// Whether this borrow can still reach the connection.
    pub fn is_closed(&self) -> bool {
        self.released || !self.handle.is_checked_out_by(self.checkout)
    }

    /// Destroy the connection on release instead of returning it.
    pub fn mark_for_expiry(&self) {
        self.handle.mark_for_expiry();
    }

    /// Run a command on the physical connection.
    ///
    /// An error message containing one of the definition's fatal fragments
    /// destroys the connection before returning [`PoolError::Fatal`].
    pub fn execute(&self, command: &str) -> PoolResult<u64> {
        if self.is_closed() {
            return Err(self.closed());
        }

        let definition = self.pool.definition();
        let alias = self.pool.alias();
        if definition.trace {
            self.handle.record_command(command);
        }

        let started = Instant::now();
        let outcome = self.handle.with_connection(|conn| conn.execute(command));
        let elapsed = started.elapsed();

        match outcome {
            None => Err(self.closed()),
            Some(Ok(rows)) => {
                if definition.trace {
                    debug!(
                        alias = %alias,
                        id = self.id(),
                        command,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "executed"
                    );
                }
                self.pool.listeners.execute(alias, command, elapsed);
                Ok(rows)
            }
            Some(Err(message)) => {
                self.pool.listeners.fail(alias, command, &message);
                if let Some(fragment) = definition.fatal_match(&message) {
                    warn!(
                        alias = %alias,
                        id = self.id(),
                        fragment,
                        error = %message,
                        "fatal error, destroying connection"
                    );
                    self.pool.expire(&self.handle, DeathReason::FatalError);
                    self.pool.wake_prototyper();
                    return Err(PoolError::Fatal {
                        alias: alias.to_string(),
                        id: self.id(),
                        message,
                    });
                }
                Err(PoolError::Execute {
                    alias: alias.to_string(),
                    id: self.id(),
                    message,
                })
            }
        }
    }

    /// Return the connection to the pool. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool.release(&self.handle, self.checkout);
    }

    fn closed(&self) -> PoolError {
        PoolError::Closed {
            alias: self.pool.alias().to_string(),
            id: self.id(),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("alias", &self.pool.alias())
            .field("id", &self.id())
            .field("checkout", &self.checkout)
            .field("released", &self.released)
            .finish()
    }
}
