//! Driver-facing traits — the pool never speaks a wire protocol itself.
//!
//! A driver supplies a [`ConnectionFactory`] that opens [`RawConnection`]s.
//! Validation of idle connections goes through a [`Validator`]; the default
//! [`SqlValidator`] runs the definition's test statement.

use std::fmt;

use crate::definition::PoolDefinition;

/// One physical connection, exclusively owned by the pool.
pub trait RawConnection: Send + fmt::Debug {
    /// Execute a command, returning the number of affected rows.
    fn execute(&mut self, command: &str) -> Result<u64, String>;
    /// Whether the underlying transport is already closed.
    fn is_closed(&self) -> bool;
    /// Close the underlying transport.
    fn close(&mut self);
}

/// Opens new physical connections. Called from blocking context.
pub trait ConnectionFactory: Send + Sync {
    fn build(&self, definition: &PoolDefinition) -> Result<Box<dyn RawConnection>, String>;
}

/// Health-checks a connection.
pub trait Validator: Send + Sync {
    /// Return `true` if the connection is usable.
    fn validate(&self, definition: &PoolDefinition, connection: &mut dyn RawConnection) -> bool;
}

/// Default validator: a closed connection fails; otherwise the configured
/// test statement, if any, must execute without error.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlValidator;

impl Validator for SqlValidator {
    fn validate(&self, definition: &PoolDefinition, connection: &mut dyn RawConnection) -> bool {
        if connection.is_closed() {
            return false;
        }
        match definition.house_keeping_test_sql.as_deref() {
            Some(sql) if !sql.trim().is_empty() => match connection.execute(sql) {
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!(error = %e, sql, "validation statement failed");
                    false
                }
            },
            _ => true,
        }
    }
}
