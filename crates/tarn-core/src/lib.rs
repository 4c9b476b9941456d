//! tarn-core — shared types for the Tarn connection pool.
//!
//! - **definition**: `PoolDefinition` and the `tarn.toml` config model
//! - **driver**: traits a database driver implements (`ConnectionFactory`, `RawConnection`, `Validator`)
//! - **listener**: lifecycle, health, and definition listeners
//! - **types**: status register values, health states, death reasons, snapshots
//! - **error**: the `PoolError` taxonomy

pub mod definition;
pub mod driver;
pub mod error;
pub mod listener;
pub mod types;

pub use definition::{PoolDefinition, PoolEntry, PoolsConfig};
pub use driver::{ConnectionFactory, RawConnection, SqlValidator, Validator};
pub use error::{PoolError, PoolResult};
pub use listener::{ConnectionListener, DefinitionListener, HealthListener};
pub use types::*;
