//! tarn-pool — the connection pool engine.
//!
//! Each [`ConnectionPool`] hands out connections without ever queueing the
//! caller: reuse an idle connection, build one if the maximum allows, or
//! refuse. A small set of shared workers ([`SweepScheduler`]) keeps every
//! registered pool healthy in the background: validating idle connections,
//! retiring old ones, killing stuck checkouts, and topping the pool up.
//! [`PoolManager`] ties pools and workers together under aliases.

pub mod counters;
pub mod handle;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod scheduler;

mod events;

pub use manager::PoolManager;
pub use pool::{ConnectionPool, PoolBuilder, PooledConnection, SweepReport};
pub use scheduler::SweepScheduler;
