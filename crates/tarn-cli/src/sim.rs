//! In-process simulated driver for load runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tarn_core::{ConnectionFactory, PoolDefinition, RawConnection};

/// Knobs shared by every simulated connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimProfile {
    /// Time a connect takes.
    pub connect: Duration,
    /// Time each command takes.
    pub hold: Duration,
    /// Every Nth connect fails (0 = never).
    pub fail_every: u64,
    /// Every Nth command on a connection fails with a reset (0 = never).
    pub fault_every: u64,
}

#[derive(Debug)]
pub struct SimConnection {
    profile: SimProfile,
    executed: u64,
    closed: bool,
}

impl RawConnection for SimConnection {
    fn execute(&mut self, _command: &str) -> Result<u64, String> {
        if self.closed {
            return Err("connection is closed".to_string());
        }
        if !self.profile.hold.is_zero() {
            std::thread::sleep(self.profile.hold);
        }
        self.executed += 1;
        if self.profile.fault_every > 0 && self.executed % self.profile.fault_every == 0 {
            return Err("simulated fault: connection reset by peer".to_string());
        }
        Ok(1)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug)]
pub struct SimFactory {
    profile: SimProfile,
    attempts: AtomicU64,
}

impl SimFactory {
    pub fn new(profile: SimProfile) -> Self {
        Self {
            profile,
            attempts: AtomicU64::new(0),
        }
    }
}

impl ConnectionFactory for SimFactory {
    fn build(&self, definition: &PoolDefinition) -> Result<Box<dyn RawConnection>, String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.profile.connect.is_zero() {
            std::thread::sleep(self.profile.connect);
        }
        if self.profile.fail_every > 0 && attempt % self.profile.fail_every == 0 {
            return Err(format!("simulated connect failure to {}", definition.url));
        }
        Ok(Box::new(SimConnection {
            profile: self.profile,
            executed: 0,
            closed: false,
        }))
    }
}
