//! Shared pool types: connection status, health, death reasons, snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status register of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Terminal: destroyed, or never brought to life.
    Null,
    /// Idle and reusable.
    Available,
    /// Checked out by a caller.
    Active,
    /// Being built or validated; excluded from allocation.
    Offline,
}

/// Every guarded edge of the connection state machine.
///
/// `* -> Null` (force expiry) is allowed from every live status and is
/// listed explicitly so this table stays the only place edges are defined.
pub const TRANSITIONS: &[(Status, Status)] = &[
    (Status::Offline, Status::Active),
    (Status::Offline, Status::Available),
    (Status::Offline, Status::Null),
    (Status::Available, Status::Active),
    (Status::Available, Status::Offline),
    (Status::Available, Status::Null),
    (Status::Active, Status::Available),
    (Status::Active, Status::Null),
];

impl Status {
    /// Statuses that count towards the live total.
    pub const COUNTED: [Status; 3] = [Status::Available, Status::Active, Status::Offline];

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: Status) -> bool {
        TRANSITIONS.contains(&(self, next))
    }

    /// Slot in a per-status counter array, `None` for `Null`.
    pub fn counter_index(self) -> Option<usize> {
        match self {
            Status::Null => None,
            Status::Available => Some(0),
            Status::Active => Some(1),
            Status::Offline => Some(2),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Null => write!(f, "null"),
            Status::Available => write!(f, "available"),
            Status::Active => write!(f, "active"),
            Status::Offline => write!(f, "offline"),
        }
    }
}

/// Deferred-destruction flag, orthogonal to [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mark {
    #[default]
    None,
    /// Destroy instead of returning to the pool on the next release.
    MarkedForExpiry,
}

/// Aggregate health of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Capacity available and no recent refusal.
    #[default]
    Quiet,
    /// Serving requests without refusing any.
    Busy,
    /// A request was refused within the overload window.
    Overloaded,
    /// Nothing available and no recently started activity.
    Down,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Quiet => write!(f, "quiet"),
            HealthState::Busy => write!(f, "busy"),
            HealthState::Overloaded => write!(f, "overloaded"),
            HealthState::Down => write!(f, "down"),
        }
    }
}

/// Why a connection was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    /// Housekeeping validation failed.
    ValidationFailed,
    /// Older than the maximum connection lifetime.
    Expired,
    /// Checked out longer than the maximum active time.
    ActiveTooLong,
    /// Released while marked for expiry.
    MarkedForExpiry,
    /// A configured fatal error fragment was observed.
    FatalError,
    /// Killed by an operator.
    ManualKill,
    /// Pool shutdown.
    Shutdown,
    /// Built but could not be brought online.
    SetupFailed,
    /// test-before-use or test-after-use validation failed.
    UseTestFailed,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeathReason::ValidationFailed => "failed validation",
            DeathReason::Expired => "expired",
            DeathReason::ActiveTooLong => "active too long",
            DeathReason::MarkedForExpiry => "marked for expiry",
            DeathReason::FatalError => "fatal error",
            DeathReason::ManualKill => "manual kill",
            DeathReason::Shutdown => "shutdown",
            DeathReason::SetupFailed => "setup failed",
            DeathReason::UseTestFailed => "use test failed",
        };
        f.write_str(s)
    }
}

/// Diagnostic view of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleSnapshot {
    pub id: u64,
    pub status: Status,
    pub mark: Mark,
    pub age_ms: u64,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
    /// Start of the current or last checkout, epoch milliseconds.
    pub last_active_start: Option<u64>,
    /// End of the last checkout; `None` while checked out.
    pub last_active_stop: Option<u64>,
    pub requester: Option<String>,
    pub last_command: Option<String>,
}

/// Diagnostic view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub alias: String,
    pub health: HealthState,
    pub live: usize,
    pub available: usize,
    pub active: usize,
    pub offline: usize,
    /// Connections currently under construction.
    pub building: usize,
    pub served: u64,
    pub refused: u64,
    pub maximum_connection_count: usize,
    pub minimum_connection_count: usize,
    /// Per-connection detail, empty unless requested.
    pub connections: Vec<HandleSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_edges() {
        assert!(Status::Offline.can_transition_to(Status::Active));
        assert!(Status::Available.can_transition_to(Status::Offline));
        assert!(Status::Active.can_transition_to(Status::Available));
        assert!(!Status::Active.can_transition_to(Status::Offline));
        assert!(!Status::Null.can_transition_to(Status::Available));
        assert!(!Status::Available.can_transition_to(Status::Available));
    }

    #[test]
    fn every_live_status_can_be_forced_to_null() {
        for status in Status::COUNTED {
            assert!(status.can_transition_to(Status::Null), "{status} -> null");
        }
    }

    #[test]
    fn counter_indices_are_distinct() {
        let mut seen: Vec<usize> = Status::COUNTED
            .iter()
            .filter_map(|s| s.counter_index())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(Status::Null.counter_index(), None);
    }

    #[test]
    fn health_serializes_lowercase() {
        let json = serde_json::to_string(&HealthState::Overloaded).unwrap();
        assert_eq!(json, "\"overloaded\"");
    }

    #[test]
    fn death_reason_display() {
        assert_eq!(DeathReason::ValidationFailed.to_string(), "failed validation");
        assert_eq!(DeathReason::ActiveTooLong.to_string(), "active too long");
    }
}
