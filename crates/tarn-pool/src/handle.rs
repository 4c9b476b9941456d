//! Pooled connection handle and its guarded status register.
//!
//! The status of a handle changes only through [`Handle::transition`] (and
//! the two specialised forms built on the same primitive: claiming a
//! checkout and releasing one). Every change happens under the handle's
//! state lock and updates the owning pool's [`StatusCounters`] before the
//! lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tarn_core::{HandleSnapshot, Mark, RawConnection, Status};

use crate::counters::StatusCounters;

/// How long a close waits for an in-flight command before deferring.
const CLOSE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct HandleState {
    status: Status,
    mark: Mark,
    /// Incremented on every transition into `Active`.
    checkout: u64,
    last_active_start: Option<Instant>,
    last_active_start_epoch: Option<u64>,
    last_active_stop_epoch: Option<u64>,
    requester: Option<String>,
    last_command: Option<String>,
}

/// Outcome of returning a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Back to `Available`.
    Returned,
    /// Marked for expiry: moved to `Null`, the caller must destroy it.
    Expired,
    /// The checkout was already released, killed, or superseded.
    NotCheckedOut,
}

/// One physical connection and its bookkeeping.
#[derive(Debug)]
pub struct Handle {
    id: u64,
    created_at: Instant,
    created_at_epoch: u64,
    state: Mutex<HandleState>,
    connection: Mutex<Option<Box<dyn RawConnection>>>,
    close_pending: AtomicBool,
}

impl Handle {
    /// Wrap a freshly built connection. New handles start `Offline`.
    pub(crate) fn new(id: u64, connection: Box<dyn RawConnection>) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            created_at_epoch: epoch_millis(),
            state: Mutex::new(HandleState {
                status: Status::Offline,
                mark: Mark::None,
                checkout: 0,
                last_active_start: None,
                last_active_start_epoch: None,
                last_active_stop_epoch: None,
                requester: None,
                last_command: None,
            }),
            connection: Mutex::new(Some(connection)),
            close_pending: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn mark(&self) -> Mark {
        self.state.lock().mark
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time spent in the current checkout, `None` unless `Active`.
    pub fn active_for(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock();
        match (state.status, state.last_active_start) {
            (Status::Active, Some(start)) => Some(now.saturating_duration_since(start)),
            _ => None,
        }
    }

    pub fn requester(&self) -> Option<String> {
        self.state.lock().requester.clone()
    }

    pub fn last_command(&self) -> Option<String> {
        self.state.lock().last_command.clone()
    }

    /// Set status to `next` iff it is currently `expected`.
    ///
    /// Returns `false` when the precondition does not hold or the edge is not
    /// part of the state machine; the caller should abandon this handle for
    /// the current operation.
    pub fn transition(&self, expected: Status, next: Status, counters: &StatusCounters) -> bool {
        let mut state = self.state.lock();
        apply(&mut state, expected, next, counters)
    }

    /// Move from `expected` into `Active`, returning the new checkout number.
    pub(crate) fn claim(&self, expected: Status, counters: &StatusCounters) -> Option<u64> {
        let mut state = self.state.lock();
        apply(&mut state, expected, Status::Active, counters).then_some(state.checkout)
    }

    /// Move any live status to `Null`. Returns `false` if already `Null`.
    pub fn force_null(&self, counters: &StatusCounters) -> bool {
        let mut state = self.state.lock();
        let current = state.status;
        apply(&mut state, current, Status::Null, counters)
    }

    /// Flag the handle for destruction on its next release.
    pub fn mark_for_expiry(&self) {
        self.state.lock().mark = Mark::MarkedForExpiry;
    }

    /// Return checkout `checkout`: `Active -> Null` when marked, otherwise
    /// `Active -> Available`.
    pub(crate) fn release(&self, checkout: u64, counters: &StatusCounters) -> ReleaseOutcome {
        let mut state = self.state.lock();
        if state.status != Status::Active || state.checkout != checkout {
            return ReleaseOutcome::NotCheckedOut;
        }
        if state.mark == Mark::MarkedForExpiry {
            apply(&mut state, Status::Active, Status::Null, counters);
            ReleaseOutcome::Expired
        } else {
            apply(&mut state, Status::Active, Status::Available, counters);
            ReleaseOutcome::Returned
        }
    }

    /// Whether checkout `checkout` is still the live one.
    pub(crate) fn is_checked_out_by(&self, checkout: u64) -> bool {
        let state = self.state.lock();
        state.status == Status::Active && state.checkout == checkout
    }

    pub(crate) fn set_requester(&self, requester: &str) {
        self.state.lock().requester = Some(requester.to_string());
    }

    pub(crate) fn record_command(&self, command: &str) {
        self.state.lock().last_command = Some(command.to_string());
    }

    /// Run `f` against the physical connection, `None` once it is closed.
    pub(crate) fn with_connection<R>(&self, f: impl FnOnce(&mut dyn RawConnection) -> R) -> Option<R> {
        let mut guard = self.connection.lock();
        let result = guard.as_mut().map(|conn| f(conn.as_mut()));
        if self.close_pending.load(Ordering::SeqCst) {
            if let Some(mut conn) = guard.take() {
                conn.close();
            }
        }
        result
    }

    /// Close the physical connection. If a command holds it, the close is
    /// deferred until that command returns.
    pub(crate) fn close_connection(&self) {
        match self.connection.try_lock_for(CLOSE_WAIT) {
            Some(mut guard) => {
                if let Some(mut conn) = guard.take() {
                    conn.close();
                }
            }
            None => {
                self.close_pending.store(true, Ordering::SeqCst);
                tracing::debug!(id = self.id, "connection busy, close deferred");
            }
        }
    }

    pub fn snapshot(&self, now: Instant) -> HandleSnapshot {
        let state = self.state.lock();
        HandleSnapshot {
            id: self.id,
            status: state.status,
            mark: state.mark,
            age_ms: self.age(now).as_millis() as u64,
            created_at: self.created_at_epoch,
            last_active_start: state.last_active_start_epoch,
            last_active_stop: state.last_active_stop_epoch,
            requester: state.requester.clone(),
            last_command: state.last_command.clone(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(mut conn) = self.connection.get_mut().take() {
            conn.close();
        }
    }
}

fn apply(state: &mut HandleState, expected: Status, next: Status, counters: &StatusCounters) -> bool {
    if state.status != expected || !expected.can_transition_to(next) {
        return false;
    }
    state.status = next;
    counters.moved(expected, next);

    if next == Status::Active {
        state.checkout += 1;
        state.last_active_start = Some(Instant::now());
        state.last_active_start_epoch = Some(epoch_millis());
        state.last_active_stop_epoch = None;
    } else if expected == Status::Active {
        state.last_active_stop_epoch = Some(epoch_millis());
    }
    true
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug)]
    struct CountingConnection {
        closes: Arc<AtomicU64>,
    }

    impl RawConnection for CountingConnection {
        fn execute(&mut self, _command: &str) -> Result<u64, String> {
            Ok(1)
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make_handle() -> (Handle, StatusCounters, Arc<AtomicU64>) {
        let closes = Arc::new(AtomicU64::new(0));
        let handle = Handle::new(
            1,
            Box::new(CountingConnection {
                closes: closes.clone(),
            }),
        );
        let counters = StatusCounters::new();
        counters.added(Status::Offline);
        (handle, counters, closes)
    }

    #[test]
    fn new_handle_is_offline() {
        let (handle, counters, _) = make_handle();
        assert_eq!(handle.status(), Status::Offline);
        assert_eq!(counters.get(Status::Offline), 1);
        assert_eq!(handle.mark(), Mark::None);
    }

    #[test]
    fn transition_requires_expected_status() {
        let (handle, counters, _) = make_handle();
        assert!(!handle.transition(Status::Available, Status::Active, &counters));
        assert!(handle.transition(Status::Offline, Status::Available, &counters));
        assert_eq!(counters.get(Status::Available), 1);
        assert_eq!(counters.get(Status::Offline), 0);
    }

    #[test]
    fn transition_rejects_edges_outside_the_table() {
        let (handle, counters, _) = make_handle();
        assert!(handle.claim(Status::Offline, &counters).is_some());
        // Active -> Offline is not an edge.
        assert!(!handle.transition(Status::Active, Status::Offline, &counters));
        assert_eq!(handle.status(), Status::Active);
    }

    #[test]
    fn claim_increments_checkout() {
        let (handle, counters, _) = make_handle();
        let first = handle.claim(Status::Offline, &counters).unwrap();
        assert_eq!(handle.release(first, &counters), ReleaseOutcome::Returned);
        let second = handle.claim(Status::Available, &counters).unwrap();
        assert!(second > first);
        assert!(!handle.is_checked_out_by(first));
        assert!(handle.is_checked_out_by(second));
    }

    #[test]
    fn release_twice_is_a_no_op() {
        let (handle, counters, _) = make_handle();
        let checkout = handle.claim(Status::Offline, &counters).unwrap();
        assert_eq!(handle.release(checkout, &counters), ReleaseOutcome::Returned);
        assert_eq!(
            handle.release(checkout, &counters),
            ReleaseOutcome::NotCheckedOut
        );
        assert_eq!(counters.get(Status::Available), 1);
        assert_eq!(counters.get(Status::Active), 0);
    }

    #[test]
    fn stale_release_does_not_touch_new_checkout() {
        let (handle, counters, _) = make_handle();
        let first = handle.claim(Status::Offline, &counters).unwrap();
        handle.release(first, &counters);
        let second = handle.claim(Status::Available, &counters).unwrap();

        assert_eq!(handle.release(first, &counters), ReleaseOutcome::NotCheckedOut);
        assert!(handle.is_checked_out_by(second));
    }

    #[test]
    fn marked_release_expires() {
        let (handle, counters, _) = make_handle();
        let checkout = handle.claim(Status::Offline, &counters).unwrap();
        handle.mark_for_expiry();
        assert_eq!(handle.release(checkout, &counters), ReleaseOutcome::Expired);
        assert_eq!(handle.status(), Status::Null);
        assert_eq!(counters.live(), 0);
    }

    #[test]
    fn force_null_only_once() {
        let (handle, counters, _) = make_handle();
        assert!(handle.force_null(&counters));
        assert!(!handle.force_null(&counters));
        assert_eq!(counters.live(), 0);
    }

    #[test]
    fn active_for_tracks_checkout() {
        let (handle, counters, _) = make_handle();
        assert!(handle.active_for(Instant::now()).is_none());
        handle.claim(Status::Offline, &counters).unwrap();
        assert!(handle.active_for(Instant::now()).is_some());
        let snap = handle.snapshot(Instant::now());
        assert!(snap.last_active_start.is_some());
        assert!(snap.last_active_stop.is_none());
    }

    #[test]
    fn close_connection_closes_once() {
        let (handle, _, closes) = make_handle();
        handle.close_connection();
        handle.close_connection();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(handle.with_connection(|c| c.execute("SELECT 1")).is_none());
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_handle_closes_connection() {
        let (handle, _, closes) = make_handle();
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
