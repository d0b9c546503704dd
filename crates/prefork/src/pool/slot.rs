//! Per-slot worker record.
//!
//! A slot is a stable pool position; the worker is whatever child process
//! currently occupies it. The record is owned exclusively by the pool task,
//! so no field here needs interior mutability.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::supervisor::WorkerProc;

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Child process is being started.
    Spawning,
    /// Child started, `register` not yet received.
    AwaitingRegister,
    /// Registered, application bootstrap running.
    Bootstrapping,
    /// Eligible for proxied connections.
    Ready,
    /// Serving at least one proxied connection (exclusive mode).
    Busy,
    /// Served its quota; finishing in-flight work before recycle.
    Draining,
    /// No child process; awaiting respawn.
    Dead,
    /// Held closed after a bootstrap failure in debug mode. Never respawned
    /// until the file watcher clears it.
    KeepClosed,
}

/// Pool-side handle on a worker's control connection.
///
/// The connection itself lives in the control-plane task; the pool closes it
/// by cancelling the token, and learns of any close (either side) through a
/// single `ControlClosed` event.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    closer: CancellationToken,
}

impl ControlChannel {
    pub fn new(closer: CancellationToken) -> Self {
        Self { closer }
    }

    /// Ask the control-plane task to drop the connection.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

/// One pool slot.
#[derive(Debug)]
pub struct WorkerSlot {
    pub slot_id: usize,
    /// Unix socket path proxied connections are dialed to.
    pub data_addr: PathBuf,
    /// Bumped on every spawn; events carrying an older generation are stale.
    pub generation: u64,
    /// OS pid, set when `register` is received.
    pub pid: Option<u32>,
    /// Exclusive owner of the child process, if one is running.
    pub proc: Option<WorkerProc>,
    /// Control connection, set on `register`, cleared on close.
    pub control: Option<ControlChannel>,
    pub state: SlotState,
    /// Proxied connections currently assigned to this slot.
    pub in_flight: usize,
    /// Completed requests since this child started.
    pub served: u64,
    /// Recycle as soon as `in_flight` returns to zero.
    pub close_when_free: bool,
    /// Consecutive failed bootstraps.
    pub bootstrap_failures: u32,
    /// Whether this slot has been `Ready` at least once since the last
    /// initial fill began; drives the "ready" banner.
    pub reached_ready_once: bool,
}

impl WorkerSlot {
    pub fn new(slot_id: usize, data_addr: PathBuf) -> Self {
        Self {
            slot_id,
            data_addr,
            generation: 0,
            pid: None,
            proc: None,
            control: None,
            state: SlotState::Dead,
            in_flight: 0,
            served: 0,
            close_when_free: false,
            bootstrap_failures: 0,
            reached_ready_once: false,
        }
    }

    /// Whether the scheduler may hand this slot the next connection.
    pub fn is_eligible(&self, concurrent_requests: bool) -> bool {
        self.state == SlotState::Ready && (self.in_flight == 0 || concurrent_requests)
    }

    /// Whether a child process is (as far as the pool knows) alive.
    pub fn has_live_child(&self) -> bool {
        self.proc.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> WorkerSlot {
        WorkerSlot::new(0, PathBuf::from("/tmp/prefork-test/slot-0.sock"))
    }

    #[test]
    fn new_slot_starts_dead_and_idle() {
        let s = slot();
        assert_eq!(s.state, SlotState::Dead);
        assert_eq!(s.in_flight, 0);
        assert_eq!(s.served, 0);
        assert!(!s.is_eligible(false));
    }

    #[test]
    fn ready_slot_is_eligible_when_idle() {
        let mut s = slot();
        s.state = SlotState::Ready;
        assert!(s.is_eligible(false));
        assert!(s.is_eligible(true));
    }

    #[test]
    fn loaded_slot_requires_concurrent_mode() {
        let mut s = slot();
        s.state = SlotState::Ready;
        s.in_flight = 1;
        assert!(!s.is_eligible(false));
        assert!(s.is_eligible(true));
    }

    #[test]
    fn draining_slot_is_never_eligible() {
        let mut s = slot();
        s.state = SlotState::Draining;
        assert!(!s.is_eligible(true));
    }

    #[test]
    fn control_channel_close_is_observable() {
        let token = CancellationToken::new();
        let channel = ControlChannel::new(token.clone());

        assert!(!channel.is_closed());
        channel.close();
        assert!(token.is_cancelled());
        assert!(channel.is_closed());
    }
}
