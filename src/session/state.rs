//! Session lifecycle state
//!
//! ```text
//! Connecting ──▶ Subscribing ──▶ Relaying
//!      │              │             │
//!      └──────────────┴─────────────┴──▶ Closing ──▶ Closed
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, broker connect in flight
    Connecting,
    /// Broker connected, subscribe in flight
    Subscribing,
    /// Both directions relaying
    Relaying,
    /// Tearing down both sides
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Subscribing)
                | (Subscribing, Relaying)
                | (Connecting | Subscribing | Relaying, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Subscribing => "subscribing",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, transition-checked session state
#[derive(Debug)]
pub struct StateCell(Mutex<SessionState>);

impl StateCell {
    pub fn new() -> Self {
        Self(Mutex::new(SessionState::Connecting))
    }

    pub fn get(&self) -> SessionState {
        *self.0.lock()
    }

    /// Move to `next` if the transition is allowed. Returns whether it happened.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.0.lock();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Enter `Closing`. Only the first caller gets `true`.
    pub fn begin_closing(&self) -> bool {
        self.advance(SessionState::Closing)
    }

    /// Enter `Closed` from any state
    pub fn finish(&self) {
        *self.0.lock() = SessionState::Closed;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session message counters, monotonically increasing
#[derive(Debug, Default)]
pub struct SessionCounters {
    broker_to_socket: AtomicU64,
    socket_to_broker: AtomicU64,
    dropped: AtomicU64,
}

impl SessionCounters {
    pub fn record_broker_to_socket(&self) {
        self.broker_to_socket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_socket_to_broker(&self) {
        self.socket_to_broker.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_to_socket(&self) -> u64 {
        self.broker_to_socket.load(Ordering::Relaxed)
    }

    pub fn socket_to_broker(&self) -> u64 {
        self.socket_to_broker.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
