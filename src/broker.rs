//! Broker (C3): one accepted connection and its per-connection state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mio::Token;

use crate::buffer::PayloadQueue;
use crate::callback::CallbackContainer;
use crate::reactor::TimerId;
use crate::socket::SocketEngine;

static NEXT_BROKER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh 64-bit broker id, unique for the process lifetime and
/// never reused.
pub fn next_broker_id() -> u64 {
    NEXT_BROKER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Broker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    New,
    Accepted,
    WaitHandshake,
    Connected,
    Reading,
    Writing,
    Closing,
    Closed,
}

impl BrokerState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: BrokerState) -> bool {
        use BrokerState::*;
        if next == Closing {
            // "Any state may transition to CLOSING on fatal engine error,
            // timeout, or explicit close" — except once already closed.
            return self != Closed;
        }
        matches!(
            (self, next),
            (New, Accepted)
                | (Accepted, WaitHandshake)
                | (Accepted, Connected)
                | (WaitHandshake, Connected)
                | (Connected, Reading)
                | (Connected, Writing)
                | (Reading, Writing)
                | (Writing, Reading)
                | (Reading, Connected)
                | (Writing, Connected)
                | (Closing, Closed)
        )
    }
}

/// Per-method (read/write/connect) arm/disarm state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSwitch {
    pub enabled: bool,
}

#[derive(Debug, Default)]
pub struct Timeouts {
    pub read_ms: u64,
    pub write_ms: u64,
    pub connect_ms: u64,
    /// Idle ceiling: the broker is closed after this many seconds with no
    /// ingress at all.
    pub wait_secs: u64,
}

/// One accepted connection. Owns its engine, address, timers, and
/// per-method event/callback wiring. A [`crate::node::Node`] indexes
/// brokers by id but never owns more than one at a time.
pub struct Broker {
    pub id: u64,
    pub scheme_id: u64,
    pub token: Token,
    pub state: BrokerState,
    pub peer_addr: Option<SocketAddr>,
    pub engine: Box<dyn SocketEngine>,
    pub payloads: PayloadQueue,
    pub available_bytes: usize,
    pub read_armed: bool,
    pub write_armed: bool,
    pub timeouts: Timeouts,
    pub receive_idle_timer: Option<TimerId>,
    /// Addressable registry for named handlers an upper layer (e.g. the
    /// HTTP/2 session) wants to wire generically; the hot read/write/close
    /// path below uses direct closures instead, since downcasting `Any`
    /// on every readiness tick would be needless overhead for a fixed,
    /// known signature.
    pub callbacks: CallbackContainer,
    pub on_read: Option<Box<dyn FnMut(&[u8], u64, u64) + Send>>,
    pub on_write: Option<Box<dyn FnMut(&[u8], u64, u64) + Send>>,
    pub on_close: Option<Box<dyn FnMut(u64, u64) + Send>>,
    pub on_connect: Option<Box<dyn FnMut(u64, u64) + Send>>,
    closed: bool,
}

impl Broker {
    pub fn new(scheme_id: u64, token: Token, engine: Box<dyn SocketEngine>) -> Self {
        let peer_addr = engine.peer_addr().ok();
        Self {
            id: next_broker_id(),
            scheme_id,
            token,
            state: BrokerState::New,
            peer_addr,
            engine,
            payloads: PayloadQueue::new(),
            available_bytes: 0,
            read_armed: false,
            write_armed: false,
            timeouts: Timeouts::default(),
            receive_idle_timer: None,
            callbacks: CallbackContainer::new(),
            on_read: None,
            on_write: None,
            on_close: None,
            on_connect: None,
            closed: false,
        }
    }

    pub fn transition(&mut self, next: BrokerState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Marks the broker closed. Idempotent: a second call is a silent
    /// no-op, so the socket is closed exactly once no matter how many
    /// callers race to close it.
    pub fn mark_closed(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.state = BrokerState::Closed;
        self.read_armed = false;
        self.write_armed = false;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.timeouts.wait_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeouts.wait_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = next_broker_id();
        let b = next_broker_id();
        assert!(b > a);
    }

    #[test]
    fn state_machine_rejects_illegal_transitions() {
        assert!(BrokerState::New.can_transition_to(BrokerState::Accepted));
        assert!(!BrokerState::New.can_transition_to(BrokerState::Writing));
        assert!(BrokerState::Accepted.can_transition_to(BrokerState::WaitHandshake));
        assert!(BrokerState::WaitHandshake.can_transition_to(BrokerState::Connected));
    }

    #[test]
    fn closing_is_reachable_from_any_non_closed_state() {
        for state in [
            BrokerState::New,
            BrokerState::Accepted,
            BrokerState::WaitHandshake,
            BrokerState::Connected,
            BrokerState::Reading,
            BrokerState::Writing,
        ] {
            assert!(state.can_transition_to(BrokerState::Closing));
        }
        assert!(!BrokerState::Closed.can_transition_to(BrokerState::Closing));
    }

    #[test]
    fn idle_timeout_zero_disables_deadline() {
        let timeouts = Timeouts {
            wait_secs: 0,
            ..Default::default()
        };
        assert_eq!(timeouts.wait_secs, 0);
    }
}
