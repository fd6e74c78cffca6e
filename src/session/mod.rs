//! One bridged call: state, shared stats, and the tasks that move audio.

pub mod controller;
pub mod drain;
pub mod heartbeat;
pub mod inbound;
pub mod outbound;
pub mod stats;
pub mod teardown;

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BridgeError;

pub use controller::{SessionReport, run_session};
pub use drain::DrainPolicy;
pub use stats::{Counter, SessionStats, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    ConnectingEngine,
    WaitingHandshake,
    Streaming,
    StopReceived,
    Draining,
    Closing,
    Closed,
    ConnectFailed,
    HandshakeTimeout,
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, ConnectingEngine)
                | (Init, Failed)
                | (ConnectingEngine, WaitingHandshake)
                | (ConnectingEngine, ConnectFailed)
                | (ConnectingEngine, Failed)
                | (WaitingHandshake, Streaming)
                | (WaitingHandshake, HandshakeTimeout)
                | (WaitingHandshake, Failed)
                | (Streaming, StopReceived)
                | (Streaming, Closing)
                | (Streaming, Failed)
                | (StopReceived, Draining)
                | (StopReceived, Closing)
                | (StopReceived, Failed)
                | (Draining, Closing)
                | (Draining, Failed)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Closed
                | SessionState::ConnectFailed
                | SessionState::HandshakeTimeout
                | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the session tasks report back to the controller.
#[derive(Debug)]
pub enum SessionEvent {
    Started { stream_sid: Option<String> },
    StopReceived,
    ProviderClosed,
    EngineClosed,
    /// The outbound pipeline delivered everything it will ever deliver.
    OutboundFinished,
    Failed(BridgeError),
}

pub type EventTx = mpsc::Sender<SessionEvent>;
pub type EventRx = mpsc::Receiver<SessionEvent>;

pub fn event_channel() -> (EventTx, EventRx) {
    mpsc::channel(64)
}

/// Controller-owned session record. Tasks report back through
/// [`SessionStats`] and [`SessionEvent`]; the only thing they read from here
/// is the drain flag, via [`Session::drain_watch`].
pub struct Session {
    pub id: String,
    state: Mutex<SessionState>,
    stop_received_at: Mutex<Option<Instant>>,
    drain_mode: watch::Sender<bool>,
    connection_active: AtomicBool,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().simple().to_string())
    }

    pub fn with_id(id: String) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState::Init),
            stop_received_at: Mutex::new(None),
            drain_mode: watch::Sender::new(false),
            connection_active: AtomicBool::new(true),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().map(|s| *s).unwrap_or(SessionState::Failed)
    }

    /// Move to `next` if the transition is legal. Illegal moves are logged and ignored.
    pub fn transition(&self, next: SessionState) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let current = *state;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "illegal state transition ignored");
            return false;
        }
        *state = next;
        info!(from = %current, to = %next, "state");
        true
    }

    pub fn mark_stop_received(&self) {
        if let Ok(mut at) = self.stop_received_at.lock() {
            at.get_or_insert_with(Instant::now);
        }
    }

    pub fn stop_received_at(&self) -> Option<Instant> {
        self.stop_received_at.lock().ok().and_then(|at| *at)
    }

    /// Switch the outbound side into drain mode. Subscribers are woken.
    pub fn enter_drain(&self) {
        self.drain_mode.send_replace(true);
    }

    pub fn is_draining(&self) -> bool {
        *self.drain_mode.borrow()
    }

    pub fn drain_watch(&self) -> watch::Receiver<bool> {
        self.drain_mode.subscribe()
    }

    /// Whether the provider socket is still connected.
    pub fn connection_active(&self) -> bool {
        self.connection_active.load(Ordering::Acquire)
    }

    pub fn mark_connection_inactive(&self) {
        self.connection_active.store(false, Ordering::Release);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
