//! Connection lifecycle state machine.
//!
//! The state machine is the single source of truth for "is a run active". Transitions that
//! leave the graph below fail with [`WorkflowError::InvalidTransition`] instead of being
//! ignored, so callers cannot race the state.

use crate::error::{WorkflowError, WorkflowResult};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Workflow connection state.
///
/// # State Machine
///
/// ```text
///  OFF ──connect()──> ON ──start()──> RUNNING ──request──> OPEN
///   ▲                  │                 ▲                   │
///   │                  │                 └─────response──────┘
///   └──── end() / abort() from any state ────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No engine, no channel
    Off,
    /// Channel created, engine not started
    On,
    /// Engine running, no request being handled
    Running,
    /// One engine request is being handled
    Open,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Off => write!(f, "OFF"),
            ConnectionState::On => write!(f, "ON"),
            ConnectionState::Running => write!(f, "RUNNING"),
            ConnectionState::Open => write!(f, "OPEN"),
        }
    }
}

impl ConnectionState {
    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (_, Off) | (Off, On) | (On, Running) | (Running, Open) | (Open, Running)
        )
    }

    /// Whether a run is active (engine started, not ended).
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Running | ConnectionState::Open)
    }
}

/// Owner of the connection state.
///
/// Only the control task holds the machine; other tasks observe it through
/// [`StateMachine::subscribe`].
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    publisher: watch::Sender<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Machine in the OFF state.
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(ConnectionState::Off);
        Self {
            state: ConnectionState::Off,
            publisher,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Receiver that sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.publisher.subscribe()
    }

    /// OFF → ON.
    pub fn connect(&mut self) -> WorkflowResult<()> {
        self.transition(ConnectionState::On)
    }

    /// ON → RUNNING.
    pub fn start(&mut self) -> WorkflowResult<()> {
        self.transition(ConnectionState::Running)
    }

    /// RUNNING → OPEN. Fails while another request is open.
    pub fn open(&mut self) -> WorkflowResult<()> {
        self.transition(ConnectionState::Open)
    }

    /// OPEN → RUNNING.
    pub fn close(&mut self) -> WorkflowResult<()> {
        self.transition(ConnectionState::Running)
    }

    /// Any → OFF. Always succeeds.
    pub fn end(&mut self) {
        self.set(ConnectionState::Off);
    }

    fn transition(&mut self, to: ConnectionState) -> WorkflowResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(WorkflowError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.set(to);
        Ok(())
    }

    fn set(&mut self, to: ConnectionState) {
        if self.state != to {
            debug!(from = %self.state, to = %to, "Connection state change");
        }
        self.state = to;
        self.publisher.send_replace(to);
    }
}
