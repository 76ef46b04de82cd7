// Initialization state management
//
// This module provides the StateManager which holds the host's initialization
// state behind an RwLock, validates transitions and emits change events.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

/// Initialization state of a host.
///
/// `Ready` and `Failed` are terminal; a failed host is replaced, not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitState {
    NotStarted,
    Provisioning,
    WorkerStarting,
    Ready,
    Failed,
}

impl InitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InitState::Ready | InitState::Failed)
    }

    /// Whether `self -> next` is a legal edge
    pub fn can_transition_to(&self, next: InitState) -> bool {
        use InitState::*;
        match (self, next) {
            (NotStarted, Provisioning) => true,
            // Marker token already matches: provisioning is skipped
            (NotStarted, WorkerStarting) => true,
            (Provisioning, WorkerStarting) => true,
            (WorkerStarting, Ready) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitState::NotStarted => "not started",
            InitState::Provisioning => "provisioning",
            InitState::WorkerStarting => "starting worker",
            InitState::Ready => "ready",
            InitState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Change events emitted on every transition
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    Transitioned { from: InitState, to: InitState },

    /// Entered `Failed`; carries the failure description
    Failed { from: InitState, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal initialization transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: InitState,
    pub to: InitState,
}

#[derive(Debug)]
struct Lifecycle {
    state: InitState,
    failure: Option<String>,
}

/// Thread-safe holder of the initialization state with event emission
///
/// All mutation goes through [`transition`](Self::transition) or
/// [`fail`](Self::fail), which reject illegal edges. Subscribers receive a
/// [`StateChange`] for every accepted transition.
#[derive(Clone)]
pub struct StateManager {
    lifecycle: Arc<RwLock<Lifecycle>>,
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a manager in `NotStarted` with a 32-event broadcast buffer
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(32);
        Self {
            lifecycle: Arc::new(RwLock::new(Lifecycle {
                state: InitState::NotStarted,
                failure: None,
            })),
            state_tx,
        }
    }

    pub fn current(&self) -> InitState {
        self.lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Description of the failure that moved the host to `Failed`
    pub fn failure_reason(&self) -> Option<String> {
        self.lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .failure
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    /// Move to `next` if the edge is legal
    pub fn transition(&self, next: InitState) -> Result<StateChange, InvalidTransition> {
        let change = {
            let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
            let from = lifecycle.state;
            if next == InitState::Failed || !from.can_transition_to(next) {
                return Err(InvalidTransition { from, to: next });
            }
            lifecycle.state = next;
            StateChange::Transitioned { from, to: next }
        };

        tracing::debug!("Initialization state: {:?}", change);
        // Ignore send errors - it's OK if no one is listening
        let _ = self.state_tx.send(change.clone());
        Ok(change)
    }

    /// Enter `Failed` from any non-terminal state
    pub fn fail(&self, reason: impl Into<String>) -> Result<StateChange, InvalidTransition> {
        let change = {
            let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
            let from = lifecycle.state;
            if !from.can_transition_to(InitState::Failed) {
                return Err(InvalidTransition {
                    from,
                    to: InitState::Failed,
                });
            }
            let reason = reason.into();
            lifecycle.state = InitState::Failed;
            lifecycle.failure = Some(reason.clone());
            StateChange::Failed { from, reason }
        };

        let _ = self.state_tx.send(change.clone());
        Ok(change)
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
