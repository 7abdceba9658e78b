//! Transport lifecycle state machine
//!
//! ```text
//! Uninitialized ─► Starting ─► Running ─► Stopping ─► Stopped
//!                     │           │  └───────────────► Stopped (clean exit)
//!                     └──► Failed ◄┴──────── Stopping
//! ```
//!
//! `Stopped` and `Failed` are terminal. The state lives behind one mutex and
//! every accepted transition is recorded exactly once in the history, logged,
//! published on a watch channel and handed to the state-change callback.

use super::events::LifecycleCallbacks;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of a stdio transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    /// Constructed, child not launched yet
    Uninitialized,
    /// Construction hook or spawn in progress
    Starting,
    /// Child is live and its streams are wired
    Running,
    /// Shutdown requested, waiting for the child to exit
    Stopping,
    /// Child exited and streams are drained
    Stopped,
    /// Start failed, the child died abnormally, or a pipe broke
    Failed,
}

impl TransportState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether moving from `self` to `to` is allowed
    pub fn can_transition_to(&self, to: TransportState) -> bool {
        use TransportState::*;

        matches!(
            (self, to),
            (Uninitialized, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// State before the transition
    pub from: TransportState,
    /// State after the transition
    pub to: TransportState,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// Why, when known
    pub reason: Option<String>,
}

/// A transition was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition from {from} to {to}")]
pub struct LifecycleError {
    /// Current state
    pub from: TransportState,
    /// Requested state
    pub to: TransportState,
}

#[derive(Debug)]
struct Inner {
    state: TransportState,
    history: Vec<StateTransition>,
}

/// Shared, lock-guarded lifecycle state
#[derive(Debug)]
pub(crate) struct StateCell {
    inner: Mutex<Inner>,
    tx: watch::Sender<TransportState>,
    callbacks: LifecycleCallbacks,
}

impl StateCell {
    pub(crate) fn new(callbacks: LifecycleCallbacks) -> Self {
        let (tx, _) = watch::channel(TransportState::Uninitialized);
        Self {
            inner: Mutex::new(Inner {
                state: TransportState::Uninitialized,
                history: Vec::new(),
            }),
            tx,
            callbacks,
        }
    }

    pub(crate) fn current(&self) -> TransportState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub(crate) fn history(&self) -> Vec<StateTransition> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }

    /// Move to `to` if the state machine allows it
    pub(crate) fn transition(
        &self,
        to: TransportState,
        reason: Option<String>,
    ) -> Result<StateTransition, LifecycleError> {
        self.apply(None, to, reason)
    }

    /// Move to `to` only if the current state is `from`
    pub(crate) fn transition_from(
        &self,
        from: TransportState,
        to: TransportState,
        reason: Option<String>,
    ) -> Result<StateTransition, LifecycleError> {
        self.apply(Some(from), to, reason)
    }

    fn apply(
        &self,
        expected: Option<TransportState>,
        to: TransportState,
        reason: Option<String>,
    ) -> Result<StateTransition, LifecycleError> {
        let transition = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let from = inner.state;
            if expected.is_some_and(|expected| expected != from) || !from.can_transition_to(to) {
                return Err(LifecycleError { from, to });
            }
            inner.state = to;
            let transition = StateTransition {
                from,
                to,
                timestamp: Utc::now(),
                reason,
            };
            inner.history.push(transition.clone());
            // Published under the lock so watchers see transitions in order.
            self.tx.send_replace(to);
            transition
        };

        debug!(
            from = %transition.from,
            to = %transition.to,
            reason = transition.reason.as_deref().unwrap_or(""),
            "Transport state changed"
        );
        self.callbacks.state_changed(&transition);
        Ok(transition)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.tx.subscribe()
    }

    /// Wait until the state satisfies `pred`
    pub(crate) async fn wait_for(&self, pred: impl Fn(TransportState) -> bool) -> TransportState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            // The sender lives as long as `self`.
            Err(_) => self.current(),
        }
    }
}
