//! Lifecycle callbacks
//!
//! Callbacks run on the transport's background tasks. They should return
//! quickly; a slow stderr observer delays only the stderr loop, never the
//! message stream.

use super::process::ExitInfo;
use super::state::StateTransition;
use crate::error::TransportError;
use std::fmt;
use std::sync::Arc;

/// Called once the child is running, with its process id
pub type StartCallback = Arc<dyn Fn(Option<u32>) + Send + Sync>;

/// Called exactly once when the child has exited
pub type ExitCallback = Arc<dyn Fn(ExitInfo) + Send + Sync>;

/// Called for every line the child writes to stderr (without the newline)
pub type StderrCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called when a steady-state error moves the transport to failed
pub type ErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Called once per lifecycle transition
pub type StateCallback = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// Registered lifecycle observers
#[derive(Clone, Default)]
pub struct LifecycleCallbacks {
    pub(crate) on_start: Option<StartCallback>,
    pub(crate) on_exit: Option<ExitCallback>,
    pub(crate) on_stderr: Option<StderrCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_state_change: Option<StateCallback>,
}

impl LifecycleCallbacks {
    pub(crate) fn started(&self, pid: Option<u32>) {
        if let Some(cb) = &self.on_start {
            cb(pid);
        }
    }

    pub(crate) fn exited(&self, exit: ExitInfo) {
        if let Some(cb) = &self.on_exit {
            cb(exit);
        }
    }

    pub(crate) fn stderr_line(&self, line: &str) {
        if let Some(cb) = &self.on_stderr {
            cb(line);
        }
    }

    pub(crate) fn error(&self, err: &TransportError) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }

    pub(crate) fn state_changed(&self, transition: &StateTransition) {
        if let Some(cb) = &self.on_state_change {
            cb(transition);
        }
    }
}

impl fmt::Debug for LifecycleCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCallbacks")
            .field("on_start", &self.on_start.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}
