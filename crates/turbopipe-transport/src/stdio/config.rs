//! Configuration for the stdio transport

use super::command::{CommandSpec, LaunchRequest};
use super::constructor::{DefaultConstructor, FnConstructor, ProcessConstructor};
use super::events::LifecycleCallbacks;
use super::process::{ExitInfo, ProcessCommand};
use super::state::StateTransition;
use crate::codec::{DEFAULT_MAX_FRAME_LEN, FrameCodec, Framing};
use crate::error::{ConstructionError, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default bound on construction plus spawn
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a child gets to exit after its stdin is closed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Grace period used when the lifetime token passed to `start` fires
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Default number of decoded frames buffered ahead of the consumer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Configuration for a [`StdioTransport`](super::StdioTransport)
#[derive(Clone)]
pub struct StdioConfig {
    /// What to launch
    pub command: CommandSpec,

    /// How to build the child; `None` uses [`DefaultConstructor`]
    pub constructor: Option<Arc<dyn ProcessConstructor>>,

    /// Bound on hook construction plus spawn
    pub start_timeout: Duration,

    /// Default grace period for [`close`](super::StdioTransport::close)
    pub stop_grace: Duration,

    /// Grace period when the lifetime token fires
    pub cancel_grace: Duration,

    /// Frame delimitation in both directions
    pub framing: Framing,

    /// Maximum size of one frame in bytes
    pub max_frame_len: usize,

    /// Decoded frames buffered ahead of the consumer (at least 1)
    pub channel_capacity: usize,

    pub(crate) callbacks: LifecycleCallbacks,
}

impl StdioConfig {
    /// Create a configuration for `command` with default settings
    pub fn new(command: impl Into<String>) -> Self {
        Self::from_spec(CommandSpec::new(command))
    }

    /// Create a configuration from an existing command spec
    pub fn from_spec(command: CommandSpec) -> Self {
        Self {
            command,
            constructor: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            framing: Framing::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            callbacks: LifecycleCallbacks::default(),
        }
    }

    /// Add a base argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.command = self.command.with_arg(arg);
        self
    }

    /// Add base arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = self.command.with_args(args);
        self
    }

    /// Set a base environment variable
    pub fn with_env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.command = self.command.with_env(key, value);
        self
    }

    /// Add raw `KEY=VALUE` base environment entries
    pub fn with_env_entries<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = self.command.with_env_entries(entries);
        self
    }

    /// Merge the parent's environment underneath the base entries
    pub fn with_inherit_env(mut self, inherit: bool) -> Self {
        self.command = self.command.with_inherit_env(inherit);
        self
    }

    /// Use a custom construction hook
    pub fn with_constructor(mut self, constructor: impl ProcessConstructor + 'static) -> Self {
        self.constructor = Some(Arc::new(constructor));
        self
    }

    /// Use a closure as the construction hook
    pub fn with_command_fn<F>(self, f: F) -> Self
    where
        F: Fn(&CancellationToken, LaunchRequest) -> Result<ProcessCommand, ConstructionError>
            + Send
            + Sync
            + 'static,
    {
        self.with_constructor(FnConstructor::new(f))
    }

    /// Observe every line the child writes to stderr
    pub fn on_stderr<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_stderr = Some(Arc::new(f));
        self
    }

    /// Called once the child is running
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<u32>) + Send + Sync + 'static,
    {
        self.callbacks.on_start = Some(Arc::new(f));
        self
    }

    /// Called exactly once when the child has exited
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(ExitInfo) + Send + Sync + 'static,
    {
        self.callbacks.on_exit = Some(Arc::new(f));
        self
    }

    /// Called when a steady-state error fails the transport
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    /// Called once per lifecycle transition
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.on_state_change = Some(Arc::new(f));
        self
    }

    /// Set the start timeout
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Set the default stop grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the grace period used on lifetime cancellation
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Set the framing
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Set the maximum frame size
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Set the inbound channel capacity (at least 1)
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub(crate) fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.framing, self.max_frame_len)
    }

    pub(crate) fn constructor(&self) -> Arc<dyn ProcessConstructor> {
        match &self.constructor {
            Some(constructor) => Arc::clone(constructor),
            None => Arc::new(DefaultConstructor),
        }
    }
}

impl fmt::Debug for StdioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioConfig")
            .field("command", &self.command)
            .field("custom_constructor", &self.constructor.is_some())
            .field("start_timeout", &self.start_timeout)
            .field("stop_grace", &self.stop_grace)
            .field("cancel_grace", &self.cancel_grace)
            .field("framing", &self.framing)
            .field("max_frame_len", &self.max_frame_len)
            .field("channel_capacity", &self.channel_capacity)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StdioConfig::new("my-server");
        assert_eq!(config.command.command, "my-server");
        assert!(config.command.args.is_empty());
        assert!(config.constructor.is_none());
        assert_eq!(config.start_timeout, Duration::from_secs(30));
        assert_eq!(config.stop_grace, Duration::from_secs(5));
        assert_eq!(config.cancel_grace, Duration::from_secs(1));
        assert_eq!(config.framing, Framing::Lines);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn test_config_builder() {
        let config = StdioConfig::new("my-server")
            .with_arg("--stdio")
            .with_env("API_KEY", "sk-123")
            .with_inherit_env(true)
            .with_stop_grace(Duration::from_millis(200))
            .with_framing(Framing::LengthPrefixed)
            .with_max_frame_len(1024)
            .with_channel_capacity(0)
            .on_stderr(|_| {})
            .with_command_fn(|_, request| Ok(ProcessCommand::new(request.command)));

        assert_eq!(config.command.args, vec!["--stdio"]);
        assert_eq!(config.command.env, vec!["API_KEY=sk-123"]);
        assert!(config.command.inherit_env);
        assert_eq!(config.stop_grace, Duration::from_millis(200));
        assert_eq!(config.codec().framing(), Framing::LengthPrefixed);
        assert_eq!(config.codec().max_frame_len(), 1024);
        assert_eq!(config.channel_capacity, 1);
        assert!(config.constructor.is_some());
        assert!(config.callbacks.on_stderr.is_some());
        assert!(config.callbacks.on_exit.is_none());
    }
}
