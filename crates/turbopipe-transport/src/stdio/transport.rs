//! Stdio transport facade

use super::config::StdioConfig;
use super::process::ExitInfo;
use super::state::{StateTransition, TransportState};
use super::supervisor::Supervisor;
use crate::error::Result;
use crate::traits::MessageTransport;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A child process used as a duplex message channel
///
/// Frames written with [`send`](Self::send) go to the child's stdin; frames
/// the child writes to stdout come back through [`receive`](Self::receive).
/// The child's stderr is drained separately and only reaches the stderr
/// observer and `tracing`.
///
/// # Example
///
/// ```no_run
/// use turbopipe_transport::stdio::{StdioConfig, StdioTransport};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> turbopipe_transport::Result<()> {
/// let transport = StdioTransport::new(StdioConfig::new("cat"));
/// transport.start(&CancellationToken::new()).await?;
///
/// transport.send("ping").await?;
/// let reply = transport.receive().await?;
/// assert_eq!(&reply[..], b"ping");
///
/// transport.close().await?;
/// # Ok(())
/// # }
/// ```
///
/// Dropping the transport without closing it kills the child.
pub struct StdioTransport {
    inner: Arc<Supervisor>,
}

impl fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.inner.config().command.command)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl StdioTransport {
    /// Create a transport; nothing is launched until [`start`](Self::start)
    /// or the first [`send`](Self::send)
    pub fn new(config: StdioConfig) -> Self {
        Self {
            inner: Arc::new(Supervisor::new(config)),
        }
    }

    /// Construct, spawn and wire the child
    ///
    /// `lifetime` bounds the transport, not just this call: once it fires the
    /// child is stopped with the configured cancel grace period. Fails with
    /// [`AlreadyStarted`](crate::TransportError::AlreadyStarted) if a child is
    /// already starting or running, and with
    /// [`Closed`](crate::TransportError::Closed) after the transport ended.
    pub async fn start(&self, lifetime: &CancellationToken) -> Result<()> {
        self.inner.start(lifetime).await
    }

    /// Start with a lifetime that never fires on its own
    pub async fn open(&self) -> Result<()> {
        self.start(&CancellationToken::new()).await
    }

    /// Stop the child using the configured grace period
    pub async fn close(&self) -> Result<()> {
        let grace = self.inner.config().stop_grace;
        self.inner.stop(None, grace).await
    }

    /// Stop the child
    ///
    /// Closes the child's stdin, waits up to half of `grace`, sends SIGTERM,
    /// waits for the rest of `grace`, then kills it. Cancelling `cancel`
    /// skips straight to the kill and returns
    /// [`Cancelled`](crate::TransportError::Cancelled). Stopping a transport
    /// that never started, or has already ended, succeeds.
    pub async fn stop(&self, cancel: &CancellationToken, grace: Duration) -> Result<()> {
        self.inner.stop(Some(cancel), grace).await
    }

    /// Send one frame, starting the transport first if needed
    ///
    /// With line framing an empty frame is refused with
    /// [`FrameError::Empty`](crate::FrameError::Empty).
    pub async fn send(&self, frame: impl Into<Bytes>) -> Result<()> {
        self.inner.send(frame.into(), None).await
    }

    /// Send one frame, giving up when `cancel` fires
    ///
    /// A frame that was already handed to the writer is still delivered
    /// whole; it is never cut short on the wire.
    pub async fn send_cancellable(
        &self,
        cancel: &CancellationToken,
        frame: impl Into<Bytes>,
    ) -> Result<()> {
        self.inner.send(frame.into(), Some(cancel)).await
    }

    /// Receive the next frame
    ///
    /// Returns [`ProcessExited`](crate::TransportError::ProcessExited) once
    /// the child's output has ended and every frame has been consumed.
    pub async fn receive(&self) -> Result<Bytes> {
        self.inner.receive(None).await
    }

    /// Receive the next frame, giving up when `cancel` fires
    pub async fn receive_cancellable(&self, cancel: &CancellationToken) -> Result<Bytes> {
        self.inner.receive(Some(cancel)).await
    }

    /// Serialize `value` as compact JSON and send it as one frame
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let frame = serde_json::to_vec(value)?;
        self.send(frame).await
    }

    /// Receive one frame and deserialize it from JSON
    pub async fn receive_json<T: DeserializeOwned>(&self) -> Result<T> {
        let frame = self.receive().await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Wait for the child to exit
    pub async fn wait(&self) -> Result<ExitInfo> {
        self.inner.wait().await
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransportState {
        self.inner.state()
    }

    /// Every transition so far, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.history()
    }

    /// Watch lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.inner.subscribe_state()
    }

    /// OS process id of the child, once spawned
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }

    /// How the child exited, once it has
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.inner.exit_info()
    }

    /// Whether the child is running and accepting frames
    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Running
    }

    /// The configuration this transport was created with
    pub fn config(&self) -> &StdioConfig {
        self.inner.config()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.inner.shutdown_now();
    }
}

#[async_trait]
impl MessageTransport for StdioTransport {
    async fn open(&self) -> Result<()> {
        StdioTransport::open(self).await
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        StdioTransport::send(self, frame).await
    }

    async fn receive(&self) -> Result<Bytes> {
        StdioTransport::receive(self).await
    }

    async fn is_connected(&self) -> bool {
        StdioTransport::is_connected(self)
    }

    async fn close(&self) -> Result<()> {
        StdioTransport::close(self).await
    }
}
