//! Child process supervision
//!
//! The supervisor owns everything that outlives a single call: the lifecycle
//! state, the wiring created at start (writer, inbound channel, signal line
//! to the exit waiter) and the completion signals background tasks use to
//! coordinate.
//!
//! Tasks spawned per child:
//! - stdout reader: decodes frames into the inbound channel
//! - stderr loop: forwards diagnostic lines
//! - exit waiter: sole owner of the [`Child`]; waits for exit, delivers
//!   termination signals, drains the readers, publishes the exit and makes
//!   the final state transition
//! - lifetime watchdog: stops the child when the token given to `start` fires

use super::channel::{FrameWriter, cancelled, read_frames, read_stderr};
use super::config::StdioConfig;
use super::events::LifecycleCallbacks;
use super::process::ExitInfo;
use super::state::{StateCell, StateTransition, TransportState};
use crate::error::{Result, ShutdownError, TransportError};
use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the exit waiter waits for the readers after the child is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a forced kill may take before the child is reported as leaked
pub(crate) const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitSignal {
    Terminate,
    Kill,
}

enum Waited {
    Exited,
    TimedOut,
    Cancelled,
}

struct Wiring {
    pid: Option<u32>,
    writer: FrameWriter<ChildStdin>,
    inbound: Mutex<mpsc::Receiver<Result<Bytes>>>,
    signals: mpsc::UnboundedSender<ExitSignal>,
}

/// Moves an abandoned start to `Failed`
struct StartGuard<'a> {
    state: &'a StateCell,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.state.transition_from(
                TransportState::Starting,
                TransportState::Failed,
                Some("start abandoned".to_string()),
            );
        }
    }
}

pub(crate) struct Supervisor {
    config: StdioConfig,
    state: StateCell,
    callbacks: LifecycleCallbacks,
    wiring: OnceLock<Wiring>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    // Cancelled by stop and drop. Send/receive return `Closed` afterwards.
    closed: CancellationToken,
    // Child of `closed`, also cancelled on failure and once the child is gone.
    // Aborts writes to stdin.
    halt: CancellationToken,
    // Ends the stdout and stderr readers. Independent of `closed` so a
    // stopping child can still write until it exits.
    streams: CancellationToken,
    // Child of `closed`; aborts an in-flight start.
    abort_start: CancellationToken,
}

impl Supervisor {
    pub(crate) fn new(config: StdioConfig) -> Self {
        let callbacks = config.callbacks.clone();
        let closed = CancellationToken::new();
        let (exit_tx, _) = watch::channel(None);

        Self {
            state: StateCell::new(callbacks.clone()),
            callbacks,
            wiring: OnceLock::new(),
            exit_tx,
            halt: closed.child_token(),
            streams: CancellationToken::new(),
            abort_start: closed.child_token(),
            closed,
            config,
        }
    }

    pub(crate) fn config(&self) -> &StdioConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> TransportState {
        self.state.current()
    }

    pub(crate) fn history(&self) -> Vec<StateTransition> {
        self.state.history()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.wiring.get().and_then(|wiring| wiring.pid)
    }

    pub(crate) fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_tx.borrow()
    }

    pub(crate) async fn wait(&self) -> Result<ExitInfo> {
        loop {
            if self.wiring.get().is_some() {
                let exit = self.exited().await;
                self.state.wait_for(|s| s.is_terminal()).await;
                return Ok(exit);
            }
            match self.state.current() {
                TransportState::Uninitialized => return Err(TransportError::NotStarted),
                TransportState::Starting => {
                    self.state
                        .wait_for(|s| s != TransportState::Starting)
                        .await;
                }
                _ => return Err(TransportError::Closed),
            }
        }
    }

    /// Launch the child and wire its streams
    pub(crate) async fn start(self: &Arc<Self>, lifetime: &CancellationToken) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if let Err(err) = self.state.transition(TransportState::Starting, None) {
            return Err(match err.from {
                TransportState::Starting | TransportState::Running | TransportState::Stopping => {
                    TransportError::AlreadyStarted
                }
                _ => TransportError::Closed,
            });
        }

        let mut guard = StartGuard {
            state: &self.state,
            armed: true,
        };
        let launched = self.launch(lifetime).await;
        guard.armed = false;

        match launched {
            Ok(pid) => {
                info!(pid, command = %self.config.command.command, "Started child process");
                self.callbacks.started(pid);
                self.spawn_watchdog(pid, lifetime.clone());
                Ok(())
            }
            Err(err) => {
                warn!(command = %self.config.command.command, error = %err, "Failed to start child process");
                let _ = self.state.transition_from(
                    TransportState::Starting,
                    TransportState::Failed,
                    Some(err.to_string()),
                );
                Err(err)
            }
        }
    }

    async fn launch(self: &Arc<Self>, lifetime: &CancellationToken) -> Result<Option<u32>> {
        let request = self.config.command.launch_request();
        let constructor = self.config.constructor();
        let timeout = self.config.start_timeout;

        // Fires when construction is abandoned for any reason.
        let hook_cancel = CancellationToken::new();
        let _hook_guard = hook_cancel.clone().drop_guard();

        debug!(command = %request.command, args = ?request.args, "Constructing child process");
        let command = tokio::select! {
            built = constructor.construct(&hook_cancel, request) => built?,
            _ = lifetime.cancelled() => return Err(TransportError::Cancelled),
            _ = self.abort_start.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(timeout) => return Err(TransportError::Timeout(timeout)),
        };
        debug!(?command, "Spawning child process");

        let spawned = command.spawn()?;
        let pid = spawned.pid();
        let (child, stdin, stdout, stderr) = spawned.into_parts();

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let wiring = Wiring {
            pid,
            writer: FrameWriter::new(stdin, self.config.codec(), self.halt.clone()),
            inbound: Mutex::new(rx),
            signals: signal_tx,
        };
        // Dropping `child` on the error paths kills it.
        if self.wiring.set(wiring).is_err() {
            return Err(TransportError::AlreadyStarted);
        }
        self.state
            .transition_from(TransportState::Starting, TransportState::Running, None)
            .map_err(|_| TransportError::Closed)?;

        let reader = tokio::spawn({
            let supervisor = Arc::clone(self);
            let codec = self.config.codec();
            let streams = self.streams.clone();
            async move {
                read_frames(stdout, codec, tx, streams, |err| supervisor.fail(&err)).await;
            }
        });
        let stderr = tokio::spawn(read_stderr(
            stderr,
            pid,
            self.callbacks.clone(),
            self.streams.clone(),
        ));
        tokio::spawn(Arc::clone(self).watch_exit(child, signal_rx, reader, stderr));

        Ok(pid)
    }

    fn spawn_watchdog(self: &Arc<Self>, pid: Option<u32>, lifetime: CancellationToken) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = lifetime.cancelled() => {
                    debug!(pid, "Transport lifetime cancelled, stopping child");
                    let grace = supervisor.config.cancel_grace;
                    if let Err(err) = supervisor.stop(None, grace).await {
                        warn!(pid, error = %err, "Failed to stop child after cancellation");
                    }
                }
                _ = supervisor.exit_published() => {}
            }
        });
    }

    async fn watch_exit(
        self: Arc<Self>,
        mut child: Child,
        mut signals: mpsc::UnboundedReceiver<ExitSignal>,
        reader: JoinHandle<()>,
        stderr: JoinHandle<()>,
    ) {
        let pid = child.id();
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = signals.recv() => deliver(&mut child, pid, signal),
            }
        };

        let exit = match status {
            Ok(status) => ExitInfo::from(status),
            Err(err) => {
                warn!(pid, error = %err, "Failed to wait for child process");
                ExitInfo::unknown()
            }
        };

        let drain = async {
            let _ = reader.await;
            let _ = stderr.await;
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(pid, "Child streams still open after exit, abandoning them");
        }
        self.streams.cancel();
        self.halt.cancel();

        info!(pid, code = exit.code(), signal = exit.signal(), "Child process exited");
        self.callbacks.exited(exit);
        self.exit_tx.send_replace(Some(exit));

        loop {
            let from = self.state.current();
            let to = match from {
                TransportState::Stopping => TransportState::Stopped,
                TransportState::Running if exit.success() => TransportState::Stopped,
                TransportState::Running => TransportState::Failed,
                _ => break,
            };
            let reason = if to == TransportState::Failed {
                format!("process exited unexpectedly ({exit})")
            } else {
                format!("process exited ({exit})")
            };
            if self.state.transition_from(from, to, Some(reason)).is_ok() {
                break;
            }
        }
    }

    /// Fail a running transport after a steady-state I/O error
    pub(crate) fn fail(&self, err: &TransportError) {
        if self
            .state
            .transition_from(
                TransportState::Running,
                TransportState::Failed,
                Some(err.to_string()),
            )
            .is_err()
        {
            return;
        }

        warn!(pid = self.pid(), error = %err, "Transport failed, killing child");
        self.callbacks.error(err);
        self.halt.cancel();
        self.streams.cancel();
        self.signal(ExitSignal::Kill);
    }

    fn signal(&self, signal: ExitSignal) {
        if let Some(wiring) = self.wiring.get() {
            // The waiter is gone once the child has been reaped.
            let _ = wiring.signals.send(signal);
        }
    }

    async fn exited(&self) -> ExitInfo {
        let mut rx = self.exit_tx.subscribe();
        let exit = rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit);
        exit.unwrap_or_else(ExitInfo::unknown)
    }

    async fn exit_published(&self) {
        let mut rx = self.exit_tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }

    async fn wait_exit(&self, deadline: Instant, cancel: Option<&CancellationToken>) -> Waited {
        tokio::select! {
            _ = self.exit_published() => Waited::Exited,
            _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
            _ = cancelled(cancel) => Waited::Cancelled,
        }
    }

    async fn settled(&self) -> Result<()> {
        self.state.wait_for(|s| s.is_terminal()).await;
        Ok(())
    }

    /// Stop the child, escalating from end of file to SIGTERM to SIGKILL
    pub(crate) async fn stop(
        &self,
        cancel: Option<&CancellationToken>,
        grace: Duration,
    ) -> Result<()> {
        // Also aborts a start in flight.
        self.closed.cancel();

        loop {
            match self.state.current() {
                TransportState::Uninitialized | TransportState::Stopped => return Ok(()),
                TransportState::Failed => return self.reap_failed().await,
                TransportState::Starting => {
                    tokio::select! {
                        _ = self.state.wait_for(|s| s != TransportState::Starting) => {}
                        _ = cancelled(cancel) => return Err(TransportError::Cancelled),
                    }
                }
                TransportState::Stopping => {
                    return tokio::select! {
                        res = self.settled() => res,
                        _ = cancelled(cancel) => Err(TransportError::Cancelled),
                    };
                }
                TransportState::Running => {
                    if self
                        .state
                        .transition_from(
                            TransportState::Running,
                            TransportState::Stopping,
                            Some("stop requested".to_string()),
                        )
                        .is_ok()
                    {
                        return self.shutdown(cancel, grace).await;
                    }
                }
            }
        }
    }

    async fn shutdown(&self, cancel: Option<&CancellationToken>, grace: Duration) -> Result<()> {
        let Some(wiring) = self.wiring.get() else {
            return self.settled().await;
        };
        let pid = wiring.pid;
        let started = Instant::now();
        info!(pid, ?grace, "Stopping child process");

        tokio::select! {
            _ = wiring.writer.close(grace) => {}
            _ = cancelled(cancel) => return self.abort_stop(pid).await,
        }

        match self.wait_exit(started + grace / 2, cancel).await {
            Waited::Exited => return self.settled().await,
            Waited::Cancelled => return self.abort_stop(pid).await,
            Waited::TimedOut => {}
        }

        debug!(pid, "Child still running after end of input, sending SIGTERM");
        self.signal(ExitSignal::Terminate);

        match self.wait_exit(started + grace, cancel).await {
            Waited::Exited => return self.settled().await,
            Waited::Cancelled => return self.abort_stop(pid).await,
            Waited::TimedOut => {}
        }

        warn!(pid, ?grace, "Child did not exit within grace period, killing it");
        self.kill_and_confirm(pid).await
    }

    async fn abort_stop(&self, pid: Option<u32>) -> Result<()> {
        debug!(pid, "Stop cancelled, killing child");
        self.kill_and_confirm(pid).await?;
        Err(TransportError::Cancelled)
    }

    async fn kill_and_confirm(&self, pid: Option<u32>) -> Result<()> {
        self.signal(ExitSignal::Kill);

        match self
            .wait_exit(Instant::now() + KILL_CONFIRM_TIMEOUT, None)
            .await
        {
            Waited::Exited => self.settled().await,
            Waited::TimedOut | Waited::Cancelled => {
                error!(pid, "Child did not exit after kill, it may have leaked");
                let _ = self.state.transition(
                    TransportState::Failed,
                    Some("kill not confirmed".to_string()),
                );
                Err(ShutdownError::KillFailed {
                    pid,
                    waited: KILL_CONFIRM_TIMEOUT,
                }
                .into())
            }
        }
    }

    /// A failed transport may still have a child being killed
    async fn reap_failed(&self) -> Result<()> {
        match self.wiring.get() {
            Some(wiring) if self.exit_info().is_none() => self.kill_and_confirm(wiring.pid).await,
            _ => Ok(()),
        }
    }

    /// Kill without waiting, used when the transport is dropped
    pub(crate) fn shutdown_now(&self) {
        self.closed.cancel();
        if self.exit_info().is_none() {
            self.signal(ExitSignal::Kill);
        }
    }

    async fn io_wiring(&self, cancel: Option<&CancellationToken>) -> Result<&Wiring> {
        loop {
            if self.closed.is_cancelled() {
                return Err(TransportError::Closed);
            }
            if let Some(wiring) = self.wiring.get() {
                return Ok(wiring);
            }
            match self.state.current() {
                TransportState::Uninitialized => return Err(TransportError::NotStarted),
                TransportState::Starting => {
                    tokio::select! {
                        _ = self.state.wait_for(|s| s != TransportState::Starting) => {}
                        _ = cancelled(cancel) => return Err(TransportError::Cancelled),
                    }
                }
                _ => return Err(TransportError::Closed),
            }
        }
    }

    pub(crate) async fn send(
        self: &Arc<Self>,
        frame: Bytes,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        if self.state.current() == TransportState::Uninitialized {
            match self.start(&CancellationToken::new()).await {
                Ok(()) | Err(TransportError::AlreadyStarted) => {}
                Err(err) => return Err(err),
            }
        }

        let wiring = self.io_wiring(cancel).await?;
        if matches!(
            self.state.current(),
            TransportState::Stopping | TransportState::Stopped | TransportState::Failed
        ) {
            return Err(TransportError::Closed);
        }

        match wiring.writer.send(frame, cancel).await {
            Err(err @ TransportError::Io { .. }) => {
                self.fail(&err);
                Err(err)
            }
            other => other,
        }
    }

    pub(crate) async fn receive(&self, cancel: Option<&CancellationToken>) -> Result<Bytes> {
        let wiring = self.io_wiring(cancel).await?;

        let mut inbound = tokio::select! {
            guard = wiring.inbound.lock() => guard,
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            _ = cancelled(cancel) => return Err(TransportError::Cancelled),
        };
        let item = tokio::select! {
            item = inbound.recv() => item,
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            _ = cancelled(cancel) => return Err(TransportError::Cancelled),
        };
        drop(inbound);

        match item {
            Some(item) => item,
            None => tokio::select! {
                exit = self.exited() => Err(TransportError::ProcessExited(exit)),
                _ = self.closed.cancelled() => Err(TransportError::Closed),
                _ = cancelled(cancel) => Err(TransportError::Cancelled),
            },
        }
    }
}

fn deliver(child: &mut Child, pid: Option<u32>, signal: ExitSignal) {
    match signal {
        ExitSignal::Terminate => terminate(child, pid),
        ExitSignal::Kill => match child.start_kill() {
            Ok(()) => debug!(pid, "Sent kill to child"),
            Err(err) => debug!(pid, error = %err, "Failed to kill child"),
        },
    }
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => debug!(pid, "Sent SIGTERM to child"),
        Err(err) => debug!(pid, error = %err, "Failed to send SIGTERM"),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Err(err) = child.start_kill() {
        debug!(pid, error = %err, "Failed to terminate child");
    }
}
