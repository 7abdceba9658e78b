//! Duplex framed channel over the child's standard streams
//!
//! Outbound frames go through a single [`FrameWriter`] whose FIFO lock
//! serialises concurrent senders. Each frame is encoded into the write buffer
//! in one step, so a sender that is cancelled while flushing leaves a whole
//! frame behind, which the next send (or the final close) flushes first.
//!
//! Inbound frames are decoded by [`read_frames`] on its own task and handed to
//! the consumer through a bounded channel. Stderr is drained independently by
//! [`read_stderr`] and never mixed into the message stream.

use super::events::LifecycleCallbacks;
use crate::codec::FrameCodec;
use crate::error::{FrameError, Result, TransportError};
use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{AnyDelimiterCodec, Decoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Longest stderr line forwarded to the observer (64 KiB)
pub(crate) const MAX_STDERR_LINE: usize = 64 * 1024;

/// Resolves when `cancel` fires, or never when there is no token
pub(crate) async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Serialised writer for the child's stdin
pub(crate) struct FrameWriter<W> {
    sink: Mutex<Option<FramedWrite<W, FrameCodec>>>,
    halt: CancellationToken,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// `halt` aborts pending and future sends with [`TransportError::Closed`]
    pub(crate) fn new(writer: W, codec: FrameCodec, halt: CancellationToken) -> Self {
        Self {
            sink: Mutex::new(Some(FramedWrite::new(writer, codec))),
            halt,
        }
    }

    /// Write one frame and flush it
    pub(crate) async fn send(&self, frame: Bytes, cancel: Option<&CancellationToken>) -> Result<()> {
        let mut guard = tokio::select! {
            guard = self.sink.lock() => guard,
            _ = self.halt.cancelled() => return Err(TransportError::Closed),
            _ = cancelled(cancel) => return Err(TransportError::Cancelled),
        };
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;

        tokio::select! {
            res = sink.send(frame) => res.map_err(write_error),
            _ = self.halt.cancelled() => Err(TransportError::Closed),
            _ = cancelled(cancel) => Err(TransportError::Cancelled),
        }
    }

    /// Flush what is buffered and close the pipe
    ///
    /// The pipe is dropped even when the flush does not finish within
    /// `timeout`, so the child always sees end of file.
    pub(crate) async fn close(&self, timeout: Duration) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(timeout, sink.close()).await {
            Ok(Ok(())) => debug!("Closed child stdin"),
            Ok(Err(err)) => debug!(error = %err, "Error while closing child stdin"),
            Err(_) => debug!("Timed out flushing child stdin, dropping it"),
        }
    }
}

fn write_error(err: FrameError) -> TransportError {
    match err {
        FrameError::Io(source) => TransportError::io("writing to child stdin", source),
        other => TransportError::Framing(other),
    }
}

/// Decode frames from `reader` until end of file, a read error or `done`
///
/// Framing errors are delivered in place of the affected frame and reading
/// continues. A read error is delivered to the consumer and passed to
/// `on_failure`. Delivery waits for the consumer; it stops when the
/// receiving side is gone or `done` fires.
pub(crate) async fn read_frames<R, F>(
    mut reader: R,
    mut codec: FrameCodec,
    tx: mpsc::Sender<Result<Bytes>>,
    done: CancellationToken,
    on_failure: F,
) where
    R: AsyncRead + Unpin,
    F: FnOnce(TransportError),
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut eof = false;

    loop {
        loop {
            let decoded = if eof {
                codec.decode_eof(&mut buf)
            } else {
                codec.decode(&mut buf)
            };

            let item = match decoded {
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "Dropping malformed frame from child stdout");
                    Err(TransportError::Framing(err))
                }
            };

            tokio::select! {
                sent = tx.send(item) => if sent.is_err() {
                    return;
                },
                _ = done.cancelled() => return,
            }
        }

        if eof {
            debug!("Child stdout reached end of file");
            return;
        }

        buf.reserve(READ_CHUNK);
        tokio::select! {
            res = reader.read_buf(&mut buf) => match res {
                Ok(0) => eof = true,
                Ok(_) => {}
                Err(err) => {
                    let kind = err.kind();
                    let message = err.to_string();
                    let _ = tx
                        .send(Err(TransportError::io("reading child stdout", err)))
                        .await;
                    on_failure(TransportError::io(
                        "reading child stdout",
                        std::io::Error::new(kind, message),
                    ));
                    return;
                }
            },
            _ = done.cancelled() => return,
        }
    }
}

/// Forward stderr lines to the observer and to `tracing`
///
/// Lines longer than [`MAX_STDERR_LINE`] are logged and skipped. Read errors
/// end the loop and are only logged.
pub(crate) async fn read_stderr<R>(
    mut reader: R,
    pid: Option<u32>,
    callbacks: LifecycleCallbacks,
    done: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    // Driven by hand: `FramedRead` ends the stream after the first
    // over-long line, which would close the pipe under the child.
    let mut codec =
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_STDERR_LINE);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut eof = false;

    loop {
        loop {
            let decoded = if eof {
                codec.decode_eof(&mut buf)
            } else {
                codec.decode(&mut buf)
            };

            match decoded {
                Ok(Some(line)) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end_matches('\r');
                    debug!(target: "turbopipe::stderr", pid, "{text}");
                    callbacks.stderr_line(text);
                }
                Ok(None) => break,
                Err(err) => warn!(pid, error = %err, "Skipping over-long line on child stderr"),
            }
        }

        if eof {
            return;
        }

        buf.reserve(READ_CHUNK);
        tokio::select! {
            res = reader.read_buf(&mut buf) => match res {
                Ok(0) => eof = true,
                Ok(_) => {}
                Err(err) => {
                    warn!(pid, error = %err, "Failed to read child stderr");
                    return;
                }
            },
            _ = done.cancelled() => return,
        }
    }
}
