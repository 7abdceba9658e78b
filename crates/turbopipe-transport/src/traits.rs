//! Transport trait
//!
//! Defines the byte-oriented duplex contract shared by transport
//! implementations. Frames are opaque: a transport never looks inside them.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Duplex message transport
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Establish the underlying channel
    async fn open(&self) -> Result<()>;

    /// Send one frame
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Receive the next frame
    async fn receive(&self) -> Result<Bytes>;

    /// Check if transport is connected
    async fn is_connected(&self) -> bool;

    /// Close the transport connection
    async fn close(&self) -> Result<()>;
}
