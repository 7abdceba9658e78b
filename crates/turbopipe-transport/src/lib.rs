//! Stdio-process transport for turbopipe
//!
//! Treats a child process as a duplex message channel: frames go to its
//! stdin, frames come back from its stdout, and its stderr is surfaced as
//! diagnostics. A pluggable construction hook decides exactly how the child
//! is created, which is where sandboxing (credential drop, chroot, resource
//! limits) plugs in without the transport knowing about it.
//!
//! # Architecture
//!
//! - **Transport trait**: [`MessageTransport`], the byte-oriented duplex contract
//! - **Stdio transport**: [`stdio::StdioTransport`], lifecycle and supervision
//! - **Construction hooks**: [`stdio::ProcessConstructor`]
//! - **Codecs**: newline-delimited or length-prefixed framing
//! - **Error handling**: [`TransportError`] with coarse categories
//!
//! # Usage
//!
//! ```no_run
//! use turbopipe_transport::stdio::{StdioConfig, StdioTransport};
//!
//! # async fn run() -> turbopipe_transport::Result<()> {
//! let transport = StdioTransport::new(
//!     StdioConfig::new("my-server")
//!         .with_arg("--stdio")
//!         .with_env("LOG_LEVEL", "debug")
//!         .on_stderr(|line| eprintln!("server: {line}")),
//! );
//!
//! transport.send_json(&serde_json::json!({"method": "ping"})).await?;
//! let _reply: serde_json::Value = transport.receive_json().await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod error;
pub mod stdio;
pub mod traits;

// Re-export commonly used types
pub use codec::{FrameCodec, Framing};
pub use error::{
    BoxError, ConstructionError, ErrorCategory, FrameError, Result, ShutdownError, TransportError,
};
pub use stdio::{StdioConfig, StdioTransport, TransportState};
pub use traits::MessageTransport;
