//! Stdio-process transport
//!
//! Runs a child process and exchanges frames with it over stdin/stdout.
//! How the child is created is decided by a [`ProcessConstructor`]: the
//! default one resolves the executable on the search path and passes the
//! configured arguments and environment through, while a custom one can
//! replace all of it and attach [`SandboxAttributes`].

mod channel;
pub mod command;
pub mod config;
pub mod constructor;
pub mod events;
pub mod process;
pub mod sandbox;
pub mod state;
mod supervisor;
mod transport;

pub use command::{CommandSpec, LaunchRequest};
pub use config::{
    DEFAULT_CANCEL_GRACE, DEFAULT_CHANNEL_CAPACITY, DEFAULT_START_TIMEOUT, DEFAULT_STOP_GRACE,
    StdioConfig,
};
pub use constructor::{DefaultConstructor, FnConstructor, ProcessConstructor, resolve_executable};
pub use events::LifecycleCallbacks;
pub use process::{CommandCustomizer, ExitInfo, ProcessCommand, SpawnedProcess};
pub use sandbox::{Credential, Resource, ResourceLimit, SandboxAttributes};
pub use state::{LifecycleError, StateTransition, TransportState};
pub use transport::StdioTransport;
