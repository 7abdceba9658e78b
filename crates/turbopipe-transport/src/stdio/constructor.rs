//! Process construction hooks
//!
//! A [`ProcessConstructor`] turns a [`LaunchRequest`] into a configured,
//! not-yet-started [`ProcessCommand`]. This is the only place where the way a
//! child is created can be customised: swapping the executable, rewriting
//! arguments, replacing the environment, choosing a working directory, or
//! attaching [`SandboxAttributes`](super::SandboxAttributes) such as a
//! credential drop or a chroot.
//!
//! # Example
//!
//! ```no_run
//! use turbopipe_transport::stdio::{
//!     Credential, ProcessCommand, SandboxAttributes, StdioConfig, StdioTransport,
//! };
//!
//! let config = StdioConfig::new("my-server")
//!     .with_arg("--stdio")
//!     .with_command_fn(|_cancel, request| {
//!         Ok(ProcessCommand::new(format!("/usr/libexec/{}", request.command))
//!             .with_args(request.args)
//!             .with_env_entries(["PATH=/usr/bin"])
//!             .with_sandbox(
//!                 SandboxAttributes::new()
//!                     .with_credential(Credential::new(1001, 1001))
//!                     .with_chroot("/srv/jail"),
//!             ))
//!     });
//! let transport = StdioTransport::new(config);
//! ```

use super::command::LaunchRequest;
use super::process::ProcessCommand;
use crate::error::ConstructionError;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Strategy that builds the child process for a transport
#[async_trait]
pub trait ProcessConstructor: Send + Sync {
    /// Build the child process described by `request`
    ///
    /// Long-running work must watch `cancel` and return promptly once it
    /// fires. The returned command must not have been started.
    async fn construct(
        &self,
        cancel: &CancellationToken,
        request: LaunchRequest,
    ) -> Result<ProcessCommand, ConstructionError>;
}

/// Constructor used when the caller supplies none
///
/// Resolves the executable on the parent's search path and passes the
/// arguments and environment through unchanged. No working directory or
/// isolation attribute is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConstructor;

#[async_trait]
impl ProcessConstructor for DefaultConstructor {
    async fn construct(
        &self,
        _cancel: &CancellationToken,
        request: LaunchRequest,
    ) -> Result<ProcessCommand, ConstructionError> {
        if request.command.is_empty() {
            return Err(ConstructionError::InvalidConfig(
                "command must not be empty".to_string(),
            ));
        }

        let program = resolve_executable(&request.command)?;
        Ok(ProcessCommand::new(program)
            .with_args(request.args)
            .with_env_entries(request.env))
    }
}

/// Resolve `command` the way a shell would
///
/// Names containing a path separator are used as given; bare names are
/// looked up on the parent's `PATH`.
pub fn resolve_executable(command: &str) -> Result<std::path::PathBuf, ConstructionError> {
    if Path::new(command).components().count() > 1 {
        return Ok(command.into());
    }

    which::which(command).map_err(|err| ConstructionError::ExecutableNotFound {
        name: command.to_string(),
        reason: err.to_string(),
    })
}

/// Adapter turning a closure into a [`ProcessConstructor`]
pub struct FnConstructor<F>(F);

impl<F> FnConstructor<F>
where
    F: Fn(&CancellationToken, LaunchRequest) -> Result<ProcessCommand, ConstructionError>
        + Send
        + Sync,
{
    /// Wrap `f`
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ProcessConstructor for FnConstructor<F>
where
    F: Fn(&CancellationToken, LaunchRequest) -> Result<ProcessCommand, ConstructionError>
        + Send
        + Sync,
{
    async fn construct(
        &self,
        cancel: &CancellationToken,
        request: LaunchRequest,
    ) -> Result<ProcessCommand, ConstructionError> {
        (self.0)(cancel, request)
    }
}

impl<F> std::fmt::Debug for FnConstructor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnConstructor")
    }
}
