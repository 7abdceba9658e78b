//! Process handles for the stdio transport
//!
//! [`ProcessCommand`] is what a construction hook returns: a fully configured
//! child that has not been started yet. [`SpawnedProcess`] is the running
//! child together with its three standard streams.

use super::command::{split_env_entry, upsert_env};
use super::sandbox::SandboxAttributes;
use crate::error::ConstructionError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Raw adjustment applied to the underlying [`Command`] right before spawn
pub type CommandCustomizer = Box<dyn FnMut(&mut Command) + Send + Sync>;

/// A configured, not-yet-started child process
///
/// The environment is exact: the child starts with an empty environment and
/// receives only [`ProcessCommand::env`]. Standard input, output and error
/// are always piped.
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<String>,
    current_dir: Option<PathBuf>,
    sandbox: SandboxAttributes,
    customizers: Vec<CommandCustomizer>,
}

impl ProcessCommand {
    /// Create a command for `program` with no arguments and an empty environment
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            sandbox: SandboxAttributes::default(),
            customizers: Vec::new(),
        }
    }

    /// Add an argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable, replacing an existing entry for `key`
    pub fn with_env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        upsert_env(
            &mut self.env,
            format!("{}={}", key.as_ref(), value.as_ref()),
        );
        self
    }

    /// Replace the whole environment with `KEY=VALUE` entries
    pub fn with_env_entries<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = entries.into_iter().map(Into::into).collect();
        self
    }

    /// Run the child in `dir`
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Attach isolation attributes
    pub fn with_sandbox(mut self, sandbox: SandboxAttributes) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Register a raw adjustment of the underlying tokio [`Command`]
    ///
    /// Customizers run last, after arguments, environment and sandbox have
    /// been applied. Replacing the piped standard streams makes the spawn
    /// fail.
    pub fn with_customizer<F>(mut self, customizer: F) -> Self
    where
        F: FnMut(&mut Command) + Send + Sync + 'static,
    {
        self.customizers.push(Box::new(customizer));
        self
    }

    /// Program to execute
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments, excluding the program name
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment entries the child will see
    pub fn env(&self) -> &[String] {
        &self.env
    }

    /// Working directory override
    pub fn current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Isolation attributes
    pub fn sandbox(&self) -> &SandboxAttributes {
        &self.sandbox
    }

    /// Start the process
    ///
    /// The child is killed if the returned handle is dropped without being
    /// waited on.
    pub fn spawn(mut self) -> Result<SpawnedProcess, ConstructionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).env_clear();

        for entry in &self.env {
            let (key, value) = split_env_entry(entry).ok_or_else(|| {
                ConstructionError::InvalidConfig(format!(
                    "environment entry `{entry}` is not of the form KEY=VALUE"
                ))
            })?;
            cmd.env(key, value);
        }

        self.sandbox.apply(&mut cmd, self.current_dir.as_deref())?;

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for customizer in &mut self.customizers {
            customizer(&mut cmd);
        }

        let program = self.program.display().to_string();
        let mut child = cmd
            .spawn()
            .map_err(|source| ConstructionError::Spawn { program, source })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(ConstructionError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ConstructionError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ConstructionError::MissingPipe("stderr"))?;

        Ok(SpawnedProcess {
            pid: child.id(),
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

impl fmt::Debug for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("current_dir", &self.current_dir)
            .field("sandbox", &self.sandbox)
            .field("customizers", &self.customizers.len())
            .finish()
    }
}

/// A started child process and its standard streams
#[derive(Debug)]
pub struct SpawnedProcess {
    pub(crate) pid: Option<u32>,
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
}

impl SpawnedProcess {
    /// OS process id
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Split into the child and its three streams
    pub fn into_parts(self) -> (Child, ChildStdin, ChildStdout, ChildStderr) {
        (self.child, self.stdin, self.stdout, self.stderr)
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitInfo {
    /// Normal exit with `code`
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Terminated by `signal`
    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub(crate) fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Exit code, when the child exited normally
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// Terminating signal, when the child was killed
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// Exited normally with code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::sandbox::Credential;

    #[test]
    fn test_builder_records_launch_settings() {
        let sandbox = SandboxAttributes::new()
            .with_credential(Credential::new(1001, 1001))
            .with_chroot("/jail");
        let cmd = ProcessCommand::new("/bin/echo")
            .with_arg("bonjour")
            .with_env_entries(["PATH=/usr/bin", "NODE_ENV=production"])
            .with_current_dir("/tmp")
            .with_sandbox(sandbox.clone());

        assert_eq!(cmd.program(), Path::new("/bin/echo"));
        assert_eq!(cmd.args(), ["bonjour"]);
        assert_eq!(cmd.env(), ["PATH=/usr/bin", "NODE_ENV=production"]);
        assert_eq!(cmd.current_dir(), Some(Path::new("/tmp")));
        assert_eq!(cmd.sandbox(), &sandbox);
    }

    #[test]
    fn test_with_env_replaces_key() {
        let cmd = ProcessCommand::new("x")
            .with_env("A", "1")
            .with_env("A", "2");
        assert_eq!(cmd.env(), ["A=2"]);
    }

    #[test]
    fn test_spawn_rejects_malformed_env() {
        let err = ProcessCommand::new("true")
            .with_env_entries(["hello"])
            .spawn()
            .unwrap_err();
        assert!(matches!(err, ConstructionError::InvalidConfig(_)));
    }

    #[test]
    fn test_exit_info_display() {
        assert_eq!(ExitInfo::from_code(0).to_string(), "exit code 0");
        assert_eq!(ExitInfo::from_signal(9).to_string(), "killed by signal 9");
        assert!(ExitInfo::from_code(0).success());
        assert!(!ExitInfo::from_code(2).success());
        assert!(!ExitInfo::from_signal(15).success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_pipes_all_streams() {
        let spawned = ProcessCommand::new("/bin/sh")
            .with_args(["-c", "exit 7"])
            .spawn()
            .expect("spawn sh");
        assert!(spawned.pid().is_some());

        let (mut child, _stdin, _stdout, _stderr) = spawned.into_parts();
        let status = child.wait().await.unwrap();
        assert_eq!(ExitInfo::from(status), ExitInfo::from_code(7));
    }
}
