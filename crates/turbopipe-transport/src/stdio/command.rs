//! Command description for the child process

use serde::{Deserialize, Serialize};

/// Immutable description of what to launch
///
/// Environment entries use the `KEY=VALUE` form. Keys are unique: setting a
/// key that is already present replaces its entry in place.
///
/// # Security Note
///
/// By default the child sees *only* the entries configured here. Set
/// [`CommandSpec::with_inherit_env`] to merge the parent's environment
/// underneath them; a sandboxing hook will usually want to leave it off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path
    pub command: String,

    /// Base arguments, in order
    #[serde(default)]
    pub args: Vec<String>,

    /// Base environment entries
    #[serde(default)]
    pub env: Vec<String>,

    /// Merge the parent's environment underneath `env`
    #[serde(default)]
    pub inherit_env: bool,
}

impl CommandSpec {
    /// Create a spec for the given executable with no arguments or environment
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            inherit_env: false,
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

    /// Set an environment variable
    pub fn with_env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let entry = format!("{}={}", key.as_ref(), value.as_ref());
        upsert_env(&mut self.env, entry);
        self
    }

    /// Add raw `KEY=VALUE` entries
    ///
    /// Entries are kept verbatim; the default constructor rejects entries
    /// without a `=` when the transport starts.
    pub fn with_env_entries<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for entry in entries {
            upsert_env(&mut self.env, entry.into());
        }
        self
    }

    /// Inherit the parent's environment
    pub fn with_inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    /// Derive the launch triple handed to the construction hook
    pub fn launch_request(&self) -> LaunchRequest {
        let env = if self.inherit_env {
            let mut env: Vec<String> = std::env::vars()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            for entry in &self.env {
                upsert_env(&mut env, entry.clone());
            }
            env
        } else {
            self.env.clone()
        };

        LaunchRequest {
            command: self.command.clone(),
            args: self.args.clone(),
            env,
        }
    }
}

/// The resolved `(command, args, env)` triple passed to a construction hook
///
/// A hook owns the triple: it may use it verbatim, discard the arguments, or
/// replace the environment wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Executable identifier, as configured
    pub command: String,
    /// Final argument list
    pub args: Vec<String>,
    /// Final environment entries in `KEY=VALUE` form
    pub env: Vec<String>,
}

/// Key part of a `KEY=VALUE` entry (the whole entry when there is no `=`)
pub(crate) fn env_key(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(key, _)| key)
}

/// Split a `KEY=VALUE` entry, rejecting entries with no `=` or an empty key
pub(crate) fn split_env_entry(entry: &str) -> Option<(&str, &str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Some((key, value)),
        _ => None,
    }
}

pub(crate) fn upsert_env(env: &mut Vec<String>, entry: String) {
    let key = env_key(&entry).to_string();
    match env.iter_mut().find(|existing| env_key(existing) == key) {
        Some(existing) => *existing = entry,
        None => env.push(entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("my-server")
            .with_arg("--stdio")
            .with_args(["--log", "debug"])
            .with_env("API_KEY", "sk-123")
            .with_env("MODE", "a");

        assert_eq!(spec.command, "my-server");
        assert_eq!(spec.args, vec!["--stdio", "--log", "debug"]);
        assert_eq!(spec.env, vec!["API_KEY=sk-123", "MODE=a"]);
        assert!(!spec.inherit_env);
    }

    #[test]
    fn test_env_keys_are_unique() {
        let spec = CommandSpec::new("x")
            .with_env("MODE", "a")
            .with_env("OTHER", "1")
            .with_env_entries(["MODE=b"]);

        assert_eq!(spec.env, vec!["MODE=b", "OTHER=1"]);
    }

    #[test]
    fn test_launch_request_passes_spec_through() {
        let spec = CommandSpec::new("echo")
            .with_arg("foo=bar")
            .with_env_entries(["hello"]);
        let request = spec.launch_request();

        assert_eq!(request.command, "echo");
        assert_eq!(request.args, vec!["foo=bar"]);
        assert_eq!(request.env, vec!["hello"]);
    }

    #[test]
    fn test_launch_request_does_not_inherit_by_default() {
        let request = CommandSpec::new("env").launch_request();
        assert!(request.env.is_empty());
    }

    #[test]
    fn test_launch_request_inherits_when_asked() {
        let request = CommandSpec::new("env")
            .with_inherit_env(true)
            .with_env("PATH", "/opt/bin")
            .launch_request();

        let paths: Vec<_> = request
            .env
            .iter()
            .filter(|entry| env_key(entry) == "PATH")
            .collect();
        assert_eq!(paths, vec!["PATH=/opt/bin"]);
    }

    #[test]
    fn test_split_env_entry() {
        assert_eq!(split_env_entry("A=1"), Some(("A", "1")));
        assert_eq!(split_env_entry("A=b=c"), Some(("A", "b=c")));
        assert_eq!(split_env_entry("A="), Some(("A", "")));
        assert_eq!(split_env_entry("hello"), None);
        assert_eq!(split_env_entry("=x"), None);
    }

    #[test]
    fn test_command_spec_deserializes_with_defaults() {
        let spec: CommandSpec = serde_json::from_str(r#"{"command": "srv"}"#).unwrap();
        assert_eq!(spec, CommandSpec::new("srv"));
    }
}
