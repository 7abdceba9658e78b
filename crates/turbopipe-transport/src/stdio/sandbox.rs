//! OS-level isolation attributes for the child process
//!
//! These attributes are set by a construction hook on the
//! [`ProcessCommand`](super::ProcessCommand) it returns. The transport never
//! reads them: they are applied by the command itself at spawn time, between
//! `fork` and `exec`, in this order:
//!
//! 1. `chroot` into the confinement root
//! 2. resource limits
//! 3. supplementary groups, gid, uid
//! 4. `chdir` into the working directory (`/` of the new root when confined)
//!
//! Changing credentials or the root directory needs the matching privileges
//! in the parent; the spawn fails with a construction error otherwise.

use crate::error::ConstructionError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Identity the child runs as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// User id
    pub uid: u32,
    /// Primary group id
    pub gid: u32,
    /// Supplementary groups; empty drops all of the parent's
    #[serde(default)]
    pub groups: Vec<u32>,
}

impl Credential {
    /// Run as `uid`/`gid` with no supplementary groups
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    /// Set supplementary groups
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = u32>) -> Self {
        self.groups = groups.into_iter().collect();
        self
    }
}

/// Resource a limit applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// CPU time in seconds
    CpuSeconds,
    /// Largest file the child may create, in bytes
    FileSize,
    /// Number of open file descriptors
    OpenFiles,
    /// Core dump size in bytes
    CoreSize,
    /// Data segment size in bytes
    DataSize,
    /// Stack size in bytes
    StackSize,
    /// Address space in bytes (Linux only)
    AddressSpace,
    /// Number of processes for the user (Linux only)
    Processes,
}

/// A soft/hard limit pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    /// Limited resource
    pub resource: Resource,
    /// Soft limit
    pub soft: u64,
    /// Hard limit
    pub hard: u64,
}

impl ResourceLimit {
    /// Same soft and hard limit
    pub fn fixed(resource: Resource, limit: u64) -> Self {
        Self {
            resource,
            soft: limit,
            hard: limit,
        }
    }
}

/// Isolation attributes attached to a child process by a construction hook
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxAttributes {
    /// Identity to drop to before exec
    #[serde(default)]
    pub credential: Option<Credential>,

    /// Filesystem root to confine the child to
    #[serde(default)]
    pub chroot: Option<PathBuf>,

    /// Resource limits
    #[serde(default)]
    pub rlimits: Vec<ResourceLimit>,

    /// Put the child in its own process group
    #[serde(default)]
    pub new_process_group: bool,
}

impl SandboxAttributes {
    /// No isolation
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop to the given identity
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Confine the child to `root`
    pub fn with_chroot(mut self, root: impl Into<PathBuf>) -> Self {
        self.chroot = Some(root.into());
        self
    }

    /// Add a resource limit
    pub fn with_rlimit(mut self, limit: ResourceLimit) -> Self {
        self.rlimits.push(limit);
        self
    }

    /// Start the child in a new process group
    pub fn with_new_process_group(mut self, enabled: bool) -> Self {
        self.new_process_group = enabled;
        self
    }

    /// Whether any attribute is set
    pub fn is_empty(&self) -> bool {
        self.credential.is_none()
            && self.chroot.is_none()
            && self.rlimits.is_empty()
            && !self.new_process_group
    }

    fn needs_pre_exec(&self) -> bool {
        self.credential.is_some() || self.chroot.is_some() || !self.rlimits.is_empty()
    }

    /// Configure `cmd` so the attributes take effect when it is spawned
    #[cfg(unix)]
    #[allow(unsafe_code)]
    pub(crate) fn apply(
        &self,
        cmd: &mut Command,
        current_dir: Option<&Path>,
    ) -> Result<(), ConstructionError> {
        use nix::unistd::{Gid, Uid};

        if self.new_process_group {
            cmd.process_group(0);
        }

        if !self.needs_pre_exec() {
            if let Some(dir) = current_dir {
                cmd.current_dir(dir);
            }
            return Ok(());
        }

        // Everything the closure touches is prepared here: the child side of
        // fork must not allocate.
        let chroot = self.chroot.clone();
        let dir = match (current_dir, &chroot) {
            (Some(dir), _) => Some(dir.to_path_buf()),
            (None, Some(_)) => Some(PathBuf::from("/")),
            (None, None) => None,
        };
        let limits = self
            .rlimits
            .iter()
            .map(|limit| Ok((to_nix_resource(limit.resource)?, limit.soft, limit.hard)))
            .collect::<Result<Vec<_>, ConstructionError>>()?;
        let credential = self.credential.as_ref().map(|cred| {
            (
                Uid::from_raw(cred.uid),
                Gid::from_raw(cred.gid),
                cred.groups.iter().copied().map(Gid::from_raw).collect::<Vec<_>>(),
            )
        });

        // SAFETY: the closure runs in the forked child before exec. It only
        // issues syscalls through nix on data captured above.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(root) = &chroot {
                    nix::unistd::chroot(root.as_path())?;
                }
                for (resource, soft, hard) in &limits {
                    nix::sys::resource::setrlimit(*resource, *soft, *hard)?;
                }
                if let Some((uid, gid, groups)) = &credential {
                    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
                    nix::unistd::setgroups(groups)?;
                    #[cfg(not(any(
                        target_os = "linux",
                        target_os = "android",
                        target_os = "freebsd"
                    )))]
                    let _ = groups;
                    nix::unistd::setgid(*gid)?;
                    nix::unistd::setuid(*uid)?;
                }
                if let Some(dir) = &dir {
                    nix::unistd::chdir(dir.as_path())?;
                }
                Ok(())
            });
        }

        Ok(())
    }

    #[cfg(not(unix))]
    pub(crate) fn apply(
        &self,
        cmd: &mut Command,
        current_dir: Option<&Path>,
    ) -> Result<(), ConstructionError> {
        if !self.is_empty() {
            return Err(ConstructionError::InvalidConfig(
                "sandbox attributes are only supported on Unix".to_string(),
            ));
        }
        if let Some(dir) = current_dir {
            cmd.current_dir(dir);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn to_nix_resource(resource: Resource) -> Result<nix::sys::resource::Resource, ConstructionError> {
    use nix::sys::resource::Resource as R;

    Ok(match resource {
        Resource::CpuSeconds => R::RLIMIT_CPU,
        Resource::FileSize => R::RLIMIT_FSIZE,
        Resource::OpenFiles => R::RLIMIT_NOFILE,
        Resource::CoreSize => R::RLIMIT_CORE,
        Resource::DataSize => R::RLIMIT_DATA,
        Resource::StackSize => R::RLIMIT_STACK,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Resource::AddressSpace => R::RLIMIT_AS,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Resource::Processes => R::RLIMIT_NPROC,
        #[allow(unreachable_patterns)]
        other => {
            return Err(ConstructionError::InvalidConfig(format!(
                "resource limit {other:?} is not supported on this platform"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        assert!(SandboxAttributes::new().is_empty());
        assert!(!SandboxAttributes::new().with_chroot("/srv/root").is_empty());
    }

    #[test]
    fn test_builder_records_attributes() {
        let attrs = SandboxAttributes::new()
            .with_credential(Credential::new(1001, 1001).with_groups([1001, 27]))
            .with_chroot("/srv/root")
            .with_rlimit(ResourceLimit::fixed(Resource::OpenFiles, 64));

        let cred = attrs.credential.as_ref().unwrap();
        assert_eq!((cred.uid, cred.gid), (1001, 1001));
        assert_eq!(cred.groups, vec![1001, 27]);
        assert_eq!(attrs.chroot.as_deref(), Some(Path::new("/srv/root")));
        assert_eq!(attrs.rlimits[0].soft, 64);
        assert!(attrs.needs_pre_exec());
    }

    #[test]
    fn test_process_group_only_needs_no_pre_exec() {
        let attrs = SandboxAttributes::new().with_new_process_group(true);
        assert!(!attrs.is_empty());
        assert!(!attrs.needs_pre_exec());
    }

    #[test]
    fn test_deserialize_from_config() {
        let attrs: SandboxAttributes = serde_json::from_str(
            r#"{"credential": {"uid": 1001, "gid": 1001}, "chroot": "/jail",
                "rlimits": [{"resource": "cpu_seconds", "soft": 5, "hard": 10}]}"#,
        )
        .unwrap();
        assert_eq!(attrs.credential, Some(Credential::new(1001, 1001)));
        assert_eq!(attrs.chroot, Some(PathBuf::from("/jail")));
        assert_eq!(attrs.rlimits[0].resource, Resource::CpuSeconds);
    }
}
