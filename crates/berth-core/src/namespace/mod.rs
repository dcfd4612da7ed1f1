//! Linux namespace management for container isolation.
//!
//! Provides the immutable namespace-type to clone-flag table plus safe
//! wrappers around `unshare(2)` and `setns(2)`.

pub mod time;
pub mod user;

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Kind of Linux namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// User and group ids.
    User,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Hostname and domain name.
    Uts,
    /// Network devices, stacks, and ports.
    Network,
    /// Process ids.
    Pid,
    /// Cgroup root directory.
    Cgroup,
    /// Boot and monotonic clocks.
    Time,
    /// Mount points.
    Mount,
}

/// Clone flag of every namespace type, in the order namespaces are joined.
///
/// The user namespace comes first so that joining the others is permitted
/// from inside it; the mount namespace comes last so that the namespace
/// paths above are still resolvable while they are being opened.
pub const NAMESPACE_TABLE: [(NamespaceType, libc::c_int); 8] = [
    (NamespaceType::User, libc::CLONE_NEWUSER),
    (NamespaceType::Ipc, libc::CLONE_NEWIPC),
    (NamespaceType::Uts, libc::CLONE_NEWUTS),
    (NamespaceType::Network, libc::CLONE_NEWNET),
    (NamespaceType::Pid, libc::CLONE_NEWPID),
    (NamespaceType::Cgroup, libc::CLONE_NEWCGROUP),
    (NamespaceType::Time, libc::CLONE_NEWTIME),
    (NamespaceType::Mount, libc::CLONE_NEWNS),
];

impl NamespaceType {
    /// Returns the `CLONE_NEW*` flag for this namespace type.
    #[must_use]
    pub const fn clone_flag(self) -> libc::c_int {
        let mut i = 0;
        while i < NAMESPACE_TABLE.len() {
            if NAMESPACE_TABLE[i].0 as u8 == self as u8 {
                return NAMESPACE_TABLE[i].1;
            }
            i += 1;
        }
        0
    }

    /// Returns the file name of this namespace under `/proc/<pid>/ns`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Network => "net",
            Self::Pid => "pid",
            Self::Cgroup => "cgroup",
            Self::Time => "time",
            Self::Mount => "mnt",
        }
    }

    /// Returns the path of this namespace for a live process.
    #[must_use]
    pub fn proc_path(self, pid: i32) -> PathBuf {
        PathBuf::from(format!("/proc/{pid}/ns/{}", self.proc_name()))
    }

    /// Returns every namespace type in join order.
    pub fn all() -> impl Iterator<Item = Self> {
        NAMESPACE_TABLE.iter().map(|(ty, _)| *ty)
    }
}

impl fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// A namespace a container should be placed in.
///
/// Without a path a new namespace is created; with a path the existing
/// namespace at that path is joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace kind.
    #[serde(rename = "type")]
    pub ty: NamespaceType,
    /// Path of an existing namespace to join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Namespace {
    /// A namespace of type `ty` to be newly created.
    #[must_use]
    pub const fn new(ty: NamespaceType) -> Self {
        Self { ty, path: None }
    }

    /// A namespace of type `ty` to be joined at `path`.
    #[must_use]
    pub fn join(ty: NamespaceType, path: impl Into<PathBuf>) -> Self {
        Self {
            ty,
            path: Some(path.into()),
        }
    }
}

/// Combines the clone flags of every namespace that must be created.
///
/// Namespaces with a join path contribute nothing.
#[must_use]
pub fn clone_flags(namespaces: &[Namespace]) -> CloneFlags {
    let bits = namespaces
        .iter()
        .filter(|ns| ns.path.is_none())
        .fold(0, |acc, ns| acc | ns.ty.clone_flag());
    CloneFlags::from_bits_retain(bits)
}

/// Returns the join paths of `namespaces`, ordered by [`NAMESPACE_TABLE`].
///
/// # Errors
///
/// Returns an error if a path contains a comma (paths are transferred as
/// a comma-separated list) or does not exist.
pub fn ordered_join_paths(namespaces: &[Namespace]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for ty in NamespaceType::all() {
        let Some(path) = namespaces
            .iter()
            .find(|ns| ns.ty == ty)
            .and_then(|ns| ns.path.as_ref())
        else {
            continue;
        };
        if path.to_string_lossy().contains(',') {
            return Err(BerthError::config(format!(
                "invalid namespace path {}",
                path.display()
            )));
        }
        let _ = std::fs::symlink_metadata(path).map_err(|e| BerthError::io(path, e))?;
        paths.push(path.clone());
    }
    Ok(paths)
}

/// Creates the namespaces selected by `flags` for the calling process.
///
/// A new pid namespace only applies to children forked afterwards.
///
/// # Errors
///
/// Returns an error if the `unshare(2)` syscall fails.
pub fn unshare_namespaces(flags: CloneFlags) -> Result<()> {
    if flags.is_empty() {
        return Ok(());
    }
    nix::sched::unshare(flags).map_err(|e| BerthError::PermissionDenied {
        message: format!("unshare({flags:?}) failed: {e}"),
    })?;
    tracing::debug!(?flags, "namespaces created");
    Ok(())
}

/// Joins the namespace at `path`.
///
/// The namespace type is detected by the kernel from the file itself.
///
/// # Errors
///
/// Returns an error if the path cannot be opened or `setns(2)` fails.
pub fn join_namespace(path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|e| BerthError::io(path, e))?;
    nix::sched::setns(&file, CloneFlags::empty()).map_err(|e| BerthError::PermissionDenied {
        message: format!("setns {} failed: {e}", path.display()),
    })?;
    tracing::debug!(path = %path.display(), "joined namespace");
    Ok(())
}

/// Returns `true` if `namespaces` creates a fresh pid namespace, making the
/// container's init pid 1 inside it.
#[must_use]
pub fn has_private_pid_namespace(namespaces: &[Namespace]) -> bool {
    namespaces
        .iter()
        .any(|ns| ns.ty == NamespaceType::Pid && ns.path.is_none())
}
