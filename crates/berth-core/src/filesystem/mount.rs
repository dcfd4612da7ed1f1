//! Mount utilities for container filesystem setup.
//!
//! Runs inside the container's mount namespace, before `pivot_root`.

use std::path::Path;

use berth_common::error::{BerthError, Result};
use nix::mount::{MsFlags, mount};
use serde::{Deserialize, Serialize};

/// Propagation type applied recursively to `/` before the rootfs is
/// prepared, so container mounts never leak back to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    /// No propagation in either direction.
    #[default]
    Private,
    /// Host mounts propagate in, container mounts do not propagate out.
    Slave,
    /// Propagation in both directions.
    Shared,
}

impl Propagation {
    const fn flags(self) -> MsFlags {
        match self {
            Self::Private => MsFlags::MS_PRIVATE,
            Self::Slave => MsFlags::MS_SLAVE,
            Self::Shared => MsFlags::MS_SHARED,
        }
    }
}

fn mount_error(what: &str, target: &Path, err: nix::Error) -> BerthError {
    BerthError::PermissionDenied {
        message: format!("{what} {}: {err}", target.display()),
    }
}

/// Recursively sets the propagation type of the mount at `target`.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn set_propagation(target: &Path, propagation: Propagation) -> Result<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_REC | propagation.flags(),
        None::<&str>,
    )
    .map_err(|e| mount_error("changing propagation of", target, e))?;
    tracing::debug!(target = %target.display(), ?propagation, "mount propagation changed");
    Ok(())
}

/// Creates a recursive bind mount from `source` to `target`.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn bind_mount(source: &Path, target: &Path, readonly: bool) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_error("bind mounting onto", target, e))?;
    if readonly {
        remount_readonly(target)?;
    }
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        readonly,
        "created bind mount"
    );
    Ok(())
}

/// Remounts the bind mount at `target` read-only.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn remount_readonly(target: &Path) -> Result<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| mount_error("remounting read-only", target, e))
}

/// Mounts a fresh `proc` filesystem at `<rootfs>/proc`.
///
/// Only meaningful when the caller is in a new pid namespace; otherwise the
/// host's process table would be exposed.
///
/// # Errors
///
/// Returns an error if the mount point cannot be created or the mount
/// fails.
pub fn mount_proc(rootfs: &Path) -> Result<()> {
    let target = rootfs.join("proc");
    std::fs::create_dir_all(&target).map_err(|e| BerthError::io(&target, e))?;
    mount(
        Some("proc"),
        &target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| mount_error("mounting proc on", &target, e))?;
    tracing::debug!(target = %target.display(), "mounted proc");
    Ok(())
}
