//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::path::Path;

use berth_common::error::{BerthError, Result};
use nix::mount::{MntFlags, umount2};

/// Switches the root filesystem to `new_root`.
///
/// Uses the `pivot_root(".", ".")` form: the old root is stacked on top of
/// the new one and detached immediately, so no `put_old` directory is
/// needed inside the image. `new_root` must be a mount point.
///
/// # Errors
///
/// Returns an error if any of the `chdir`, `pivot_root`, or `umount2`
/// calls fail.
pub fn pivot_root(new_root: &Path) -> Result<()> {
    let denied = |what: &str, e: nix::Error| BerthError::PermissionDenied {
        message: format!("{what} during pivot_root to {}: {e}", new_root.display()),
    };
    nix::unistd::chdir(new_root).map_err(|e| denied("chdir", e))?;
    nix::unistd::pivot_root(".", ".").map_err(|e| denied("pivot_root", e))?;
    umount2(".", MntFlags::MNT_DETACH).map_err(|e| denied("detaching old root", e))?;
    nix::unistd::chdir("/").map_err(|e| denied("chdir", e))?;
    tracing::info!(new_root = %new_root.display(), "performed pivot_root");
    Ok(())
}
