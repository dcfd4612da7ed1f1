//! Sibling forking with `CLONE_PARENT`.
//!
//! After `unshare(CLONE_NEWPID)` only the caller's *children* enter the new
//! pid namespace. Cloning with `CLONE_PARENT` makes that child a sibling of
//! the caller instead, so the supervisor ends up as its parent and can wait
//! on it directly once the intermediate process exits.

use berth_common::error::{BerthError, Result};
use nix::unistd::Pid;

/// Outcome of [`clone_parent`], seen from each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneResult {
    /// Returned in the calling process.
    Parent {
        /// Pid of the new process, as seen from the caller's pid namespace.
        child: Pid,
    },
    /// Returned in the new process.
    Child,
}

/// Clones the calling process as a sibling (`CLONE_PARENT | SIGCHLD`).
///
/// # Safety
///
/// Same contract as `fork(2)`: the calling process must be single-threaded,
/// or the child may only use async-signal-safe functions until it execs.
///
/// # Errors
///
/// Returns an error if the `clone(2)` syscall fails.
pub unsafe fn clone_parent() -> Result<CloneResult> {
    #[allow(clippy::cast_sign_loss)]
    let flags = (libc::CLONE_PARENT | libc::SIGCHLD) as libc::c_ulong;
    // SAFETY: a null stack makes clone behave like fork, duplicating the
    // caller's stack. The remaining pointer arguments are unused without
    // the corresponding CLONE_* flags.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_clone,
            flags,
            0usize,
            0usize,
            0usize,
            0usize,
        )
    };
    match rc {
        -1 => Err(BerthError::PermissionDenied {
            message: format!("clone(CLONE_PARENT): {}", std::io::Error::last_os_error()),
        }),
        0 => Ok(CloneResult::Child),
        pid => {
            let raw = i32::try_from(pid).map_err(|_| BerthError::config(format!("clone returned pid {pid}")))?;
            Ok(CloneResult::Parent {
                child: Pid::from_raw(raw),
            })
        }
    }
}
