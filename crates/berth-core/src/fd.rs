//! File-descriptor hygiene.
//!
//! Descriptors leaking across `execve(2)` into a container are a classic
//! escape vector, so both the supervisor (before spawning the companion)
//! and the companion (before running the user program) mark everything
//! above the standard streams close-on-exec.

use std::os::fd::RawFd;

use berth_common::error::{BerthError, Result};

const FD_DIR: &str = "/proc/self/fd";

/// Lists the descriptors currently open in this process.
///
/// # Errors
///
/// Returns an error if `/proc/self/fd` cannot be read.
pub fn open_fds() -> Result<Vec<RawFd>> {
    let entries = std::fs::read_dir(FD_DIR).map_err(|e| BerthError::io(FD_DIR, e))?;
    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

/// Sets or clears `FD_CLOEXEC` on `fd`.
///
/// # Errors
///
/// Returns an error if `fcntl(2)` fails.
pub fn set_cloexec(fd: RawFd, cloexec: bool) -> Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch descriptor flags; an invalid fd
    // yields EBADF.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(BerthError::io(
            format!("{FD_DIR}/{fd}"),
            std::io::Error::last_os_error(),
        ));
    }
    let wanted = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if wanted != flags {
        // SAFETY: see above.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, wanted) };
        if rc < 0 {
            return Err(BerthError::io(
                format!("{FD_DIR}/{fd}"),
                std::io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

/// Marks every descriptor numbered `min_fd` or higher close-on-exec.
///
/// Descriptors that disappear while iterating (including the one used to
/// read the directory) are ignored.
///
/// # Errors
///
/// Returns an error if `/proc/self/fd` cannot be read.
pub fn mark_cloexec_from(min_fd: RawFd) -> Result<()> {
    let mut marked = 0usize;
    for fd in open_fds()?.into_iter().filter(|fd| *fd >= min_fd) {
        match set_cloexec(fd, true) {
            Ok(()) => marked += 1,
            Err(BerthError::Io { source, .. }) if source.raw_os_error() == Some(libc::EBADF) => {}
            Err(e) => return Err(e),
        }
    }
    tracing::debug!(min_fd, marked, "descriptors marked close-on-exec");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    fn is_cloexec(fd: RawFd) -> bool {
        // SAFETY: F_GETFD on a descriptor owned by the test.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn toggles_close_on_exec() {
        let file = tempfile::tempfile().expect("tempfile");
        let fd = file.as_raw_fd();
        set_cloexec(fd, false).expect("clear");
        assert!(!is_cloexec(fd));
        set_cloexec(fd, true).expect("set");
        assert!(is_cloexec(fd));
    }

    #[test]
    fn marks_inherited_descriptors() {
        let file = tempfile::tempfile().expect("tempfile");
        let fd = file.as_raw_fd();
        set_cloexec(fd, false).expect("clear");
        mark_cloexec_from(fd).expect("mark");
        assert!(is_cloexec(fd));
    }

    #[test]
    fn open_fds_includes_standard_streams() {
        let fds = open_fds().expect("list");
        assert!(fds.contains(&0) || fds.contains(&1) || fds.contains(&2));
    }

    #[test]
    fn invalid_descriptor_is_an_error() {
        assert!(set_cloexec(-1, true).is_err());
    }
}
