//! Immutable companion images.
//!
//! The companion is executed from a sealed `memfd` copy of the runtime
//! binary, so nothing that happens to the on-disk executable (including a
//! compromised container writing to `/proc/<pid>/exe`) can alter the image
//! a running container was started from.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};

const SELF_EXE: &str = "/proc/self/exe";

/// An executable image the companion can be started from.
#[derive(Debug)]
pub enum CompanionImage {
    /// A sealed in-memory copy, executed through `/proc/self/fd/<n>`.
    Sealed(File),
    /// A plain path on disk.
    Path(PathBuf),
}

impl CompanionImage {
    /// Seals a copy of the currently running executable.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy cannot be created or sealed.
    pub fn sealed_self() -> Result<Self> {
        seal_copy(Path::new(SELF_EXE)).map(Self::Sealed)
    }

    /// Uses `path` as-is, without copying.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// The path to pass to `execve(2)`.
    #[must_use]
    pub fn program(&self) -> PathBuf {
        match self {
            Self::Sealed(file) => PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd())),
            Self::Path(path) => path.clone(),
        }
    }
}

/// Copies `source` into a new memfd and applies every write-blocking seal.
///
/// # Errors
///
/// Returns an error if the memfd cannot be created, filled, or sealed.
pub fn seal_copy(source: &Path) -> Result<File> {
    let name = CString::new("berth-companion").map_err(|e| BerthError::config(e.to_string()))?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of
    // the call.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
    if fd < 0 {
        return Err(BerthError::io("memfd:berth-companion", std::io::Error::last_os_error()));
    }
    // SAFETY: memfd_create returned a fresh descriptor we now own.
    let mut memfd = unsafe { File::from_raw_fd(fd) };

    let mut src = File::open(source).map_err(|e| BerthError::io(source, e))?;
    let copied = std::io::copy(&mut src, &mut memfd).map_err(|e| BerthError::io(source, e))?;

    let seals = libc::F_SEAL_SEAL | libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE;
    // SAFETY: F_ADD_SEALS on a memfd created with MFD_ALLOW_SEALING.
    let rc = unsafe { libc::fcntl(memfd.as_raw_fd(), libc::F_ADD_SEALS, seals) };
    if rc < 0 {
        return Err(BerthError::io("memfd:berth-companion", std::io::Error::last_os_error()));
    }
    tracing::debug!(source = %source.display(), bytes = copied, "sealed companion image");
    Ok(memfd)
}
