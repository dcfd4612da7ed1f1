//! Exec gate: the FIFO that separates "created" from "started".
//!
//! The companion finishes all setup, then blocks opening `exec.fifo` for
//! reading. Releasing the gate opens it for writing, writes one byte, and
//! unlinks it; the companion reads the byte and execs the user program.
//! The FIFO exists exactly while a companion can still be released.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use berth_common::constants::{EXEC_FIFO_FILENAME, EXEC_FIFO_MODE};
use berth_common::error::{BerthError, Result};
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

/// Handle to a container's exec gate.
#[derive(Debug, Clone)]
pub struct ExecGate {
    path: PathBuf,
}

impl ExecGate {
    /// The gate of the container whose state directory is `state_dir`.
    #[must_use]
    pub fn at(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(EXEC_FIFO_FILENAME),
        }
    }

    /// Creates the FIFO, owned by the container's root user.
    ///
    /// # Errors
    ///
    /// Returns an error if the FIFO already exists or cannot be created,
    /// chmodded, or chowned.
    pub fn create(state_dir: &Path, owner_uid: u32, owner_gid: u32) -> Result<Self> {
        let gate = Self::at(state_dir);
        if gate.exists() {
            return Err(BerthError::AlreadyExists {
                kind: "exec fifo",
                id: gate.path.display().to_string(),
            });
        }
        nix::unistd::mkfifo(&gate.path, Mode::from_bits_truncate(0o600))
            .map_err(|e| BerthError::io(&gate.path, e.into()))?;
        // mkfifo honours the umask; set the final mode explicitly.
        std::fs::set_permissions(&gate.path, std::fs::Permissions::from_mode(EXEC_FIFO_MODE))
            .map_err(|e| BerthError::io(&gate.path, e))?;
        nix::unistd::chown(
            &gate.path,
            Some(Uid::from_raw(owner_uid)),
            Some(Gid::from_raw(owner_gid)),
        )
        .map_err(|e| BerthError::io(&gate.path, e.into()))?;
        tracing::debug!(path = %gate.path.display(), "exec fifo created");
        Ok(gate)
    }

    /// Path of the FIFO.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` while the FIFO exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        std::fs::symlink_metadata(&self.path).is_ok()
    }

    /// Opens an `O_PATH` descriptor for handing to the companion. It
    /// grants no read or write access by itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the FIFO cannot be opened.
    pub fn open_path_fd(&self) -> Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_CLOEXEC)
            .open(&self.path)
            .map_err(|e| BerthError::io(&self.path, e))?;
        Ok(file.into())
    }

    /// Releases the companion: blocks until a reader opens the FIFO, writes
    /// one byte, and unlinks it.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate is absent or the write fails.
    pub fn release(&self) -> Result<()> {
        let mut fifo = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&self.path)
            .map_err(|e| BerthError::io(&self.path, e))?;
        fifo.write_all(&[0]).map_err(|e| BerthError::io(&self.path, e))?;
        self.remove()?;
        tracing::debug!(path = %self.path.display(), "exec gate released");
        Ok(())
    }

    /// Releases the companion only if a reader is already attached.
    ///
    /// Returns `Ok(false)` when nobody has the FIFO open for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate is absent or the write fails.
    pub fn try_release(&self) -> Result<bool> {
        let opened = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&self.path);
        let mut fifo = match opened {
            Ok(f) => f,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => return Ok(false),
            Err(e) => return Err(BerthError::io(&self.path, e)),
        };
        fifo.write_all(&[0]).map_err(|e| BerthError::io(&self.path, e))?;
        self.remove()?;
        Ok(true)
    }

    /// Unblocks a writer stuck in [`Self::release`] by briefly opening the
    /// FIFO for reading.
    pub fn unblock_writer(&self) {
        let _ = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&self.path);
    }

    /// Removes the FIFO. A missing FIFO is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BerthError::io(&self.path, e)),
        }
    }
}

/// Companion side: blocks until the gate is released.
///
/// `fd_dir` is a handle on `/proc/self/fd` opened before the root was
/// pivoted, and `fifo_fd` the inherited `O_PATH` descriptor; together they
/// reopen the FIFO for reading without needing it in the container's
/// mount namespace.
///
/// # Errors
///
/// Returns an error if the FIFO cannot be reopened or the releaser closed
/// it without writing.
pub fn wait_for_release(fd_dir: &File, fifo_fd: RawFd) -> Result<()> {
    let name = CString::new(fifo_fd.to_string()).map_err(|e| BerthError::config(e.to_string()))?;
    // SAFETY: `fd_dir` is an open directory and `name` a valid C string.
    let fd = unsafe { libc::openat(fd_dir.as_raw_fd(), name.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    let display = format!("/proc/self/fd/{fifo_fd}");
    if fd < 0 {
        return Err(BerthError::io(display, std::io::Error::last_os_error()));
    }
    // SAFETY: openat returned a fresh descriptor we now own.
    let mut fifo = unsafe { File::from_raw_fd(fd) };
    let mut byte = [0u8; 1];
    let n = fifo.read(&mut byte).map_err(|e| BerthError::io(&display, e))?;
    if n != 1 {
        return Err(BerthError::config("exec gate closed without release"));
    }
    Ok(())
}

/// Opens `/proc/self/fd` as a directory handle for [`wait_for_release`].
///
/// # Errors
///
/// Returns an error if procfs is not available.
pub fn open_fd_dir() -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
        .open("/proc/self/fd")
        .map_err(|e| BerthError::io("/proc/self/fd", e))
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::thread;

    use super::*;

    fn own_ids() -> (u32, u32) {
        (
            nix::unistd::geteuid().as_raw(),
            nix::unistd::getegid().as_raw(),
        )
    }

    #[test]
    fn fifo_has_gate_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (uid, gid) = own_ids();
        let gate = ExecGate::create(dir.path(), uid, gid).expect("create");
        let meta = std::fs::metadata(gate.path()).expect("stat");
        assert_eq!(meta.permissions().mode() & 0o777, EXEC_FIFO_MODE);
        assert!(ExecGate::create(dir.path(), uid, gid).is_err());
    }

    #[test]
    fn one_byte_releases_one_reader_and_removes_fifo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (uid, gid) = own_ids();
        let gate = ExecGate::create(dir.path(), uid, gid).expect("create");
        let path = gate.path().to_path_buf();

        let reader = thread::spawn(move || {
            let mut fifo = File::open(&path).expect("open for read");
            let mut buf = Vec::new();
            let _ = fifo.read_to_end(&mut buf).expect("read");
            buf
        });

        gate.release().expect("release");
        assert_eq!(reader.join().expect("join"), vec![0]);
        assert!(!gate.exists());
        assert!(gate.release().is_err(), "second release must fail");
    }

    #[test]
    fn companion_waits_through_proc_fd() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (uid, gid) = own_ids();
        let gate = ExecGate::create(dir.path(), uid, gid).expect("create");
        let path_fd = gate.open_path_fd().expect("o_path");
        let fd_dir = open_fd_dir().expect("fd dir");

        let raw = path_fd.as_raw_fd();
        let companion = thread::spawn(move || {
            let result = wait_for_release(&fd_dir, raw);
            drop(path_fd);
            result
        });

        gate.release().expect("release");
        companion.join().expect("join").expect("released");
    }

    #[test]
    fn try_release_without_reader_reports_false() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (uid, gid) = own_ids();
        let gate = ExecGate::create(dir.path(), uid, gid).expect("create");
        assert!(!gate.try_release().expect("try"));
        assert!(gate.exists());
        gate.remove().expect("remove");
        gate.remove().expect("second remove is a no-op");
    }

    #[test]
    fn unblock_writer_frees_a_blocked_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (uid, gid) = own_ids();
        let gate = ExecGate::create(dir.path(), uid, gid).expect("create");
        let writer_gate = gate.clone();
        let writer = thread::spawn(move || writer_gate.release());

        // Keep opening until the writer's open has paired with one of ours.
        while !writer.is_finished() {
            gate.unblock_writer();
            thread::sleep(std::time::Duration::from_millis(10));
        }
        let _ = writer.join().expect("join");
    }
}
