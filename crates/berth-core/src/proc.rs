//! `/proc/<pid>/stat` probes.
//!
//! The start time (field 22, in clock ticks since boot) is a fingerprint
//! that distinguishes a process from a later one that reuses its pid.

use berth_common::error::{BerthError, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// The fields of `/proc/<pid>/stat` the runtime relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// Process id.
    pub pid: i32,
    /// Single-letter scheduler state (`R`, `S`, `Z`, ...).
    pub state: char,
    /// Parent process id.
    pub ppid: i32,
    /// Start time in clock ticks after boot.
    pub start_time: u64,
}

impl ProcStat {
    /// Returns `true` if the process has exited but not been reaped.
    #[must_use]
    pub const fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Parses the contents of a `stat` file.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
///
/// # Errors
///
/// Returns an error if a required field is missing or malformed.
pub fn parse_stat(contents: &str) -> Result<ProcStat> {
    let malformed = || BerthError::config(format!("malformed stat line: {contents:?}"));
    let (head, tail) = contents.rsplit_once(')').ok_or_else(malformed)?;
    let pid = head
        .split_once('(')
        .and_then(|(pid, _)| pid.trim().parse().ok())
        .ok_or_else(malformed)?;
    let fields: Vec<&str> = tail.split_whitespace().collect();
    let state = fields
        .first()
        .and_then(|s| s.chars().next())
        .ok_or_else(malformed)?;
    let ppid = fields
        .get(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;
    let start_time = fields
        .get(19)
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;
    Ok(ProcStat {
        pid,
        state,
        ppid,
        start_time,
    })
}

/// Reads and parses `/proc/<pid>/stat`.
///
/// # Errors
///
/// Returns [`BerthError::NotFound`] if the process does not exist, or an
/// I/O or parse error otherwise.
pub fn stat(pid: i32) -> Result<ProcStat> {
    let path = format!("/proc/{pid}/stat");
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BerthError::NotFound {
                kind: "process",
                id: pid.to_string(),
            }
        } else {
            BerthError::io(&path, e)
        }
    })?;
    parse_stat(&contents)
}

/// Returns the start-time fingerprint of `pid`, if it exists.
#[must_use]
pub fn start_time(pid: i32) -> Option<u64> {
    stat(pid).ok().map(|s| s.start_time)
}

/// Sends signal 0 to `pid`. A permission error still proves existence.
#[must_use]
pub fn pid_exists(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Returns `true` if `pid` exists, is not a zombie, and (when given)
/// still carries the `expected` start-time fingerprint.
#[must_use]
pub fn is_alive(pid: i32, expected: Option<u64>) -> bool {
    if pid <= 0 || !pid_exists(pid) {
        return false;
    }
    match stat(pid) {
        Ok(s) => !s.is_zombie() && expected.is_none_or(|t| t == s.start_time),
        Err(_) => false,
    }
}
