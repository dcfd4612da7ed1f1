//! Live container processes.
//!
//! A [`ProcessHandle`] pins a pid to the start-time fingerprint read when
//! the process was created. Every operation re-checks the fingerprint, so a
//! recycled pid is never signalled by mistake.

use std::time::Duration;

use berth_common::constants::POLL_INTERVAL;
use berth_core::proc;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::error::{Result, RuntimeError};

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Exited with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Ended, but it was not our child so the status is unknown.
    Unknown,
}

impl ExitState {
    /// Shell-style exit code (`128 + signal` for signals).
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => 128 + sig as i32,
            Self::Unknown => 255,
        }
    }
}

/// Operations every container process supports.
pub trait ContainerProcess {
    /// Pid in the runtime's pid namespace.
    fn pid(&self) -> i32;

    /// Start-time fingerprint.
    fn start_time(&self) -> u64;

    /// Returns `true` if the process is alive, unreaped-zombie excluded,
    /// and still the same process.
    fn is_alive(&self) -> bool {
        proc::is_alive(self.pid(), Some(self.start_time()))
    }

    /// Delivers `sig`, refusing if the pid now belongs to another process.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Liveness`] if the fingerprint no longer
    /// matches, or an external error if `kill(2)` fails.
    fn signal(&self, sig: Signal) -> Result<()>;

    /// Waits for the process to end.
    ///
    /// # Errors
    ///
    /// Returns an error if `waitpid(2)` fails.
    fn wait(&self) -> Result<ExitState>;

    /// Kills the process with `SIGKILL` and waits for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be signalled or reaped.
    fn terminate(&self) -> Result<()> {
        match self.signal(Signal::SIGKILL) {
            Ok(()) | Err(RuntimeError::Liveness(_)) => {}
            Err(e) => return Err(e),
        }
        let _ = self.wait()?;
        Ok(())
    }
}

/// Identity of one tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracked {
    pid: i32,
    start_time: u64,
    /// The process is our child, so it can be reaped with `waitpid`.
    child: bool,
}

impl Tracked {
    /// Tracks a process this runtime just spawned.
    #[must_use]
    pub const fn spawned(pid: i32, start_time: u64) -> Self {
        Self {
            pid,
            start_time,
            child: true,
        }
    }

    /// Tracks a process recorded elsewhere (a state file, a checkpoint
    /// engine).
    #[must_use]
    pub const fn adopted(pid: i32, start_time: u64) -> Self {
        Self {
            pid,
            start_time,
            child: false,
        }
    }

    /// Pid of the process.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Start-time fingerprint of the process.
    #[must_use]
    pub const fn start_time(&self) -> u64 {
        self.start_time
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        if proc::start_time(self.pid) != Some(self.start_time) {
            return Err(RuntimeError::Liveness(format!(
                "pid {} no longer belongs to this container",
                self.pid
            )));
        }
        match kill(Pid::from_raw(self.pid), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(RuntimeError::Liveness(format!("pid {} has exited", self.pid))),
            Err(e) => Err(RuntimeError::external(format!("signal {sig} to pid {}", self.pid), e)),
        }
    }

    fn wait(&self) -> Result<ExitState> {
        if !self.child {
            while proc::is_alive(self.pid, Some(self.start_time)) {
                std::thread::sleep(POLL_INTERVAL);
            }
            return Ok(ExitState::Unknown);
        }
        loop {
            match waitpid(Pid::from_raw(self.pid), None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitState::Exited(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitState::Signaled(sig)),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => return Ok(ExitState::Unknown),
                Err(e) => return Err(RuntimeError::external(format!("waitpid {}", self.pid), e)),
            }
        }
    }

    /// Reaps the process if it is our child and has exited. Returns `true`
    /// once there is nothing left to reap.
    #[must_use]
    pub fn try_reap(&self) -> bool {
        if !self.child {
            return !proc::is_alive(self.pid, Some(self.start_time));
        }
        matches!(
            waitpid(Pid::from_raw(self.pid), Some(WaitPidFlag::WNOHANG)),
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD)
        )
    }
}

/// The container's first process: created the namespaces and ran rootfs
/// setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitProcess {
    tracked: Tracked,
}

/// A process that joined a running container's namespaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetnsProcess {
    tracked: Tracked,
}

/// A container process of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessHandle {
    /// The container's init process.
    Init(InitProcess),
    /// An additional process.
    Setns(SetnsProcess),
}

impl ProcessHandle {
    /// Handle for an init process.
    #[must_use]
    pub const fn init(tracked: Tracked) -> Self {
        Self::Init(InitProcess { tracked })
    }

    /// Handle for an additional process.
    #[must_use]
    pub const fn setns(tracked: Tracked) -> Self {
        Self::Setns(SetnsProcess { tracked })
    }

    const fn tracked(&self) -> &Tracked {
        match self {
            Self::Init(p) => &p.tracked,
            Self::Setns(p) => &p.tracked,
        }
    }

    /// Returns `true` for the init process.
    #[must_use]
    pub const fn is_init(&self) -> bool {
        matches!(self, Self::Init(_))
    }

    /// See [`Tracked::try_reap`].
    #[must_use]
    pub fn try_reap(&self) -> bool {
        self.tracked().try_reap()
    }
}

impl ContainerProcess for ProcessHandle {
    fn pid(&self) -> i32 {
        self.tracked().pid
    }

    fn start_time(&self) -> u64 {
        self.tracked().start_time
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        self.tracked().signal(sig)
    }

    fn wait(&self) -> Result<ExitState> {
        self.tracked().wait()
    }
}

/// Polls `done` every `interval` up to `attempts` times.
pub(crate) fn poll_until(attempts: u32, interval: Duration, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..attempts {
        if done() {
            return true;
        }
        std::thread::sleep(interval);
    }
    done()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spawn_sleeper;

    fn track(child: &std::process::Child) -> Tracked {
        let pid = i32::try_from(child.id()).expect("pid");
        Tracked::spawned(pid, proc::start_time(pid).expect("start time"))
    }

    #[test]
    fn signal_and_wait_report_the_signal() {
        let child = spawn_sleeper();
        let handle = ProcessHandle::setns(track(&child));
        assert!(handle.is_alive());
        handle.signal(Signal::SIGTERM).expect("signal");
        assert_eq!(handle.wait().expect("wait"), ExitState::Signaled(Signal::SIGTERM));
        assert!(!handle.is_alive());
    }

    #[test]
    fn wrong_fingerprint_is_never_signalled() {
        let child = spawn_sleeper();
        let real = track(&child);
        let impostor = ProcessHandle::init(Tracked::spawned(real.pid, real.start_time + 1));
        assert!(matches!(
            impostor.signal(Signal::SIGKILL),
            Err(RuntimeError::Liveness(_))
        ));
        assert!(!impostor.is_alive());

        let handle = ProcessHandle::init(real);
        handle.terminate().expect("terminate");
        assert!(handle.try_reap());
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert_eq!(ExitState::Exited(3).code(), 3);
        assert_eq!(ExitState::Signaled(Signal::SIGKILL).code(), 137);
    }

    #[test]
    fn poll_until_gives_up() {
        let mut calls = 0;
        assert!(!poll_until(3, Duration::from_millis(1), || {
            calls += 1;
            false
        }));
        assert_eq!(calls, 4);
    }
}
