//! Container-wide signalling and kill-with-retry.

use berth_common::constants::{KILL_RETRIES, POLL_INTERVAL};
use berth_common::types::{ContainerStatus, FreezerState};
use berth_core::cgroup::CgroupHandle;
use berth_core::proc;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill as kill_pid};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;

use crate::container::Container;
use crate::error::{Result, RuntimeError};
use crate::process::{ContainerProcess, ProcessHandle, poll_until};

/// Sends `sig` to every process in `cgroup` plus `init`.
///
/// The cgroup is frozen while the signal goes out so that no process can
/// fork a child that escapes it, then thawed so the signal is delivered.
/// Init is signalled through its handle, so a recycled pid is skipped.
///
/// # Errors
///
/// Returns an error if the pids cannot be listed or a signal fails for a
/// reason other than the process being gone.
pub fn signal_all_processes(cgroup: &dyn CgroupHandle, init: &ProcessHandle, sig: Signal) -> Result<()> {
    if let Err(e) = cgroup.freeze(FreezerState::Frozen) {
        tracing::warn!(error = %e, "could not freeze cgroup before signalling");
    }
    let result = send_to_all(cgroup, init, sig);
    if let Err(e) = cgroup.freeze(FreezerState::Thawed) {
        tracing::warn!(error = %e, "could not thaw cgroup after signalling");
    }
    result
}

fn send_to_all(cgroup: &dyn CgroupHandle, init: &ProcessHandle, sig: Signal) -> Result<()> {
    let pids = cgroup.get_all_pids()?;
    match init.signal(sig) {
        Ok(()) | Err(RuntimeError::Liveness(_)) => {}
        Err(e) => return Err(e),
    }
    let others: Vec<i32> = pids.into_iter().filter(|pid| *pid != init.pid()).collect();
    send_to_pids(&others, sig)
}

fn send_to_pids(pids: &[i32], sig: Signal) -> Result<()> {
    for &pid in pids {
        match kill_pid(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(RuntimeError::external(format!("signal {sig} to pid {pid}"), e)),
        }
    }
    Ok(())
}

/// SIGKILLs every process still in `cgroup`, with the cgroup frozen
/// while the signals go out, and waits for them to die.
///
/// # Errors
///
/// Returns an error if the pids cannot be listed or signalled, or
/// [`RuntimeError::Liveness`] if one survives the retry ceiling.
pub fn kill_cgroup_members(cgroup: &dyn CgroupHandle) -> Result<()> {
    if let Err(e) = cgroup.freeze(FreezerState::Frozen) {
        tracing::warn!(error = %e, "could not freeze cgroup before killing its members");
    }
    let result = cgroup
        .get_all_pids()
        .map_err(RuntimeError::from)
        .and_then(|pids| send_to_pids(&pids, Signal::SIGKILL).map(|()| pids));
    if let Err(e) = cgroup.freeze(FreezerState::Thawed) {
        tracing::warn!(error = %e, "could not thaw cgroup after killing its members");
    }
    let pids = result?;
    if !pids.is_empty() {
        tracing::debug!(count = pids.len(), "killed processes left in the cgroup");
    }
    wait_for_exit(None, &pids)
}

/// Returns `true` once `pid` is gone or a zombie. Our own exited children
/// are reaped on the way.
fn is_dead(pid: i32) -> bool {
    let _ = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG));
    match proc::stat(pid) {
        Ok(stat) => stat.is_zombie(),
        Err(_) => !proc::pid_exists(pid),
    }
}

/// Waits until `init` and every pid in `pids` are dead, probing every
/// poll interval up to the retry ceiling.
///
/// # Errors
///
/// Returns [`RuntimeError::Liveness`] if something is still alive after
/// the last probe.
pub fn wait_for_exit(init: Option<&ProcessHandle>, pids: &[i32]) -> Result<()> {
    let done = poll_until(KILL_RETRIES, POLL_INTERVAL, || {
        let init_dead = init.is_none_or(|init| {
            let _ = init.try_reap();
            !init.is_alive()
        });
        init_dead && pids.iter().all(|pid| is_dead(*pid))
    });
    if done {
        Ok(())
    } else {
        Err(RuntimeError::Liveness("container init still running".into()))
    }
}

/// Kills the container with `SIGKILL` and waits for it to stop.
///
/// A container that is already stopped is left alone.
///
/// # Errors
///
/// Returns [`RuntimeError::Liveness`] if processes survive the retry
/// ceiling, or the signalling error.
pub fn kill(container: &Container) -> Result<()> {
    if container.status()? == ContainerStatus::Stopped {
        return Ok(());
    }
    let pids = container.cgroup().get_all_pids().unwrap_or_default();
    match container.signal(Signal::SIGKILL) {
        Ok(()) | Err(RuntimeError::NotRunning { .. }) => {}
        Err(e) => return Err(e),
    }
    let init = container.init_process();
    wait_for_exit(init.as_ref(), &pids)?;
    let status = container.status()?;
    tracing::info!(id = %container.id(), %status, "container killed");
    Ok(())
}
