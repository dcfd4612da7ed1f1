//! Stage 2 of a container's first process.

use std::convert::Infallible;
use std::os::fd::RawFd;

use crate::collaborators::{RootfsSetup, SecurityApply};
use crate::config::InitConfig;
use crate::error::{Result, RuntimeError};
use crate::gate;

use super::Session;

/// Sets up the container around the companion, completes the handshake,
/// waits on the exec gate, and execs the user program.
///
/// # Errors
///
/// Returns the first failing step; on success it does not return.
pub fn run(
    session: &mut Session,
    config: &InitConfig,
    fifo_fd: Option<RawFd>,
    rootfs: &dyn RootfsSetup,
    security: &dyn SecurityApply,
) -> Result<Infallible> {
    // Opened before the pivot; procfs may not be reachable afterwards.
    let fd_dir = gate::open_fd_dir()?;

    rootfs.prepare_rootfs(session.channel()?, config)?;
    if let Some(hostname) = &config.hostname {
        nix::unistd::sethostname(hostname)
            .map_err(|e| RuntimeError::external(format!("sethostname {hostname}"), e))?;
    }
    super::apply_labels(config, security)?;
    rootfs.finalize_rootfs(config)?;
    if config.no_new_privileges {
        super::set_no_new_privileges()?;
    }

    super::sync_ready(session, config, security)?;
    super::finalize_namespace(config, security)?;

    if config.use_exec_gate {
        let fifo_fd = fifo_fd.ok_or_else(|| {
            RuntimeError::Configuration("init process started without an exec gate".into())
        })?;
        tracing::debug!(id = %config.id, "waiting on exec gate");
        session.close();
        gate::wait_for_release(&fd_dir, fifo_fd)?;
    } else {
        session.close();
    }
    drop(fd_dir);
    super::exec_process(&config.process)
}
