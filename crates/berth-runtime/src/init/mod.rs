//! Companion entry point.
//!
//! The runtime binary enters here through its hidden `init` subcommand.
//! Stage 1 applies [`BootstrapAttributes`], then clones stage 2 as a
//! sibling and exits. Stage 2 receives the [`InitConfig`] and continues in
//! [`standard`] or [`setns`] until it execs the user program.

pub mod setns;
pub mod standard;

use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};

use berth_core::capability;
use berth_core::fork::{self, CloneResult};
use berth_core::namespace::{self, time};
use nix::sched::CloneFlags;
use nix::unistd::{Gid, Uid};

use crate::bootstrap::{self, BootstrapAttributes};
use crate::collaborators::{HostSecurity, PivotRootfs, RootfsSetup, SecurityApply};
use crate::config::{InitConfig, InitKind, Process};
use crate::error::{Result, RuntimeError, SyncError};
use crate::logs::{self, LogPipe};
use crate::sync::{SyncChannel, SyncType};

const OOM_SCORE_ADJ: &str = "/proc/self/oom_score_adj";

/// Descriptors and settings handed to the companion on its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitArgs {
    /// Child end of the sync channel.
    pub sync_fd: RawFd,
    /// Write end of the log pipe.
    pub log_fd: RawFd,
    /// `O_PATH` descriptor of the exec gate, for init processes.
    pub fifo_fd: Option<RawFd>,
    /// Log filter.
    pub log_level: String,
}

/// The companion's connections to the supervisor.
///
/// Both are closed once the handshake is over, before the user program
/// can run.
#[derive(Debug)]
pub struct Session {
    channel: Option<SyncChannel>,
    pipe: LogPipe,
}

impl Session {
    /// The sync channel, while it is open.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] after [`Self::close`].
    pub fn channel(&mut self) -> Result<&mut SyncChannel> {
        self.channel.as_mut().ok_or(RuntimeError::Synchronization(SyncError::Closed))
    }

    /// Closes the sync channel and the log pipe.
    pub fn close(&mut self) {
        drop(self.channel.take());
        self.pipe.close();
    }

    fn report(&mut self, err: &RuntimeError) {
        if let Some(channel) = self.channel.as_mut() {
            let _ = channel.send_error(&err.to_string());
        }
    }
}

/// Runs the companion with the default collaborators and returns its exit
/// code. On success the user program replaces this process and the
/// function never returns.
#[must_use]
pub fn main(args: &InitArgs) -> i32 {
    main_with(args, &PivotRootfs, &HostSecurity)
}

/// Same as [`main`] with explicit collaborators.
#[must_use]
pub fn main_with(args: &InitArgs, rootfs: &dyn RootfsSetup, security: &dyn SecurityApply) -> i32 {
    // SAFETY: the supervisor passed these descriptors for this process to
    // own; nothing else in the process refers to them.
    let (sync, log) = unsafe { (OwnedFd::from_raw_fd(args.sync_fd), OwnedFd::from_raw_fd(args.log_fd)) };
    let pipe = LogPipe::new(log);
    let _ = logs::install_companion_logging(&pipe, &args.log_level);
    let mut session = Session {
        channel: Some(SyncChannel::from_fd(sync)),
        pipe,
    };

    let result = match stage_one(&mut session) {
        Ok(Stage::Exit) => return 0,
        Ok(Stage::Continue) => stage_two(&mut session, args.fifo_fd, rootfs, security),
        Err(e) => Err(e),
    };
    let Err(err) = result;
    tracing::error!(error = %err, "companion failed");
    session.report(&err);
    1
}

enum Stage {
    Exit,
    Continue,
}

fn stage_one(session: &mut Session) -> Result<Stage> {
    let channel = session.channel()?;
    let frame = channel.read_frame()?;
    let attrs = BootstrapAttributes::decode(&frame)?;

    if let Some(adj) = attrs.oom_score_adj {
        std::fs::write(OOM_SCORE_ADJ, adj.to_string())
            .map_err(|e| RuntimeError::external(format!("write {OOM_SCORE_ADJ}"), e))?;
    }
    for path in &attrs.ns_paths {
        namespace::join_namespace(path)?;
    }

    let flags = CloneFlags::from_bits_retain(attrs.clone_flags);
    if flags.contains(CloneFlags::CLONE_NEWUSER) {
        namespace::unshare_namespaces(CloneFlags::CLONE_NEWUSER)?;
        if !attrs.uid_map.is_empty() || !attrs.gid_map.is_empty() {
            bootstrap::request_usermap(channel)?;
        }
        become_root()?;
    }
    namespace::unshare_namespaces(flags.difference(CloneFlags::CLONE_NEWUSER))?;
    time::write_time_offsets(&attrs.time_offsets)?;

    // SAFETY: the companion is single-threaded; the log forwarder lives in
    // the supervisor, not here.
    match unsafe { fork::clone_parent() }? {
        CloneResult::Parent { child } => {
            bootstrap::send_child_pid(channel, child.as_raw())?;
            tracing::debug!(pid = child.as_raw(), "stage 2 cloned");
            Ok(Stage::Exit)
        }
        CloneResult::Child => Ok(Stage::Continue),
    }
}

/// Switches to root of a freshly mapped user namespace.
fn become_root() -> Result<()> {
    nix::unistd::setresgid(Gid::from_raw(0), Gid::from_raw(0), Gid::from_raw(0))
        .map_err(|e| RuntimeError::external("setresgid(0)", e))?;
    nix::unistd::setresuid(Uid::from_raw(0), Uid::from_raw(0), Uid::from_raw(0))
        .map_err(|e| RuntimeError::external("setresuid(0)", e))?;
    Ok(())
}

fn stage_two(
    session: &mut Session,
    fifo_fd: Option<RawFd>,
    rootfs: &dyn RootfsSetup,
    security: &dyn SecurityApply,
) -> Result<Infallible> {
    let config: InitConfig = session.channel()?.recv_json()?;
    tracing::debug!(id = %config.id, kind = ?config.kind, "stage 2 configured");
    match config.kind {
        InitKind::Standard => standard::run(session, &config, fifo_fd, rootfs, security),
        InitKind::Setns => setns::run(session, &config, security),
    }
}

/// Sets `PR_SET_NO_NEW_PRIVS`.
fn set_no_new_privileges() -> Result<()> {
    // SAFETY: PR_SET_NO_NEW_PRIVS takes integer arguments only.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(RuntimeError::external(
            "PR_SET_NO_NEW_PRIVS",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Applies LSM labels for the next exec.
fn apply_labels(config: &InitConfig, security: &dyn SecurityApply) -> Result<()> {
    if let Some(profile) = &config.apparmor_profile {
        security.apply_apparmor(profile)?;
    }
    if let Some(label) = &config.process_label {
        security.apply_selinux_label(label)?;
    }
    Ok(())
}

/// Runs the ready/run handshake and hands over a seccomp listener if one
/// was created.
fn sync_ready(session: &mut Session, config: &InitConfig, security: &dyn SecurityApply) -> Result<()> {
    session.channel()?.handshake(SyncType::Ready, SyncType::Run)?;
    if let Some(listener) = security.init_seccomp(config)? {
        let channel = session.channel()?;
        channel.send_with_fd(SyncType::Seccomp, listener.as_fd())?;
        let _ = channel.expect(SyncType::SeccompDone)?;
    }
    Ok(())
}

/// Drops to the process's credentials, keeping the configured
/// capabilities, and enters its working directory.
fn finalize_namespace(config: &InitConfig, security: &dyn SecurityApply) -> Result<()> {
    let caps = config.capabilities.as_deref();
    if let Some(caps) = caps {
        security.apply_capabilities(caps)?;
        capability::set_keep_caps(true)?;
    }
    switch_identity(&config.process)?;
    if let Some(caps) = caps {
        capability::set_keep_caps(false)?;
        capability::set_capabilities(caps)?;
    }
    nix::unistd::chdir(&config.process.cwd)
        .map_err(|e| RuntimeError::external(format!("chdir {}", config.process.cwd.display()), e))?;
    Ok(())
}

fn switch_identity(process: &Process) -> Result<()> {
    let user = &process.user;
    let unchanged = user.additional_gids.is_empty()
        && nix::unistd::getuid().as_raw() == user.uid
        && nix::unistd::getgid().as_raw() == user.gid;
    if unchanged {
        return Ok(());
    }
    let groups: Vec<Gid> = user.additional_gids.iter().copied().map(Gid::from_raw).collect();
    nix::unistd::setgroups(&groups).map_err(|e| RuntimeError::external("setgroups", e))?;
    let gid = Gid::from_raw(user.gid);
    nix::unistd::setresgid(gid, gid, gid).map_err(|e| RuntimeError::external("setresgid", e))?;
    let uid = Uid::from_raw(user.uid);
    nix::unistd::setresuid(uid, uid, uid).map_err(|e| RuntimeError::external("setresuid", e))?;
    Ok(())
}

/// Replaces the companion with the user program.
fn exec_process(process: &Process) -> Result<Infallible> {
    let to_cstrings = |items: &[String]| -> Result<Vec<CString>> {
        items
            .iter()
            .map(|s| {
                CString::new(s.as_str())
                    .map_err(|_| RuntimeError::Configuration(format!("{s:?} contains a NUL byte")))
            })
            .collect()
    };
    let args = to_cstrings(&process.args)?;
    let env = to_cstrings(&process.env)?;
    let program = args
        .first()
        .ok_or_else(|| RuntimeError::Configuration("process args must not be empty".into()))?;
    berth_core::fd::mark_cloexec_from(3)?;
    nix::unistd::execvpe(program, &args, &env)
        .map_err(|e| RuntimeError::external(format!("exec {}", process.args[0]), e))
}
