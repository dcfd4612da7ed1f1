//! Seams between the lifecycle core and host-specific setup.
//!
//! The companion calls a [`RootfsSetup`] and a [`SecurityApply`] at fixed
//! points of its setup sequence. [`PivotRootfs`] and [`HostSecurity`] are
//! the defaults; checkpointing has no default and must be supplied.

use std::fmt::Debug;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use berth_common::error::BerthError;
use berth_core::capability::{self, Capability};
use berth_core::filesystem;

use crate::config::{InitConfig, Process};
use crate::error::{Result, RuntimeError};
use crate::state::State;
use crate::sync::{SyncChannel, SyncType};

/// Prepares the container's root filesystem inside the companion.
pub trait RootfsSetup: Send + Sync + Debug {
    /// Mounts the rootfs and switches into it. Implementations that run
    /// prestart hooks must ask the parent through `channel` with
    /// [`SyncType::Hooks`] and wait for [`SyncType::Resume`] after mounts
    /// are in place and before the root is switched.
    ///
    /// # Errors
    ///
    /// Returns an error if any mount step or the handshake fails.
    fn prepare_rootfs(&self, channel: &mut SyncChannel, config: &InitConfig) -> Result<()>;

    /// Final adjustments after hostname and labels are set.
    ///
    /// # Errors
    ///
    /// Returns an error if a remount fails.
    fn finalize_rootfs(&self, config: &InitConfig) -> Result<()>;
}

/// Applies security attributes inside the companion.
pub trait SecurityApply: Send + Sync + Debug {
    /// Restricts the bounding set and sets the remaining capability sets
    /// to `keep`.
    ///
    /// # Errors
    ///
    /// Returns an error if a capability syscall fails.
    fn apply_capabilities(&self, keep: &[Capability]) -> Result<()>;

    /// Installs a seccomp filter. A returned descriptor is a user
    /// notification listener to hand to the parent.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter cannot be loaded.
    fn init_seccomp(&self, config: &InitConfig) -> Result<Option<OwnedFd>>;

    /// Selects the AppArmor profile for the next exec.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile cannot be requested.
    fn apply_apparmor(&self, profile: &str) -> Result<()>;

    /// Selects the SELinux label for the next exec.
    ///
    /// # Errors
    ///
    /// Returns an error if the label cannot be requested.
    fn apply_selinux_label(&self, label: &str) -> Result<()>;
}

/// Options for checkpoint and restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointOptions {
    /// Directory holding the checkpoint images.
    pub image_path: PathBuf,
    /// Scratch directory for the engine's logs and temporary files.
    pub work_path: Option<PathBuf>,
    /// Keep the container running after the checkpoint.
    pub leave_running: bool,
}

/// Process recreated by a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredProcess {
    /// Pid of the restored init in the runtime's pid namespace.
    pub pid: i32,
}

/// Dumps and recreates a container's process tree.
pub trait CheckpointEngine: Send + Sync + Debug {
    /// Writes images of the container described by `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the dump fails.
    fn checkpoint(&self, state: &State, options: &CheckpointOptions) -> Result<()>;

    /// Recreates the process tree from images.
    ///
    /// # Errors
    ///
    /// Returns an error if the restore fails.
    fn restore(
        &self,
        state: &State,
        process: &Process,
        options: &CheckpointOptions,
    ) -> Result<RestoredProcess>;
}

/// Bind-mounts the rootfs onto itself and pivots into it.
///
/// Without a private mount namespace nothing is mounted; the companion
/// then runs in the host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct PivotRootfs;

impl RootfsSetup for PivotRootfs {
    fn prepare_rootfs(&self, channel: &mut SyncChannel, config: &InitConfig) -> Result<()> {
        if config.new_mount_ns {
            filesystem::set_propagation(Path::new("/"), config.rootfs_propagation)?;
            filesystem::bind_mount(&config.rootfs, &config.rootfs, false)?;
            if config.new_pid_ns {
                filesystem::mount_proc(&config.rootfs)?;
            }
        }
        if config.has_prestart_hooks {
            channel.handshake(SyncType::Hooks, SyncType::Resume)?;
        }
        if config.new_mount_ns {
            filesystem::pivot_root(&config.rootfs)?;
        }
        Ok(())
    }

    fn finalize_rootfs(&self, config: &InitConfig) -> Result<()> {
        if config.readonly && config.new_mount_ns {
            filesystem::remount_readonly(Path::new("/"))?;
        }
        Ok(())
    }
}

/// Applies capabilities and LSM labels through procfs and `capset(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSecurity;

const APPARMOR_EXEC_ATTR: &str = "/proc/self/attr/apparmor/exec";
const LSM_EXEC_ATTR: &str = "/proc/self/attr/exec";

fn write_attr(path: &str, value: &str) -> std::result::Result<(), BerthError> {
    std::fs::write(path, value).map_err(|e| BerthError::io(path, e))
}

impl SecurityApply for HostSecurity {
    fn apply_capabilities(&self, keep: &[Capability]) -> Result<()> {
        capability::drop_bounding_set(keep)?;
        capability::set_capabilities(keep)?;
        Ok(())
    }

    fn init_seccomp(&self, _config: &InitConfig) -> Result<Option<OwnedFd>> {
        Ok(None)
    }

    fn apply_apparmor(&self, profile: &str) -> Result<()> {
        let request = format!("exec {profile}");
        let target = if Path::new(APPARMOR_EXEC_ATTR).exists() {
            APPARMOR_EXEC_ATTR
        } else {
            LSM_EXEC_ATTR
        };
        write_attr(target, &request)
            .map_err(|e| RuntimeError::external(format!("apparmor profile {profile}"), e))
    }

    fn apply_selinux_label(&self, label: &str) -> Result<()> {
        write_attr(LSM_EXEC_ATTR, label)
            .map_err(|e| RuntimeError::external(format!("selinux label {label}"), e))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use berth_common::types::ContainerId;

    use super::*;
    use crate::config::{ContainerConfig, Process};

    fn init_config(prestart: bool) -> InitConfig {
        let config = ContainerConfig {
            rootfs: PathBuf::from("/"),
            ..ContainerConfig::default()
        };
        let id = ContainerId::new("rootfs").expect("id");
        let mut init = InitConfig::new(&id, &config, &Process::init(vec!["true".into()]));
        init.has_prestart_hooks = prestart;
        init
    }

    #[test]
    fn host_rootfs_without_mount_namespace_is_a_no_op() {
        let (mut ours, _theirs) = SyncChannel::pair().expect("pair");
        let config = init_config(false);
        PivotRootfs.prepare_rootfs(&mut ours, &config).expect("prepare");
        PivotRootfs.finalize_rootfs(&config).expect("finalize");
    }

    #[test]
    fn prestart_hooks_pause_rootfs_setup() {
        let (mut ours, mut theirs) = SyncChannel::pair().expect("pair");
        let parent = thread::spawn(move || {
            let _ = theirs.expect(SyncType::Hooks).expect("hooks request");
            theirs.send(SyncType::Resume).expect("resume");
        });
        PivotRootfs
            .prepare_rootfs(&mut ours, &init_config(true))
            .expect("prepare");
        parent.join().expect("join");
    }

    #[test]
    fn default_security_has_no_seccomp_listener() {
        let listener = HostSecurity.init_seccomp(&init_config(false)).expect("seccomp");
        assert!(listener.is_none());
    }
}
