//! Container and process configuration.
//!
//! [`ContainerConfig`] is what a caller hands to the factory;
//! [`InitConfig`] is the subset the companion needs, sent to it as JSON once
//! the namespaces are in place.

use std::collections::BTreeMap;
use std::path::PathBuf;

use berth_common::types::{ContainerId, ResourceLimits};
use berth_core::capability::Capability;
use berth_core::filesystem::Propagation;
use berth_core::namespace::time::TimeOffset;
use berth_core::namespace::user::IdMap;
use berth_core::namespace::{Namespace, NamespaceType};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::hooks::Hooks;

/// Static configuration of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Absolute path of the root filesystem.
    pub rootfs: PathBuf,
    /// Remount the root filesystem read-only after setup.
    pub readonly: bool,
    /// Propagation applied to `/` before the rootfs is prepared.
    pub rootfs_propagation: Propagation,
    /// Hostname; requires a private UTS namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Namespaces to create or join.
    pub namespaces: Vec<Namespace>,
    /// Uid mappings for a new user namespace.
    pub uid_mappings: Vec<IdMap>,
    /// Gid mappings for a new user namespace.
    pub gid_mappings: Vec<IdMap>,
    /// Running without root on the host.
    pub rootless: bool,
    /// OOM score adjustment for the container processes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
    /// Time namespace offsets keyed by clock name.
    pub time_offsets: BTreeMap<String, TimeOffset>,
    /// Cgroup resource limits.
    pub resources: ResourceLimits,
    /// Capabilities to keep; `None` leaves them untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<Capability>>,
    /// Set `PR_SET_NO_NEW_PRIVS` before exec.
    pub no_new_privileges: bool,
    /// AppArmor profile applied on exec.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparmor_profile: Option<String>,
    /// SELinux label applied on exec.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_label: Option<String>,
    /// Unix socket of the agent that takes the seccomp notify descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp_listener: Option<PathBuf>,
    /// Lifecycle hooks.
    pub hooks: Hooks,
}

impl ContainerConfig {
    /// Returns the namespace entry of type `ty`, if configured.
    #[must_use]
    pub fn namespace(&self, ty: NamespaceType) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.ty == ty)
    }

    /// Returns `true` if a namespace of type `ty` is created (not joined).
    #[must_use]
    pub fn creates_namespace(&self, ty: NamespaceType) -> bool {
        self.namespace(ty).is_some_and(|ns| ns.path.is_none())
    }

    /// Checks the configuration for combinations the kernel or the
    /// bootstrap cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Configuration`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RuntimeError::Configuration(msg));

        if !self.rootfs.is_absolute() {
            return invalid(format!("rootfs {} is not an absolute path", self.rootfs.display()));
        }

        let mut seen = Vec::new();
        for ns in &self.namespaces {
            if seen.contains(&ns.ty) {
                return invalid(format!("duplicate {} namespace", ns.ty));
            }
            seen.push(ns.ty);
            if let Some(path) = &ns.path {
                if path.to_string_lossy().contains(',') {
                    return invalid(format!("namespace path {} contains a comma", path.display()));
                }
            }
        }

        let user_ns = self.namespace(NamespaceType::User);
        let has_mappings = !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty();
        match user_ns {
            None if has_mappings => {
                return invalid("user mappings require a user namespace".into());
            }
            Some(ns) if ns.path.is_none() && (self.uid_mappings.is_empty() || self.gid_mappings.is_empty()) => {
                return invalid("a new user namespace needs both uid and gid mappings".into());
            }
            _ => {}
        }
        if self.rootless && user_ns.is_none() {
            return invalid("rootless containers need a user namespace".into());
        }

        if self.hostname.is_some() && !self.creates_namespace(NamespaceType::Uts) {
            return invalid("setting a hostname requires a private UTS namespace".into());
        }
        if !self.time_offsets.is_empty() && !self.creates_namespace(NamespaceType::Time) {
            return invalid("time offsets require a new time namespace".into());
        }
        if let Some(listener) = &self.seccomp_listener {
            if !listener.is_absolute() {
                return invalid(format!("seccomp listener {} is not an absolute path", listener.display()));
            }
        }

        self.resources
            .validate()
            .map_err(|e| RuntimeError::Configuration(e.to_string()))
    }
}

/// Credentials the user program runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    /// User id inside the container.
    pub uid: u32,
    /// Group id inside the container.
    pub gid: u32,
    /// Supplementary groups.
    pub additional_gids: Vec<u32>,
}

/// A process to run in a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Program and arguments; `args[0]` is looked up on `PATH`.
    pub args: Vec<String>,
    /// Environment as `KEY=value` strings.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory inside the container.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// Credentials.
    #[serde(default)]
    pub user: User,
    /// `true` for the container's first process.
    #[serde(default)]
    pub init: bool,
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

impl Process {
    /// An init process running `args` with a minimal `PATH`.
    #[must_use]
    pub fn init(args: Vec<String>) -> Self {
        Self {
            args,
            env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into()],
            cwd: default_cwd(),
            user: User::default(),
            init: true,
        }
    }

    /// Checks that the process can be started.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Configuration`] for empty arguments or a
    /// relative working directory.
    pub fn validate(&self) -> Result<()> {
        if self.args.is_empty() || self.args[0].is_empty() {
            return Err(RuntimeError::Configuration("process args must not be empty".into()));
        }
        if !self.cwd.is_absolute() {
            return Err(RuntimeError::Configuration(format!(
                "process cwd {} is not absolute",
                self.cwd.display()
            )));
        }
        Ok(())
    }
}

/// Which companion flavour to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitKind {
    /// First process: prepares the rootfs and waits on the exec gate.
    Standard,
    /// Additional process joining a live container.
    Setns,
}

/// Configuration sent to the companion after bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    /// Container id.
    pub id: ContainerId,
    /// Companion flavour.
    pub kind: InitKind,
    /// The user program.
    pub process: Process,
    /// Hostname to set.
    pub hostname: Option<String>,
    /// Root filesystem.
    pub rootfs: PathBuf,
    /// Remount the rootfs read-only.
    pub readonly: bool,
    /// Propagation for `/`.
    pub rootfs_propagation: Propagation,
    /// The companion is in a new mount namespace.
    pub new_mount_ns: bool,
    /// The companion is pid 1 of a new pid namespace.
    pub new_pid_ns: bool,
    /// Capabilities to keep.
    pub capabilities: Option<Vec<Capability>>,
    /// Set `PR_SET_NO_NEW_PRIVS`.
    pub no_new_privileges: bool,
    /// AppArmor profile.
    pub apparmor_profile: Option<String>,
    /// SELinux label.
    pub process_label: Option<String>,
    /// Ask the parent to run prestart hooks during rootfs setup.
    pub has_prestart_hooks: bool,
    /// Block on the exec gate before running the program.
    pub use_exec_gate: bool,
}

impl InitConfig {
    /// Builds the companion configuration for `process` in a container
    /// configured by `config`.
    #[must_use]
    pub fn new(id: &ContainerId, config: &ContainerConfig, process: &Process) -> Self {
        let kind = if process.init {
            InitKind::Standard
        } else {
            InitKind::Setns
        };
        Self {
            id: id.clone(),
            kind,
            process: process.clone(),
            hostname: config.hostname.clone(),
            rootfs: config.rootfs.clone(),
            readonly: config.readonly,
            rootfs_propagation: config.rootfs_propagation,
            new_mount_ns: config.creates_namespace(NamespaceType::Mount),
            new_pid_ns: config.creates_namespace(NamespaceType::Pid),
            capabilities: config.capabilities.clone(),
            no_new_privileges: config.no_new_privileges,
            apparmor_profile: config.apparmor_profile.clone(),
            process_label: config.process_label.clone(),
            has_prestart_hooks: process.init && !config.hooks.prestart.is_empty(),
            use_exec_gate: process.init,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ContainerConfig {
        ContainerConfig {
            rootfs: PathBuf::from("/var/lib/berth/rootfs"),
            ..ContainerConfig::default()
        }
    }

    #[test]
    fn minimal_config_is_valid() {
        base().validate().expect("valid");
    }

    #[test]
    fn relative_rootfs_is_rejected() {
        let cfg = ContainerConfig {
            rootfs: PathBuf::from("rootfs"),
            ..base()
        };
        assert!(matches!(cfg.validate(), Err(RuntimeError::Configuration(_))));
    }

    #[test]
    fn mappings_without_user_namespace_are_rejected() {
        let cfg = ContainerConfig {
            uid_mappings: vec![IdMap::new(0, 1000, 1)],
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn new_user_namespace_needs_mappings() {
        let mut cfg = base();
        cfg.namespaces.push(Namespace::new(NamespaceType::User));
        assert!(cfg.validate().is_err());

        cfg.uid_mappings.push(IdMap::new(0, 1000, 1));
        cfg.gid_mappings.push(IdMap::new(0, 1000, 1));
        cfg.validate().expect("mapped user namespace is valid");
    }

    #[test]
    fn joined_user_namespace_needs_no_mappings() {
        let mut cfg = base();
        cfg.namespaces.push(Namespace::join(NamespaceType::User, "/proc/1/ns/user"));
        cfg.validate().expect("joined user namespace is valid");
    }

    #[test]
    fn hostname_requires_private_uts() {
        let mut cfg = ContainerConfig {
            hostname: Some("box".into()),
            ..base()
        };
        assert!(cfg.validate().is_err());
        cfg.namespaces.push(Namespace::join(NamespaceType::Uts, "/proc/1/ns/uts"));
        assert!(cfg.validate().is_err());
        cfg.namespaces = vec![Namespace::new(NamespaceType::Uts)];
        cfg.validate().expect("hostname with new uts namespace");
    }

    #[test]
    fn time_offsets_require_time_namespace() {
        let mut cfg = base();
        let _ = cfg.time_offsets.insert("monotonic".into(), TimeOffset::default());
        assert!(cfg.validate().is_err());
        cfg.namespaces.push(Namespace::new(NamespaceType::Time));
        cfg.validate().expect("valid");
    }

    #[test]
    fn seccomp_listener_must_be_absolute() {
        let mut cfg = base();
        cfg.seccomp_listener = Some(PathBuf::from("agent.sock"));
        assert!(matches!(cfg.validate(), Err(RuntimeError::Configuration(_))));
        cfg.seccomp_listener = Some(PathBuf::from("/run/agent.sock"));
        cfg.validate().expect("absolute listener");
    }

    #[test]
    fn duplicate_namespaces_are_rejected() {
        let cfg = ContainerConfig {
            namespaces: vec![
                Namespace::new(NamespaceType::Pid),
                Namespace::new(NamespaceType::Pid),
            ],
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rootless_requires_user_namespace() {
        let cfg = ContainerConfig {
            rootless: true,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_resources_surface_as_configuration_errors() {
        let mut cfg = base();
        cfg.resources.pids_max = Some(0);
        assert!(matches!(cfg.validate(), Err(RuntimeError::Configuration(_))));
    }

    #[test]
    fn empty_process_is_rejected() {
        let p = Process::init(Vec::new());
        assert!(p.validate().is_err());
        Process::init(vec!["sh".into()]).validate().expect("valid");
    }

    #[test]
    fn init_config_tracks_process_kind() {
        let id = ContainerId::new("c").expect("id");
        let mut cfg = base();
        cfg.namespaces.push(Namespace::new(NamespaceType::Pid));
        let mut process = Process::init(vec!["sh".into()]);
        let init = InitConfig::new(&id, &cfg, &process);
        assert_eq!(init.kind, InitKind::Standard);
        assert!(init.use_exec_gate);
        assert!(init.new_pid_ns);
        assert!(!init.new_mount_ns);

        process.init = false;
        let tenant = InitConfig::new(&id, &cfg, &process);
        assert_eq!(tenant.kind, InitKind::Setns);
        assert!(!tenant.use_exec_gate);
    }

    #[test]
    fn config_parses_from_sparse_json() {
        let json = r#"{"rootfs":"/rootfs","namespaces":[{"type":"pid"},{"type":"mount"}],
                       "resources":{"memory_bytes":67108864}}"#;
        let cfg: ContainerConfig = serde_json::from_str(json).expect("parse");
        assert!(cfg.creates_namespace(NamespaceType::Pid));
        assert_eq!(cfg.resources.memory_bytes, Some(64 * 1024 * 1024));
        cfg.validate().expect("valid");
    }
}
