//! Global configuration model for the berth runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the berth runtime.
///
/// One value of this type is shared by every container managed from the
/// same root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding one state directory per container.
    pub root: PathBuf,
    /// Mount point of the cgroup v2 unified hierarchy.
    pub cgroup_root: PathBuf,
    /// Parent cgroup, relative to `cgroup_root`.
    pub cgroup_parent: String,
    /// Executable used to start the companion. When unset, the running
    /// executable is used.
    pub init_binary: Option<PathBuf>,
    /// Execute the companion from a sealed in-memory copy of the binary so
    /// that overwriting the file on disk cannot affect a running container.
    pub clone_binary: bool,
    /// Log filter forwarded to the companion (`RUST_LOG` syntax).
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(constants::DEFAULT_ROOT),
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            cgroup_parent: constants::DEFAULT_CGROUP_PARENT.to_string(),
            init_binary: None,
            clone_binary: true,
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration rooted at `root` with every other value
    /// defaulted.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}
