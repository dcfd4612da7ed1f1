//! Persistent container state.
//!
//! Each container owns `<root>/<id>/state.json`. The file is replaced
//! atomically (temp file in the same directory, then rename) so concurrent
//! readers in other processes never observe a partial write.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use berth_common::constants::{OCI_VERSION, STATE_FILENAME};
use berth_common::error::BerthError;
use berth_common::types::{ContainerId, ContainerStatus};
use berth_core::namespace::NamespaceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;
use crate::error::Result;

/// Serializable snapshot of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Version of the state format.
    pub oci_version: String,
    /// Container id.
    pub id: ContainerId,
    /// Lifecycle status at the time of the snapshot.
    pub status: ContainerStatus,
    /// Pid of the init process, if one was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Start-time fingerprint of the init process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_start_time: Option<u64>,
    /// Root filesystem.
    pub rootfs: PathBuf,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Cgroup directory.
    pub cgroup_path: PathBuf,
    /// Namespace paths of the live init process, used to join it.
    #[serde(default)]
    pub namespace_paths: BTreeMap<NamespaceType, PathBuf>,
    /// Full container configuration.
    pub config: ContainerConfig,
}

impl State {
    /// Builds a fresh snapshot for a container that has no process yet.
    #[must_use]
    pub fn new(id: ContainerId, config: ContainerConfig, cgroup_path: PathBuf) -> Self {
        Self {
            oci_version: OCI_VERSION.to_string(),
            id,
            status: ContainerStatus::Stopped,
            pid: None,
            init_start_time: None,
            rootfs: config.rootfs.clone(),
            created: Utc::now(),
            cgroup_path,
            namespace_paths: BTreeMap::new(),
            config,
        }
    }
}

/// Returns the state file path inside `state_dir`.
#[must_use]
pub fn state_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATE_FILENAME)
}

/// Atomically writes `state` to `<state_dir>/state.json`.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed.
pub fn save(state_dir: &Path, state: &State) -> Result<()> {
    let path = state_path(state_dir);
    let mut tmp =
        tempfile::NamedTempFile::new_in(state_dir).map_err(|e| BerthError::io(state_dir, e))?;
    serde_json::to_writer(&mut tmp, state)?;
    tmp.as_file_mut()
        .flush()
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| BerthError::io(tmp.path(), e))?;
    let _ = tmp
        .persist(&path)
        .map_err(|e| BerthError::io(&path, e.error))?;
    tracing::debug!(id = %state.id, status = %state.status, "state saved");
    Ok(())
}

/// Loads the state in `state_dir`.
///
/// # Errors
///
/// Returns a not-found error if there is no state file, or an I/O or
/// parse error.
pub fn load(state_dir: &Path) -> Result<State> {
    let path = state_path(state_dir);
    let data = std::fs::read(&path).map_err(|e| BerthError::io(&path, e))?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_state;

    #[test]
    fn save_then_load_is_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = sample_state(dir.path());
        state.pid = Some(4242);
        state.init_start_time = Some(99);
        state.status = ContainerStatus::Created;
        let _ = state
            .namespace_paths
            .insert(NamespaceType::Pid, PathBuf::from("/proc/4242/ns/pid"));

        save(dir.path(), &state).expect("save");
        let loaded = load(dir.path()).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn save_replaces_previous_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = sample_state(dir.path());
        save(dir.path(), &state).expect("first save");
        state.status = ContainerStatus::Running;
        save(dir.path(), &state).expect("second save");

        assert_eq!(load(dir.path()).expect("load").status, ContainerStatus::Running);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("readdir")
            .flatten()
            .filter(|e| e.file_name() != STATE_FILENAME)
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn missing_state_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load(dir.path()).expect_err("no state");
        assert!(err.is_not_found());
    }
}
