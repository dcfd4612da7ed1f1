//! Test doubles shared by the unit tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, FreezerState, ResourceLimits};
use berth_core::cgroup::CgroupHandle;

use crate::config::ContainerConfig;
use crate::state::State;

/// In-memory cgroup recording what the runtime asked of it.
#[derive(Debug, Default)]
pub struct FakeCgroup {
    pub pids: Mutex<Vec<i32>>,
    pub freezer: Mutex<Option<FreezerState>>,
    pub limits: Mutex<Vec<ResourceLimits>>,
    pub freeze_calls: Mutex<Vec<FreezerState>>,
    /// `set` fails for limits whose memory equals this value.
    pub fail_memory: Option<u64>,
    pub destroyed: Mutex<bool>,
}

impl CgroupHandle for FakeCgroup {
    fn apply(&self, pid: i32) -> Result<()> {
        self.pids.lock().expect("lock").push(pid);
        Ok(())
    }

    fn set(&self, limits: &ResourceLimits) -> Result<()> {
        self.limits.lock().expect("lock").push(limits.clone());
        if self.fail_memory.is_some() && limits.memory_bytes == self.fail_memory {
            return Err(BerthError::config("memory.max rejected"));
        }
        Ok(())
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        self.freeze_calls.lock().expect("lock").push(state);
        *self.freezer.lock().expect("lock") = Some(state);
        Ok(())
    }

    fn freezer_state(&self) -> Result<FreezerState> {
        Ok(self
            .freezer
            .lock()
            .expect("lock")
            .unwrap_or(FreezerState::Thawed))
    }

    fn get_all_pids(&self) -> Result<Vec<i32>> {
        Ok(self.pids.lock().expect("lock").clone())
    }

    fn path(&self, _subsystem: &str) -> PathBuf {
        PathBuf::from("/fake/cgroup")
    }

    fn exists(&self) -> bool {
        !*self.destroyed.lock().expect("lock")
    }

    fn destroy(&self) -> Result<()> {
        *self.destroyed.lock().expect("lock") = true;
        Ok(())
    }
}

/// A plausible state snapshot rooted at `dir`.
pub fn sample_state(dir: &Path) -> State {
    let config = ContainerConfig {
        rootfs: dir.to_path_buf(),
        ..ContainerConfig::default()
    };
    State::new(
        ContainerId::new("sample").expect("id"),
        config,
        PathBuf::from("/fake/cgroup"),
    )
}

/// Spawns `sleep 30` as a child of the test process.
pub fn spawn_sleeper() -> std::process::Child {
    std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep")
}
