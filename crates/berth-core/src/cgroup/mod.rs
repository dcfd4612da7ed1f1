//! Cgroups v2 resource management.
//!
//! [`CgroupHandle`] is the contract the runtime consumes: placing processes,
//! applying limits, freezing, and enumerating members. [`CgroupManager`] is
//! the default implementation over the unified hierarchy at
//! `/sys/fs/cgroup`.

pub mod cpu;
pub mod freezer;
pub mod io;
pub mod memory;
pub mod pids;

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::{FreezerState, ResourceLimits};

/// Controllers delegated to container cgroups.
const CONTROLLERS: &str = "+cpu +memory +io +pids";

/// Handle to the cgroup of one container.
pub trait CgroupHandle: Send + Sync + Debug {
    /// Places `pid` (and its future descendants) into the cgroup, creating
    /// it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup cannot be created or joined.
    fn apply(&self, pid: i32) -> Result<()>;

    /// Applies `limits`. Limits that are unset are reset to the kernel
    /// default, so applying a previous value fully restores it.
    ///
    /// # Errors
    ///
    /// Returns an error if a control file cannot be written.
    fn set(&self, limits: &ResourceLimits) -> Result<()>;

    /// Freezes or thaws every process in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer cannot be driven to `state`.
    fn freeze(&self, state: FreezerState) -> Result<()>;

    /// Reports the current freezer state. A missing cgroup is thawed.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer file exists but cannot be read.
    fn freezer_state(&self) -> Result<FreezerState>;

    /// Lists every pid in the cgroup and its descendants.
    ///
    /// # Errors
    ///
    /// Returns an error if a `cgroup.procs` file cannot be read.
    fn get_all_pids(&self) -> Result<Vec<i32>>;

    /// Path of the cgroup for `subsystem`. On the unified hierarchy every
    /// subsystem shares one path.
    fn path(&self, subsystem: &str) -> PathBuf;

    /// Returns `true` if the cgroup exists.
    fn exists(&self) -> bool;

    /// Removes the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be removed.
    fn destroy(&self) -> Result<()>;
}

/// Handle to a cgroup v2 directory for a specific container.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    /// Mount point of the unified hierarchy.
    root: PathBuf,
    /// Path to this container's cgroup directory.
    path: PathBuf,
}

impl CgroupManager {
    /// Creates a handle for `<root>/<parent>/<container_id>`.
    ///
    /// Nothing is created on disk until [`CgroupHandle::apply`] is called.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, parent: &str, container_id: &str) -> Self {
        let root = root.into();
        let path = root.join(parent.trim_start_matches('/')).join(container_id);
        Self { root, path }
    }

    /// Creates a handle for an existing cgroup path.
    #[must_use]
    pub fn from_path(root: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path: path.into(),
        }
    }

    /// Creates the cgroup directory and delegates controllers to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path).map_err(|e| BerthError::io(&self.path, e))?;
        self.enable_controllers();
        tracing::debug!(path = %self.path.display(), "cgroup created");
        Ok(())
    }

    /// Enables the container controllers in every ancestor's
    /// `cgroup.subtree_control`.
    ///
    /// Failures are logged only: a controller the host does not delegate
    /// surfaces later as a write error on the limit that needs it.
    fn enable_controllers(&self) {
        let Ok(relative) = self.path.strip_prefix(&self.root) else {
            return;
        };
        let mut current = self.root.clone();
        for component in relative.parent().into_iter().flat_map(Path::components) {
            current.push(component);
            let control = current.join("cgroup.subtree_control");
            if !control.exists() {
                continue;
            }
            if let Err(e) = std::fs::write(&control, CONTROLLERS) {
                tracing::debug!(path = %control.display(), error = %e, "could not enable controllers");
            }
        }
    }
}

impl CgroupHandle for CgroupManager {
    fn apply(&self, pid: i32) -> Result<()> {
        self.create()?;
        write_control(&self.path, "cgroup.procs", &pid.to_string())?;
        tracing::debug!(pid, path = %self.path.display(), "added process to cgroup");
        Ok(())
    }

    fn set(&self, limits: &ResourceLimits) -> Result<()> {
        memory::set_memory_max(&self.path, limits.memory_bytes)?;
        cpu::set_cpu_weight(&self.path, limits.cpu_weight)?;
        cpu::set_cpu_max(&self.path, limits.cpu_quota_us, limits.cpu_period_us)?;
        io::set_io_weight(&self.path, limits.io_weight)?;
        pids::set_pids_max(&self.path, limits.pids_max)?;
        tracing::info!(path = %self.path.display(), ?limits, "cgroup limits applied");
        Ok(())
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        freezer::set_state(&self.path, state)
    }

    fn freezer_state(&self) -> Result<FreezerState> {
        freezer::state(&self.path)
    }

    fn get_all_pids(&self) -> Result<Vec<i32>> {
        let mut pids = Vec::new();
        collect_pids(&self.path, &mut pids)?;
        Ok(pids)
    }

    fn path(&self, _subsystem: &str) -> PathBuf {
        self.path.clone()
    }

    fn exists(&self) -> bool {
        self.path.is_dir()
    }

    fn destroy(&self) -> Result<()> {
        if self.path.exists() {
            remove_cgroup_dir(&self.path)?;
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }
}

/// Writes `value` to the control file `name` inside `cgroup_path`.
///
/// # Errors
///
/// Returns an error if the control file cannot be written.
pub fn write_control(cgroup_path: &Path, name: &str, value: &str) -> Result<()> {
    let file = cgroup_path.join(name);
    std::fs::write(&file, value).map_err(|e| BerthError::io(file, e))
}

/// Writes `value` to `name` only when the control file exists.
///
/// Used to reset limits to their defaults without failing on controllers
/// that are not enabled for this cgroup.
pub(crate) fn reset_control(cgroup_path: &Path, name: &str, value: &str) -> Result<()> {
    if cgroup_path.join(name).exists() {
        write_control(cgroup_path, name, value)?;
    }
    Ok(())
}

fn collect_pids(dir: &Path, pids: &mut Vec<i32>) -> Result<()> {
    let procs = dir.join("cgroup.procs");
    match std::fs::read_to_string(&procs) {
        Ok(content) => pids.extend(content.lines().filter_map(|l| l.trim().parse::<i32>().ok())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(BerthError::io(procs, e)),
    }
    let entries = std::fs::read_dir(dir).map_err(|e| BerthError::io(dir, e))?;
    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            collect_pids(&entry.path(), pids)?;
        }
    }
    Ok(())
}

/// Cgroup directories can only be removed with `rmdir(2)`, leaves first.
fn remove_cgroup_dir(dir: &Path) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| BerthError::io(dir, e))?;
    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            remove_cgroup_dir(&entry.path())?;
        }
    }
    match std::fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BerthError::io(dir, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_path_nests_parent_and_id() {
        let mgr = CgroupManager::new("/sys/fs/cgroup", "/berth", "web");
        assert_eq!(mgr.path("memory"), PathBuf::from("/sys/fs/cgroup/berth/web"));
        assert_eq!(mgr.path(""), mgr.path("cpu"));
    }

    #[test]
    fn pids_are_collected_from_descendants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = CgroupManager::new(dir.path(), "berth", "c1");
        mgr.create().expect("create");
        let cg = mgr.path("");
        std::fs::write(cg.join("cgroup.procs"), "10\n11\n").expect("write");
        std::fs::create_dir(cg.join("child")).expect("mkdir");
        std::fs::write(cg.join("child").join("cgroup.procs"), "12\n").expect("write");

        let mut pids = mgr.get_all_pids().expect("pids");
        pids.sort_unstable();
        assert_eq!(pids, vec![10, 11, 12]);
    }

    #[test]
    fn missing_cgroup_has_no_pids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = CgroupManager::new(dir.path(), "berth", "absent");
        assert!(!mgr.exists());
        assert!(mgr.get_all_pids().expect("pids").is_empty());
    }

    #[test]
    fn set_writes_limits_and_resets_unset_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = CgroupManager::new(dir.path(), "berth", "c2");
        mgr.create().expect("create");
        let cg = mgr.path("");
        std::fs::write(cg.join("pids.max"), "5").expect("seed pids.max");

        let limits = ResourceLimits {
            memory_bytes: Some(64 * 1024 * 1024),
            cpu_weight: Some(200),
            ..ResourceLimits::default()
        };
        mgr.set(&limits).expect("set");

        let read = |name: &str| std::fs::read_to_string(cg.join(name)).expect("read");
        assert_eq!(read("memory.max"), "67108864");
        assert_eq!(read("cpu.weight"), "200");
        assert_eq!(read("pids.max"), "max");
        assert!(!cg.join("io.weight").exists());
    }

    #[test]
    fn destroy_removes_nested_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = CgroupManager::new(dir.path(), "berth", "c3");
        let cg = mgr.path("");
        std::fs::create_dir_all(cg.join("a").join("b")).expect("mkdir");
        mgr.destroy().expect("destroy");
        assert!(!mgr.exists());
    }
}
