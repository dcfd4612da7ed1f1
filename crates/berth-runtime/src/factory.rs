//! Creating, loading, and listing containers under a root directory.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;

use berth_common::config::RuntimeConfig;
use berth_common::constants::STATE_DIR_MODE;
use berth_common::error::BerthError;
use berth_common::types::ContainerId;
use berth_core::cgroup::{CgroupHandle, CgroupManager};

use crate::config::ContainerConfig;
use crate::container::Container;
use crate::error::Result;
use crate::state;

/// Entry point for container management.
#[derive(Debug, Clone)]
pub struct Factory {
    config: RuntimeConfig,
}

impl Factory {
    /// Opens the root directory in `config`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        DirBuilder::new()
            .recursive(true)
            .mode(STATE_DIR_MODE)
            .create(&config.root)
            .map_err(|e| BerthError::io(&config.root, e))?;
        Ok(Self { config })
    }

    /// The runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn state_dir(&self, id: &ContainerId) -> PathBuf {
        self.config.root.join(id.as_str())
    }

    /// Creates a container with a cgroup under the configured parent.
    ///
    /// # Errors
    ///
    /// See [`Self::create_with_cgroup`].
    pub fn create(&self, id: &ContainerId, config: ContainerConfig) -> Result<Container> {
        let cgroup = CgroupManager::new(&self.config.cgroup_root, &self.config.cgroup_parent, id.as_str());
        self.create_with_cgroup(id, config, Arc::new(cgroup))
    }

    /// Creates a container using `cgroup`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid `config`, an
    /// already-exists error if the id is taken, or an I/O error.
    pub fn create_with_cgroup(
        &self,
        id: &ContainerId,
        config: ContainerConfig,
        cgroup: Arc<dyn CgroupHandle>,
    ) -> Result<Container> {
        config.validate()?;
        let dir = self.state_dir(id);
        if dir.exists() {
            return Err(BerthError::AlreadyExists {
                kind: "container",
                id: id.to_string(),
            }
            .into());
        }
        DirBuilder::new()
            .mode(STATE_DIR_MODE)
            .create(&dir)
            .map_err(|e| BerthError::io(&dir, e))?;
        let container = Container::new(id.clone(), dir, self.config.clone(), config, cgroup);
        container.persist()?;
        tracing::info!(id = %id, "container registered");
        Ok(container)
    }

    /// Loads a container from its state file, reattaching to its cgroup.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown id, or the load error.
    pub fn load(&self, id: &ContainerId) -> Result<Container> {
        let dir = self.state_dir(id);
        let saved = load_state(&dir, id)?;
        let cgroup = CgroupManager::from_path(&self.config.cgroup_root, saved.cgroup_path.clone());
        Ok(Container::from_state(saved, dir, self.config.clone(), Arc::new(cgroup)))
    }

    /// Loads a container using `cgroup` instead of the recorded one.
    ///
    /// # Errors
    ///
    /// See [`Self::load`].
    pub fn load_with_cgroup(&self, id: &ContainerId, cgroup: Arc<dyn CgroupHandle>) -> Result<Container> {
        let dir = self.state_dir(id);
        let saved = load_state(&dir, id)?;
        Ok(Container::from_state(saved, dir, self.config.clone(), cgroup))
    }

    /// Ids of every container with a state file, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerId>> {
        let root = &self.config.root;
        let entries = std::fs::read_dir(root).map_err(|e| BerthError::io(root, e))?;
        let mut ids: Vec<ContainerId> = entries
            .flatten()
            .filter(|entry| state::state_path(&entry.path()).is_file())
            .filter_map(|entry| ContainerId::new(entry.file_name().to_string_lossy()).ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn load_state(dir: &std::path::Path, id: &ContainerId) -> Result<state::State> {
    state::load(dir).map_err(|e| {
        if e.is_not_found() {
            BerthError::NotFound {
                kind: "container",
                id: id.to_string(),
            }
            .into()
        } else {
            e
        }
    })
}

#[cfg(test)]
mod tests {
    use berth_common::types::ContainerStatus;

    use super::*;
    use crate::error::RuntimeError;
    use crate::testing::FakeCgroup;

    fn factory() -> (tempfile::TempDir, Factory) {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = Factory::new(RuntimeConfig::with_root(dir.path().join("root"))).expect("factory");
        (dir, factory)
    }

    fn config() -> ContainerConfig {
        ContainerConfig {
            rootfs: PathBuf::from("/"),
            ..ContainerConfig::default()
        }
    }

    #[test]
    fn created_container_is_persisted_and_listed() {
        let (_dir, factory) = factory();
        let id = ContainerId::new("web").expect("id");
        let container = factory
            .create_with_cgroup(&id, config(), Arc::new(FakeCgroup::default()))
            .expect("create");
        assert_eq!(container.status().expect("status"), ContainerStatus::Stopped);
        assert_eq!(factory.list().expect("list"), vec![id.clone()]);

        let loaded = factory
            .load_with_cgroup(&id, Arc::new(FakeCgroup::default()))
            .expect("load");
        assert_eq!(loaded.config(), container.config());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let (_dir, factory) = factory();
        let id = ContainerId::new("dup").expect("id");
        let _ = factory
            .create_with_cgroup(&id, config(), Arc::new(FakeCgroup::default()))
            .expect("first");
        let err = factory
            .create_with_cgroup(&id, config(), Arc::new(FakeCgroup::default()))
            .expect_err("second");
        assert!(matches!(
            err,
            RuntimeError::Common(BerthError::AlreadyExists { kind: "container", .. })
        ));
    }

    #[test]
    fn invalid_config_creates_nothing() {
        let (_dir, factory) = factory();
        let id = ContainerId::new("bad").expect("id");
        let bad = ContainerConfig {
            rootfs: PathBuf::from("relative"),
            ..ContainerConfig::default()
        };
        assert!(matches!(
            factory.create_with_cgroup(&id, bad, Arc::new(FakeCgroup::default())),
            Err(RuntimeError::Configuration(_))
        ));
        assert!(factory.list().expect("list").is_empty());
    }

    #[test]
    fn unknown_container_is_not_found() {
        let (_dir, factory) = factory();
        let err = factory
            .load(&ContainerId::new("ghost").expect("id"))
            .expect_err("missing");
        assert!(err.is_not_found());
    }
}
