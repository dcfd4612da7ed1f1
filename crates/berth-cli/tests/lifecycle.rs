//! Lifecycle scenarios driven through the runtime library with the
//! `berth` binary as the companion image.
//!
//! The containers use the host root and no new namespaces, and a cgroup
//! double stands in for the real hierarchy, so the tests run without
//! privileges.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use berth_common::config::RuntimeConfig;
use berth_common::error::Result as CommonResult;
use berth_common::types::{ContainerId, ContainerStatus, FreezerState, ResourceLimits};
use berth_core::cgroup::CgroupHandle;
use berth_runtime::config::{ContainerConfig, Process, User};
use berth_runtime::container::Container;
use berth_runtime::error::RuntimeError;
use berth_runtime::factory::Factory;
use berth_runtime::process::{ContainerProcess, ExitState};

#[derive(Debug, Default)]
struct MemoryCgroup {
    pids: Mutex<Vec<i32>>,
    freezer: Mutex<Option<FreezerState>>,
}

impl CgroupHandle for MemoryCgroup {
    fn apply(&self, pid: i32) -> CommonResult<()> {
        self.pids.lock().unwrap().push(pid);
        Ok(())
    }

    fn set(&self, _limits: &ResourceLimits) -> CommonResult<()> {
        Ok(())
    }

    fn freeze(&self, state: FreezerState) -> CommonResult<()> {
        *self.freezer.lock().unwrap() = Some(state);
        Ok(())
    }

    fn freezer_state(&self) -> CommonResult<FreezerState> {
        Ok(self.freezer.lock().unwrap().unwrap_or(FreezerState::Thawed))
    }

    fn get_all_pids(&self) -> CommonResult<Vec<i32>> {
        Ok(self.pids.lock().unwrap().clone())
    }

    fn path(&self, _subsystem: &str) -> PathBuf {
        PathBuf::from("/memory")
    }

    fn exists(&self) -> bool {
        true
    }

    fn destroy(&self) -> CommonResult<()> {
        Ok(())
    }
}

fn factory() -> (tempfile::TempDir, Factory) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RuntimeConfig {
        init_binary: Some(PathBuf::from(env!("CARGO_BIN_EXE_berth"))),
        clone_binary: false,
        ..RuntimeConfig::with_root(dir.path().join("state"))
    };
    (dir, Factory::new(config).expect("factory"))
}

fn create(factory: &Factory, id: &str) -> Container {
    let config = ContainerConfig {
        rootfs: PathBuf::from("/"),
        ..ContainerConfig::default()
    };
    factory
        .create_with_cgroup(
            &ContainerId::new(id).expect("id"),
            config,
            Arc::new(MemoryCgroup::default()),
        )
        .expect("create")
}

fn process(args: &[&str], init: bool) -> Process {
    let mut process = Process::init(args.iter().map(ToString::to_string).collect());
    process.init = init;
    process.user = User {
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        additional_gids: Vec::new(),
    };
    process
}

#[test]
fn create_start_kill_destroy() {
    let (_dir, factory) = factory();
    let container = create(&factory, "scenario-a");

    let init = container.start(&process(&["sleep", "30"], true)).expect("start");
    assert!(init.is_alive());
    assert_eq!(container.status().expect("status"), ContainerStatus::Created);
    assert_eq!(container.state().expect("state").pid, Some(init.pid()));

    container.exec().expect("exec");
    assert_eq!(container.status().expect("status"), ContainerStatus::Running);
    assert!(init.is_alive());

    berth_runtime::signal::kill(&container).expect("kill");
    assert_eq!(container.status().expect("status"), ContainerStatus::Stopped);

    let state_dir = container.state_dir().to_path_buf();
    container.destroy().expect("destroy");
    assert!(!state_dir.exists());
    assert!(factory.list().expect("list").is_empty());
}

#[test]
fn second_init_is_rejected() {
    let (_dir, factory) = factory();
    let container = create(&factory, "twice");
    let _ = container.start(&process(&["sleep", "30"], true)).expect("first start");

    let err = container
        .start(&process(&["sleep", "30"], true))
        .expect_err("second start");
    assert!(matches!(err, RuntimeError::AlreadyHasInit { .. }));
    assert_eq!(container.status().expect("status"), ContainerStatus::Created);

    berth_runtime::signal::kill(&container).expect("kill");
}

#[test]
fn pause_and_resume_a_running_container() {
    let (_dir, factory) = factory();
    let container = create(&factory, "scenario-b");
    let _ = container.run(&process(&["sleep", "30"], true)).expect("run");
    assert_eq!(container.status().expect("status"), ContainerStatus::Running);

    container.pause().expect("pause");
    assert_eq!(container.status().expect("status"), ContainerStatus::Paused);
    container.resume().expect("resume");
    assert_eq!(container.status().expect("status"), ContainerStatus::Running);

    berth_runtime::signal::kill(&container).expect("kill");
    let err = container.pause().expect_err("pause stopped");
    assert!(matches!(
        err,
        RuntimeError::StateTransition {
            current: ContainerStatus::Stopped,
            ..
        }
    ));
}

#[test]
fn state_survives_a_reload() {
    let (_dir, factory) = factory();
    let container = create(&factory, "reload");
    let init = container.start(&process(&["sleep", "30"], true)).expect("start");

    let loaded = factory
        .load_with_cgroup(container.id(), Arc::new(MemoryCgroup::default()))
        .expect("load");
    assert_eq!(loaded.status().expect("status"), ContainerStatus::Created);
    assert_eq!(loaded.init_pid(), Some(init.pid()));
    assert_eq!(loaded.state().expect("state"), container.state().expect("state"));

    berth_runtime::signal::kill(&container).expect("kill");
}

#[test]
fn additional_process_runs_in_a_running_container() {
    let (_dir, factory) = factory();
    let container = create(&factory, "exec");
    let _ = container.run(&process(&["sleep", "30"], true)).expect("run");

    let extra = container.start(&process(&["sh", "-c", "exit 3"], false)).expect("exec");
    assert!(!extra.is_init());
    assert_eq!(extra.wait().expect("wait"), ExitState::Exited(3));
    assert_eq!(container.status().expect("status"), ContainerStatus::Running);

    berth_runtime::signal::kill(&container).expect("kill");
}

#[test]
fn init_exit_status_is_reported() {
    let (_dir, factory) = factory();
    let container = create(&factory, "short");
    let init = container.run(&process(&["sh", "-c", "exit 7"], true)).expect("run");
    assert_eq!(init.wait().expect("wait"), ExitState::Exited(7));
    assert_eq!(container.status().expect("status"), ContainerStatus::Stopped);
    container.destroy().expect("destroy");
}
