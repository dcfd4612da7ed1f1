//! A single container and its lifecycle operations.
//!
//! Every operation takes the container's lock for its whole duration and
//! starts by reconciling the cached status with the kernel, so decisions
//! are always made against live facts.

use std::collections::BTreeMap;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use berth_common::config::RuntimeConfig;
use berth_common::constants::POLL_INTERVAL;
use berth_common::types::{ContainerId, ContainerStatus, FreezerState, ResourceLimits};
use berth_core::cgroup::CgroupHandle;
use berth_core::exe::CompanionImage;
use berth_core::namespace::{self, NamespaceType};
use berth_core::namespace::user::host_id_for;
use berth_core::proc;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;

use crate::bootstrap::{self, BootstrapAttributes, Launch};
use crate::collaborators::{CheckpointEngine, CheckpointOptions};
use crate::config::{ContainerConfig, InitConfig, Process};
use crate::error::{Result, RuntimeError};
use crate::gate::ExecGate;
use crate::hooks;
use crate::lifecycle::{self, Observation};
use crate::process::{ContainerProcess, ProcessHandle, Tracked};
use crate::signal;
use crate::state::{self, State};

/// Attempts to free a gate writer whose companion died.
const UNBLOCK_ATTEMPTS: u32 = 100;
const UNBLOCK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Inner {
    status: ContainerStatus,
    init: Option<ProcessHandle>,
    resources: ResourceLimits,
    namespace_paths: BTreeMap<NamespaceType, PathBuf>,
}

/// A container managed from one state directory.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    state_dir: PathBuf,
    runtime: RuntimeConfig,
    config: ContainerConfig,
    cgroup: Arc<dyn CgroupHandle>,
    created: DateTime<Utc>,
    inner: Mutex<Inner>,
}

impl Container {
    /// A container that has never run anything.
    pub(crate) fn new(
        id: ContainerId,
        state_dir: PathBuf,
        runtime: RuntimeConfig,
        config: ContainerConfig,
        cgroup: Arc<dyn CgroupHandle>,
    ) -> Self {
        let resources = config.resources.clone();
        Self {
            id,
            state_dir,
            runtime,
            config,
            cgroup,
            created: Utc::now(),
            inner: Mutex::new(Inner {
                status: ContainerStatus::Stopped,
                init: None,
                resources,
                namespace_paths: BTreeMap::new(),
            }),
        }
    }

    /// A container restored from its persisted snapshot. The recorded init
    /// process is adopted by pid and fingerprint.
    pub(crate) fn from_state(
        state: State,
        state_dir: PathBuf,
        runtime: RuntimeConfig,
        cgroup: Arc<dyn CgroupHandle>,
    ) -> Self {
        let init = state
            .pid
            .zip(state.init_start_time)
            .map(|(pid, start)| ProcessHandle::init(Tracked::adopted(pid, start)));
        Self {
            id: state.id,
            state_dir,
            runtime,
            cgroup,
            created: state.created,
            inner: Mutex::new(Inner {
                status: state.status,
                init,
                resources: state.config.resources.clone(),
                namespace_paths: state.namespace_paths,
            }),
            config: state.config,
        }
    }

    /// Container id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Container configuration as created.
    #[must_use]
    pub const fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// The container's state directory.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// The container's cgroup.
    #[must_use]
    pub fn cgroup(&self) -> &dyn CgroupHandle {
        &*self.cgroup
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current status, after reconciliation.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer cannot be read or the state cannot
    /// be saved.
    pub fn status(&self) -> Result<ContainerStatus> {
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        Ok(inner.status)
    }

    /// A full snapshot, after reconciliation.
    ///
    /// # Errors
    ///
    /// See [`Self::status`].
    pub fn state(&self) -> Result<State> {
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        Ok(self.snapshot(&inner))
    }

    /// Handle on the init process, if one was started.
    #[must_use]
    pub fn init_process(&self) -> Option<ProcessHandle> {
        self.lock().init.clone()
    }

    /// Pid of the init process, if one was started.
    #[must_use]
    pub fn init_pid(&self) -> Option<i32> {
        self.lock().init.as_ref().map(ContainerProcess::pid)
    }

    /// Writes the current snapshot to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn persist(&self) -> Result<()> {
        let inner = self.lock();
        self.save(&inner)
    }

    fn snapshot(&self, inner: &Inner) -> State {
        let mut config = self.config.clone();
        config.resources = inner.resources.clone();
        State {
            oci_version: berth_common::constants::OCI_VERSION.to_string(),
            id: self.id.clone(),
            status: inner.status,
            pid: inner.init.as_ref().map(ContainerProcess::pid),
            init_start_time: inner.init.as_ref().map(ContainerProcess::start_time),
            rootfs: self.config.rootfs.clone(),
            created: self.created,
            cgroup_path: self.cgroup.path(""),
            namespace_paths: inner.namespace_paths.clone(),
            config,
        }
    }

    fn save(&self, inner: &Inner) -> Result<()> {
        state::save(&self.state_dir, &self.snapshot(inner))
    }

    /// Derives the status from the freezer, init liveness, and the exec
    /// gate, in that order. The observed status is adopted even when the
    /// cached one has no edge to it.
    fn refresh(&self, inner: &mut Inner) -> Result<()> {
        let frozen = self.cgroup.freezer_state()? == FreezerState::Frozen;
        let init_alive = inner.init.as_ref().is_some_and(|init| {
            let alive = init.is_alive();
            if !alive && !init.try_reap() {
                tracing::debug!(id = %self.id, pid = init.pid(), "init exited but is not reaped yet");
            }
            alive
        });
        let gate_exists = ExecGate::at(&self.state_dir).exists();
        let observed = lifecycle::observe(Observation {
            frozen,
            init_alive,
            gate_exists,
        });
        if observed != inner.status {
            if !lifecycle::can_transition(inner.status, observed) {
                tracing::warn!(
                    id = %self.id,
                    from = %inner.status,
                    to = %observed,
                    "adopting observed status outside the transition table"
                );
            }
            tracing::debug!(id = %self.id, from = %inner.status, to = %observed, "status reconciled");
            inner.status = observed;
            self.save(inner)?;
        }
        Ok(())
    }

    /// Starts `process` in the container.
    ///
    /// An init process creates the container's namespaces and stops at the
    /// exec gate, leaving the container `created`. Any other process joins
    /// the namespaces of the running init and execs right away.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyHasInit`] for a second init process,
    /// [`RuntimeError::NotRunning`] for an additional process in a stopped
    /// container, [`RuntimeError::StateTransition`] for one in a paused
    /// container, and the bootstrap error if the companion fails.
    pub fn start(&self, process: &Process) -> Result<ProcessHandle> {
        process.validate()?;
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        if process.init {
            self.start_init(&mut inner, process)
        } else {
            self.start_setns(&inner, process)
        }
    }

    fn start_init(&self, inner: &mut Inner, process: &Process) -> Result<ProcessHandle> {
        if inner.init.is_some() {
            return Err(RuntimeError::AlreadyHasInit { id: self.id.clone() });
        }
        let image = companion_image(&self.runtime)?;
        let (uid, gid) = self.gate_owner();
        let gate = ExecGate::create(&self.state_dir, uid, gid)?;

        let result = (|| -> Result<Tracked> {
            let gate_fd = gate.open_path_fd()?;
            let attrs = BootstrapAttributes::for_init(&self.config)?;
            let init_config = InitConfig::new(&self.id, &self.config, process);
            let mut hook_state = self.snapshot(inner);
            hook_state.status = ContainerStatus::Created;
            bootstrap::launch(
                &Launch {
                    image: &image,
                    attrs: &attrs,
                    init_config: &init_config,
                    gate: Some(gate_fd.as_fd()),
                    cgroup: &*self.cgroup,
                    log_level: &self.runtime.log_level,
                    seccomp_listener: self.config.seccomp_listener.as_deref(),
                },
                |pid| {
                    hook_state.pid = Some(pid);
                    hooks::run_hooks("prestart", &self.config.hooks.prestart, &hook_state)
                },
            )
        })();

        let tracked = match result {
            Ok(tracked) => tracked,
            Err(e) => {
                let _ = gate.remove();
                if let Err(cleanup) = self.cgroup.destroy() {
                    tracing::warn!(id = %self.id, error = %cleanup, "cgroup cleanup after failed start");
                }
                return Err(e);
            }
        };

        let pid = tracked.pid();
        inner.namespace_paths = self
            .config
            .namespaces
            .iter()
            .map(|ns| (ns.ty, ns.path.clone().unwrap_or_else(|| ns.ty.proc_path(pid))))
            .collect();
        inner.init = Some(ProcessHandle::init(tracked));
        inner.status = ContainerStatus::Created;
        self.save(inner)?;
        tracing::info!(id = %self.id, pid, "container created");
        Ok(ProcessHandle::init(tracked))
    }

    fn start_setns(&self, inner: &Inner, process: &Process) -> Result<ProcessHandle> {
        let init_pid = match (&inner.init, inner.status) {
            (_, ContainerStatus::Paused) => {
                return Err(RuntimeError::StateTransition {
                    current: ContainerStatus::Paused,
                    requested: ContainerStatus::Running,
                });
            }
            (Some(init), status) if status != ContainerStatus::Stopped => init.pid(),
            _ => return Err(RuntimeError::NotRunning { id: self.id.clone() }),
        };
        let image = companion_image(&self.runtime)?;
        let attrs = BootstrapAttributes::for_setns(&self.config, init_pid)?;
        let init_config = InitConfig::new(&self.id, &self.config, process);
        let tracked = bootstrap::launch(
            &Launch {
                image: &image,
                attrs: &attrs,
                init_config: &init_config,
                gate: None,
                cgroup: &*self.cgroup,
                log_level: &self.runtime.log_level,
                seccomp_listener: self.config.seccomp_listener.as_deref(),
            },
            |_| Ok(()),
        )?;
        tracing::info!(id = %self.id, pid = tracked.pid(), "process joined container");
        Ok(ProcessHandle::setns(tracked))
    }

    /// Owner of the exec gate: the host identity of the container's root.
    fn gate_owner(&self) -> (u32, u32) {
        let own_uid = nix::unistd::geteuid().as_raw();
        let own_gid = nix::unistd::getegid().as_raw();
        if !self.config.creates_namespace(NamespaceType::User) {
            return (own_uid, own_gid);
        }
        (
            host_id_for(&self.config.uid_mappings, 0).unwrap_or(own_uid),
            host_id_for(&self.config.gid_mappings, 0).unwrap_or(own_gid),
        )
    }

    /// Starts `process` and, for an init process, releases it at once.
    ///
    /// # Errors
    ///
    /// See [`Self::start`] and [`Self::exec`].
    pub fn run(&self, process: &Process) -> Result<ProcessHandle> {
        let handle = self.start(process)?;
        if process.init {
            self.exec()?;
        }
        Ok(handle)
    }

    /// Releases the exec gate so the init process runs the user program.
    ///
    /// Releasing a running container succeeds without doing anything. If
    /// the companion dies while the gate is being released, the blocked
    /// writer is freed and the call still succeeds; the container is then
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::StateTransition`] unless the container is
    /// created or running, or the release error.
    pub fn exec(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        match inner.status {
            ContainerStatus::Running => return Ok(()),
            ContainerStatus::Created => {}
            current => {
                return Err(RuntimeError::StateTransition {
                    current,
                    requested: ContainerStatus::Running,
                });
            }
        }
        let init = inner
            .init
            .clone()
            .ok_or_else(|| RuntimeError::NotRunning { id: self.id.clone() })?;

        let gate = ExecGate::at(&self.state_dir);
        let writer_gate = gate.clone();
        let writer = thread::Builder::new()
            .name("exec-gate".into())
            .spawn(move || writer_gate.release())
            .map_err(|e| RuntimeError::external("spawn exec gate writer", e))?;

        let released = loop {
            if writer.is_finished() {
                match writer.join() {
                    Ok(result) => result?,
                    Err(_) => return Err(RuntimeError::Liveness("exec gate writer panicked".into())),
                }
                break true;
            }
            if !init.is_alive() {
                tracing::warn!(id = %self.id, pid = init.pid(), "companion died before release");
                match gate.try_release() {
                    Ok(true) => tracing::debug!(id = %self.id, "exec gate drained after companion death"),
                    Ok(false) => {}
                    Err(e) => tracing::debug!(id = %self.id, error = %e, "exec gate fallback release failed"),
                }
                let freed = crate::process::poll_until(UNBLOCK_ATTEMPTS, UNBLOCK_INTERVAL, || {
                    if writer.is_finished() {
                        return true;
                    }
                    gate.unblock_writer();
                    false
                });
                if freed {
                    match writer.join() {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::debug!(id = %self.id, error = %e, "exec gate writer gave up"),
                        Err(_) => tracing::debug!(id = %self.id, "exec gate writer panicked"),
                    }
                } else {
                    tracing::warn!(id = %self.id, "exec gate writer still blocked, detaching");
                }
                let _ = gate.remove();
                break false;
            }
            thread::sleep(POLL_INTERVAL);
        };

        if released {
            inner.status = lifecycle::transition(inner.status, ContainerStatus::Running)?;
            self.save(&inner)?;
            tracing::info!(id = %self.id, pid = init.pid(), "container started");
            let state = self.snapshot(&inner);
            if let Err(e) = hooks::run_hooks("poststart", &self.config.hooks.poststart, &state) {
                tracing::warn!(id = %self.id, error = %e, "poststart hook failed");
            }
        } else {
            self.refresh(&mut inner)?;
        }
        Ok(())
    }

    /// Sends `sig` to the container.
    ///
    /// `SIGKILL` without a private pid namespace reaches every process in
    /// the cgroup, not only init. A paused container is thawed after
    /// `SIGKILL` so the signal is delivered.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotRunning`] for a stopped container,
    /// [`RuntimeError::Liveness`] if the init pid was recycled, or a
    /// cgroup error.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        let init = match (&inner.init, inner.status) {
            (Some(init), status) if status != ContainerStatus::Stopped => init,
            _ => return Err(RuntimeError::NotRunning { id: self.id.clone() }),
        };
        if sig == Signal::SIGKILL && !namespace::has_private_pid_namespace(&self.config.namespaces) {
            signal::signal_all_processes(&*self.cgroup, init, sig)?;
        } else {
            init.signal(sig)?;
        }
        if sig == Signal::SIGKILL && inner.status == ContainerStatus::Paused {
            self.cgroup.freeze(FreezerState::Thawed)?;
        }
        tracing::info!(id = %self.id, signal = %sig, "signal delivered");
        Ok(())
    }

    /// Freezes every process in the container.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::StateTransition`] unless the container is
    /// running or created, or the freezer error.
    pub fn pause(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        let current = inner.status;
        if !matches!(current, ContainerStatus::Running | ContainerStatus::Created) {
            return Err(RuntimeError::StateTransition {
                current,
                requested: ContainerStatus::Paused,
            });
        }
        self.cgroup.freeze(FreezerState::Frozen)?;
        inner.status = lifecycle::transition(current, ContainerStatus::Paused)?;
        self.save(&inner)?;
        tracing::info!(id = %self.id, "container paused");
        Ok(())
    }

    /// Thaws a paused container. A container paused before its gate was
    /// released returns to `created`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::StateTransition`] unless the container is
    /// paused, or the freezer error.
    pub fn resume(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        let current = inner.status;
        if current != ContainerStatus::Paused {
            return Err(RuntimeError::StateTransition {
                current,
                requested: ContainerStatus::Running,
            });
        }
        self.cgroup.freeze(FreezerState::Thawed)?;
        inner.status = if ExecGate::at(&self.state_dir).exists() {
            ContainerStatus::Created
        } else {
            lifecycle::transition(current, ContainerStatus::Running)?
        };
        self.save(&inner)?;
        tracing::info!(id = %self.id, status = %inner.status, "container resumed");
        Ok(())
    }

    /// Applies new resource limits. If the cgroup rejects them, the
    /// previous limits are restored before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Configuration`] for invalid limits, or
    /// [`RuntimeError::External`] wrapping the cgroup's error.
    pub fn set(&self, limits: ResourceLimits) -> Result<()> {
        limits
            .validate()
            .map_err(|e| RuntimeError::Configuration(e.to_string()))?;
        let mut inner = self.lock();
        if let Err(e) = self.cgroup.set(&limits) {
            if let Err(rollback) = self.cgroup.set(&inner.resources) {
                tracing::error!(id = %self.id, error = %rollback, "restoring previous limits failed");
            }
            return Err(RuntimeError::external("apply resource limits", e));
        }
        inner.resources = limits;
        self.save(&inner)?;
        tracing::info!(id = %self.id, "resource limits updated");
        Ok(())
    }

    /// Removes the container's cgroup, exec gate, and state directory, then
    /// runs poststop hooks.
    ///
    /// Without a private pid namespace, processes left in the cgroup do not
    /// die with init; they are killed first.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::StateTransition`] unless the container is
    /// stopped, or a cleanup error.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        if inner.status != ContainerStatus::Stopped {
            return Err(RuntimeError::StateTransition {
                current: inner.status,
                requested: ContainerStatus::Stopped,
            });
        }
        let state = self.snapshot(&inner);
        if !namespace::has_private_pid_namespace(&self.config.namespaces) {
            signal::kill_cgroup_members(&*self.cgroup)?;
        }
        self.cgroup.destroy()?;
        ExecGate::at(&self.state_dir).remove()?;
        std::fs::remove_dir_all(&self.state_dir)
            .map_err(|e| berth_common::error::BerthError::io(&self.state_dir, e))?;
        if let Err(e) = hooks::run_hooks("poststop", &self.config.hooks.poststop, &state) {
            tracing::warn!(id = %self.id, error = %e, "poststop hook failed");
        }
        tracing::info!(id = %self.id, "container destroyed");
        Ok(())
    }

    /// Pids of every process in the container's cgroup, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup cannot be read.
    pub fn processes(&self) -> Result<Vec<i32>> {
        let mut pids = self.cgroup.get_all_pids()?;
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    /// Dumps the container through `engine`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotRunning`] for a stopped container, or the
    /// engine's error.
    pub fn checkpoint(&self, engine: &dyn CheckpointEngine, options: &CheckpointOptions) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        if inner.status == ContainerStatus::Stopped {
            return Err(RuntimeError::NotRunning { id: self.id.clone() });
        }
        engine.checkpoint(&self.snapshot(&inner), options)?;
        tracing::info!(id = %self.id, images = %options.image_path.display(), "container checkpointed");
        if !options.leave_running {
            self.refresh(&mut inner)?;
        }
        Ok(())
    }

    /// Recreates the container's processes through `engine` and adopts the
    /// restored init.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::StateTransition`] unless the container is
    /// stopped, the engine's error, or [`RuntimeError::Liveness`] if the
    /// restored process is already gone.
    pub fn restore(
        &self,
        engine: &dyn CheckpointEngine,
        process: &Process,
        options: &CheckpointOptions,
    ) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner)?;
        let next = lifecycle::transition(inner.status, ContainerStatus::Restored)?;
        let restored = engine.restore(&self.snapshot(&inner), process, options)?;
        let start_time = proc::start_time(restored.pid).ok_or_else(|| {
            RuntimeError::Liveness(format!("restored process {} is not running", restored.pid))
        })?;
        inner.init = Some(ProcessHandle::init(Tracked::adopted(restored.pid, start_time)));
        inner.status = next;
        self.save(&inner)?;
        tracing::info!(id = %self.id, pid = restored.pid, "container restored");
        Ok(())
    }
}

/// Picks the executable the companion runs from.
fn companion_image(runtime: &RuntimeConfig) -> Result<CompanionImage> {
    if let Some(path) = &runtime.init_binary {
        return Ok(CompanionImage::from_path(path));
    }
    if runtime.clone_binary {
        return Ok(CompanionImage::sealed_self()?);
    }
    Ok(CompanionImage::from_path("/proc/self/exe"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{FakeCgroup, spawn_sleeper};

    fn container_with(cgroup: Arc<FakeCgroup>) -> (tempfile::TempDir, Container) {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join("c1");
        std::fs::create_dir(&state_dir).expect("state dir");
        let config = ContainerConfig {
            rootfs: PathBuf::from("/"),
            ..ContainerConfig::default()
        };
        let container = Container::new(
            ContainerId::new("c1").expect("id"),
            state_dir,
            RuntimeConfig::with_root(dir.path()),
            config,
            cgroup,
        );
        (dir, container)
    }

    /// Puts a live sleeper in place of the init process, as if the gate had
    /// been released already.
    fn adopt_sleeper(container: &Container) -> std::process::Child {
        let child = spawn_sleeper();
        let pid = i32::try_from(child.id()).expect("pid");
        let start = proc::start_time(pid).expect("start time");
        let mut inner = container.lock();
        inner.init = Some(ProcessHandle::init(Tracked::spawned(pid, start)));
        inner.status = ContainerStatus::Running;
        drop(inner);
        child
    }

    #[test]
    fn new_container_is_stopped() {
        let (_dir, container) = container_with(Arc::new(FakeCgroup::default()));
        assert_eq!(container.status().expect("status"), ContainerStatus::Stopped);
        assert!(container.init_pid().is_none());
    }

    #[test]
    fn pause_and_resume_drive_the_freezer() {
        let cgroup = Arc::new(FakeCgroup::default());
        let (_dir, container) = container_with(cgroup.clone());
        let mut child = adopt_sleeper(&container);

        container.pause().expect("pause");
        assert_eq!(container.status().expect("status"), ContainerStatus::Paused);
        container.resume().expect("resume");
        assert_eq!(container.status().expect("status"), ContainerStatus::Running);
        assert_eq!(
            *cgroup.freeze_calls.lock().expect("lock"),
            vec![FreezerState::Frozen, FreezerState::Thawed]
        );

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn pause_on_stopped_is_rejected() {
        let (_dir, container) = container_with(Arc::new(FakeCgroup::default()));
        let err = container.pause().expect_err("stopped");
        assert!(matches!(
            err,
            RuntimeError::StateTransition {
                current: ContainerStatus::Stopped,
                requested: ContainerStatus::Paused
            }
        ));
        assert!(container.resume().is_err());
    }

    #[test]
    fn refresh_adopts_death_of_init() {
        let (_dir, container) = container_with(Arc::new(FakeCgroup::default()));
        let mut child = adopt_sleeper(&container);
        assert_eq!(container.status().expect("status"), ContainerStatus::Running);
        child.kill().expect("kill");
        let _ = child.wait();
        assert_eq!(container.status().expect("status"), ContainerStatus::Stopped);
        let saved = state::load(container.state_dir()).expect("load");
        assert_eq!(saved.status, ContainerStatus::Stopped);
    }

    #[test]
    fn failed_set_restores_previous_limits() {
        let cgroup = Arc::new(FakeCgroup {
            fail_memory: Some(64 * 1024 * 1024),
            ..FakeCgroup::default()
        });
        let (_dir, container) = container_with(cgroup.clone());
        let good = ResourceLimits {
            memory_bytes: Some(32 * 1024 * 1024),
            ..ResourceLimits::default()
        };
        container.set(good.clone()).expect("set");

        let bad = ResourceLimits {
            memory_bytes: Some(64 * 1024 * 1024),
            pids_max: Some(10),
            ..ResourceLimits::default()
        };
        let err = container.set(bad.clone()).expect_err("rejected");
        assert!(matches!(err, RuntimeError::External { .. }));
        assert_eq!(
            *cgroup.limits.lock().expect("lock"),
            vec![good.clone(), bad, good.clone()]
        );
        assert_eq!(container.state().expect("state").config.resources, good);
    }

    #[test]
    fn invalid_limits_never_reach_the_cgroup() {
        let cgroup = Arc::new(FakeCgroup::default());
        let (_dir, container) = container_with(cgroup.clone());
        let err = container
            .set(ResourceLimits {
                memory_bytes: Some(1024),
                ..ResourceLimits::default()
            })
            .expect_err("too small");
        assert!(matches!(err, RuntimeError::Configuration(_)));
        assert!(cgroup.limits.lock().expect("lock").is_empty());
    }

    #[test]
    fn destroy_requires_stopped() {
        let cgroup = Arc::new(FakeCgroup::default());
        let (_dir, container) = container_with(cgroup.clone());
        let mut child = adopt_sleeper(&container);
        assert!(matches!(
            container.destroy(),
            Err(RuntimeError::StateTransition {
                current: ContainerStatus::Running,
                requested: ContainerStatus::Stopped
            })
        ));
        let _ = child.kill();
        let _ = child.wait();

        container.destroy().expect("destroy");
        assert!(!container.state_dir().exists());
        assert!(*cgroup.destroyed.lock().expect("lock"));
    }

    #[test]
    fn destroy_kills_processes_left_in_the_cgroup() {
        let cgroup = Arc::new(FakeCgroup::default());
        let (_dir, container) = container_with(cgroup.clone());
        let mut init = adopt_sleeper(&container);
        let straggler = spawn_sleeper();
        let straggler_pid = i32::try_from(straggler.id()).expect("pid");
        let straggler_start = proc::start_time(straggler_pid).expect("start time");
        cgroup.pids.lock().expect("lock").push(straggler_pid);

        init.kill().expect("kill init");
        let _ = init.wait();
        container.destroy().expect("destroy");

        assert!(!proc::is_alive(straggler_pid, Some(straggler_start)));
        assert!(*cgroup.destroyed.lock().expect("lock"));
        drop(straggler);
    }

    #[test]
    fn second_init_fails_without_side_effects() {
        let (_dir, container) = container_with(Arc::new(FakeCgroup::default()));
        let mut child = adopt_sleeper(&container);
        let before = container.state().expect("state");

        let err = container
            .start(&Process::init(vec!["sleep".into(), "1".into()]))
            .expect_err("second init");
        assert!(matches!(err, RuntimeError::AlreadyHasInit { .. }));
        assert_eq!(container.state().expect("state"), before);
        assert!(!ExecGate::at(container.state_dir()).exists());

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn setns_process_needs_a_live_container() {
        let (_dir, container) = container_with(Arc::new(FakeCgroup::default()));
        let mut process = Process::init(vec!["true".into()]);
        process.init = false;
        assert!(matches!(
            container.start(&process),
            Err(RuntimeError::NotRunning { .. })
        ));
    }

    #[test]
    fn setns_process_is_refused_while_paused() {
        let cgroup = Arc::new(FakeCgroup::default());
        let (_dir, container) = container_with(cgroup.clone());
        let mut child = adopt_sleeper(&container);
        container.pause().expect("pause");

        let mut process = Process::init(vec!["true".into()]);
        process.init = false;
        assert!(matches!(
            container.start(&process),
            Err(RuntimeError::StateTransition {
                current: ContainerStatus::Paused,
                requested: ContainerStatus::Running
            })
        ));
        assert!(cgroup.pids.lock().expect("lock").is_empty());

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn exec_frees_the_gate_writer_when_init_dies() {
        let (_dir, container) = container_with(Arc::new(FakeCgroup::default()));
        let uid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getegid().as_raw();
        let gate = ExecGate::create(container.state_dir(), uid, gid).expect("gate");
        let mut child = adopt_sleeper(&container);
        container.lock().status = ContainerStatus::Created;
        assert_eq!(container.status().expect("status"), ContainerStatus::Created);

        let pid = nix::unistd::Pid::from_raw(i32::try_from(child.id()).expect("pid"));
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            nix::sys::signal::kill(pid, Signal::SIGKILL).expect("kill init");
        });

        container.exec().expect("dead companion is not an exec error");
        killer.join().expect("join");

        assert!(!gate.exists());
        assert_eq!(container.status().expect("status"), ContainerStatus::Stopped);
        let writers = std::fs::read_dir("/proc/self/task")
            .expect("tasks")
            .filter_map(|task| std::fs::read_to_string(task.ok()?.path().join("comm")).ok())
            .filter(|comm| comm.trim() == "exec-gate")
            .count();
        assert_eq!(writers, 0);
        let _ = child.wait();
    }

    #[test]
    fn exec_on_running_is_a_no_op_and_on_stopped_fails() {
        let (_dir, container) = container_with(Arc::new(FakeCgroup::default()));
        assert!(matches!(
            container.exec(),
            Err(RuntimeError::StateTransition {
                current: ContainerStatus::Stopped,
                requested: ContainerStatus::Running
            })
        ));
        let mut child = adopt_sleeper(&container);
        container.exec().expect("idempotent");
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn signal_on_stopped_is_not_running() {
        let (_dir, container) = container_with(Arc::new(FakeCgroup::default()));
        assert!(matches!(
            container.signal(Signal::SIGTERM),
            Err(RuntimeError::NotRunning { .. })
        ));
    }
}
