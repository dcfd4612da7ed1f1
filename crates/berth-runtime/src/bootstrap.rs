//! Companion spawn and the supervisor side of the bootstrap.
//!
//! Starting a container process takes three exchanges on the sync
//! channel:
//!
//! 1. the supervisor sends [`BootstrapAttributes`] as one binary frame;
//!    stage 1 of the companion answers with [`BootstrapType`] messages
//!    (a user-mapping request, then the pid of stage 2);
//! 2. the supervisor sends the [`InitConfig`] as one JSON frame;
//! 3. stage 2 runs the handshake of [`crate::sync`] until it closes the
//!    channel, which [`parse_sync`] drives.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread::JoinHandle;

use berth_common::constants::{INIT_SUBCOMMAND, POLL_INTERVAL};
use berth_core::cgroup::CgroupHandle;
use berth_core::exe::CompanionImage;
use berth_core::namespace::time::encode_time_offsets;
use berth_core::namespace::user::{self, IdMap, MapKind};
use berth_core::namespace::{self, Namespace, NamespaceType};
use berth_core::{fd, proc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{ContainerConfig, InitConfig};
use crate::error::{Result, RuntimeError, SyncError};
use crate::logs;
use crate::process::{ContainerProcess, ProcessHandle, Tracked};
use crate::sync::{self, SyncChannel, SyncType};

const TAG_CLONE_FLAGS: u16 = 1;
const TAG_NS_PATHS: u16 = 2;
const TAG_UID_MAP: u16 = 3;
const TAG_GID_MAP: u16 = 4;
const TAG_UIDMAP_HELPER: u16 = 5;
const TAG_GIDMAP_HELPER: u16 = 6;
const TAG_SETGROUPS_DENY: u16 = 7;
const TAG_ROOTLESS: u16 = 8;
const TAG_OOM_SCORE_ADJ: u16 = 9;
const TAG_TIME_OFFSETS: u16 = 10;

/// Polls for the log forwarder to reach EOF once the companion is done.
const LOG_DRAIN_ATTEMPTS: u32 = 20;

/// Namespace and identity setup performed by companion stage 1.
///
/// Encoded as a sequence of `tag (u16 BE) | length (u32 BE) | value`
/// records. Absent or empty values are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapAttributes {
    /// `CLONE_NEW*` flags of the namespaces to create.
    pub clone_flags: i32,
    /// Namespaces to join, in join order.
    pub ns_paths: Vec<PathBuf>,
    /// Encoded `uid_map` contents.
    pub uid_map: String,
    /// Encoded `gid_map` contents.
    pub gid_map: String,
    /// `newuidmap` to write `uid_map` with.
    pub uidmap_helper: Option<PathBuf>,
    /// `newgidmap` to write `gid_map` with.
    pub gidmap_helper: Option<PathBuf>,
    /// Write `deny` to `setgroups` before `gid_map`.
    pub setgroups_deny: bool,
    /// The supervisor is unprivileged.
    pub rootless: bool,
    /// Value for `/proc/self/oom_score_adj`.
    pub oom_score_adj: Option<i32>,
    /// Encoded `timens_offsets` contents.
    pub time_offsets: String,
}

impl BootstrapAttributes {
    /// Attributes for the first process of a container.
    ///
    /// # Errors
    ///
    /// Returns an error if a join path is invalid or a time offset cannot
    /// be encoded.
    pub fn for_init(config: &ContainerConfig) -> Result<Self> {
        let mut attrs = Self {
            clone_flags: namespace::clone_flags(&config.namespaces).bits(),
            ns_paths: namespace::ordered_join_paths(&config.namespaces)?,
            rootless: config.rootless,
            oom_score_adj: config.oom_score_adj,
            time_offsets: encode_time_offsets(&config.time_offsets)?,
            ..Self::default()
        };
        if config.creates_namespace(NamespaceType::User) {
            attrs.uid_map = user::encode_id_mappings(&config.uid_mappings);
            attrs.gid_map = user::encode_id_mappings(&config.gid_mappings);
            if config.rootless {
                let uid = nix::unistd::geteuid().as_raw();
                let gid = nix::unistd::getegid().as_raw();
                if needs_helper(&config.uid_mappings, uid) {
                    attrs.uidmap_helper = user::find_mapping_helper(MapKind::Uid);
                }
                if needs_helper(&config.gid_mappings, gid) {
                    attrs.gidmap_helper = user::find_mapping_helper(MapKind::Gid);
                }
                attrs.setgroups_deny = attrs.gidmap_helper.is_none();
            }
        }
        Ok(attrs)
    }

    /// Attributes for a process joining the namespaces of `init_pid`.
    ///
    /// Every namespace type the container was configured with is joined
    /// through `/proc/<init_pid>/ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if a namespace file of the init process is gone.
    pub fn for_setns(config: &ContainerConfig, init_pid: i32) -> Result<Self> {
        let joined: Vec<Namespace> = config
            .namespaces
            .iter()
            .map(|ns| Namespace::join(ns.ty, ns.ty.proc_path(init_pid)))
            .collect();
        Ok(Self {
            ns_paths: namespace::ordered_join_paths(&joined)?,
            rootless: config.rootless,
            oom_score_adj: config.oom_score_adj,
            ..Self::default()
        })
    }

    /// Serializes the attributes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.clone_flags != 0 {
            put(&mut out, TAG_CLONE_FLAGS, &self.clone_flags.to_be_bytes());
        }
        if !self.ns_paths.is_empty() {
            let joined = self
                .ns_paths
                .iter()
                .map(|p| p.to_string_lossy())
                .collect::<Vec<_>>()
                .join(",");
            put(&mut out, TAG_NS_PATHS, joined.as_bytes());
        }
        put_str(&mut out, TAG_UID_MAP, &self.uid_map);
        put_str(&mut out, TAG_GID_MAP, &self.gid_map);
        if let Some(helper) = &self.uidmap_helper {
            put_str(&mut out, TAG_UIDMAP_HELPER, &helper.to_string_lossy());
        }
        if let Some(helper) = &self.gidmap_helper {
            put_str(&mut out, TAG_GIDMAP_HELPER, &helper.to_string_lossy());
        }
        if self.setgroups_deny {
            put(&mut out, TAG_SETGROUPS_DENY, &[1]);
        }
        if self.rootless {
            put(&mut out, TAG_ROOTLESS, &[1]);
        }
        if let Some(adj) = self.oom_score_adj {
            put(&mut out, TAG_OOM_SCORE_ADJ, &adj.to_be_bytes());
        }
        put_str(&mut out, TAG_TIME_OFFSETS, &self.time_offsets);
        out
    }

    /// Parses attributes written by [`Self::encode`]. Unknown tags are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Malformed`] for truncated records or values of
    /// the wrong size.
    pub fn decode(mut data: &[u8]) -> std::result::Result<Self, SyncError> {
        let mut attrs = Self::default();
        while !data.is_empty() {
            let (header, rest) = data
                .split_first_chunk::<6>()
                .ok_or_else(|| SyncError::Malformed("truncated attribute header".into()))?;
            let tag = u16::from_be_bytes([header[0], header[1]]);
            let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
            if rest.len() < len {
                return Err(SyncError::Malformed(format!("attribute {tag} truncated")));
            }
            let (value, rest) = rest.split_at(len);
            data = rest;
            match tag {
                TAG_CLONE_FLAGS => attrs.clone_flags = i32::from_be_bytes(fixed(tag, value)?),
                TAG_NS_PATHS => {
                    attrs.ns_paths = text(tag, value)?.split(',').map(PathBuf::from).collect();
                }
                TAG_UID_MAP => attrs.uid_map = text(tag, value)?,
                TAG_GID_MAP => attrs.gid_map = text(tag, value)?,
                TAG_UIDMAP_HELPER => attrs.uidmap_helper = Some(text(tag, value)?.into()),
                TAG_GIDMAP_HELPER => attrs.gidmap_helper = Some(text(tag, value)?.into()),
                TAG_SETGROUPS_DENY => attrs.setgroups_deny = value.first() == Some(&1),
                TAG_ROOTLESS => attrs.rootless = value.first() == Some(&1),
                TAG_OOM_SCORE_ADJ => attrs.oom_score_adj = Some(i32::from_be_bytes(fixed(tag, value)?)),
                TAG_TIME_OFFSETS => attrs.time_offsets = text(tag, value)?,
                other => tracing::debug!(tag = other, "skipping unknown bootstrap attribute"),
            }
        }
        Ok(attrs)
    }
}

/// A rootless caller can write a single mapping of its own id; anything
/// else needs a setuid helper.
fn needs_helper(maps: &[IdMap], own_id: u32) -> bool {
    !matches!(maps, [only] if only.host_id == own_id && only.size == 1)
}

fn put(out: &mut Vec<u8>, tag: u16, value: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    let len = value.len() as u32;
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
}

fn put_str(out: &mut Vec<u8>, tag: u16, value: &str) {
    if !value.is_empty() {
        put(out, tag, value.as_bytes());
    }
}

fn fixed(tag: u16, value: &[u8]) -> std::result::Result<[u8; 4], SyncError> {
    value
        .try_into()
        .map_err(|_| SyncError::Malformed(format!("attribute {tag} has {} bytes", value.len())))
}

fn text(tag: u16, value: &[u8]) -> std::result::Result<String, SyncError> {
    String::from_utf8(value.to_vec())
        .map_err(|_| SyncError::Malformed(format!("attribute {tag} is not UTF-8")))
}

/// Messages exchanged with companion stage 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BootstrapType {
    /// Stage 1 created a user namespace and needs its id maps written.
    UsermapRequest,
    /// The supervisor wrote the maps.
    UsermapAck,
    /// Stage 2 exists; carries `{"pid": n}`.
    ChildPid,
    /// Stage 1 failed; carries `{"message": ...}`.
    Error,
}

#[derive(Deserialize)]
struct ChildPidArg {
    pid: i32,
}

/// Reports the pid of stage 2 from stage 1.
///
/// # Errors
///
/// Returns an error if the channel write fails.
pub fn send_child_pid(channel: &mut SyncChannel, pid: i32) -> std::result::Result<(), SyncError> {
    channel.send_typed(BootstrapType::ChildPid, Some(json!({ "pid": pid })))
}

/// Asks the supervisor for id maps from stage 1 and waits for them.
///
/// # Errors
///
/// Returns an error if the supervisor does not acknowledge.
pub fn request_usermap(channel: &mut SyncChannel) -> std::result::Result<(), SyncError> {
    channel.send_typed(BootstrapType::UsermapRequest, None)?;
    match channel.recv_typed::<BootstrapType>()? {
        (BootstrapType::UsermapAck, _) => Ok(()),
        (other, _) => Err(SyncError::Unexpected {
            expected: "usermapAck".into(),
            got: format!("{other:?}"),
        }),
    }
}

/// A freshly spawned companion, before the bootstrap exchange.
#[derive(Debug)]
pub struct Companion {
    /// Stage 1.
    pub child: Child,
    /// Supervisor end of the sync channel.
    pub channel: SyncChannel,
    /// Thread re-emitting the companion's log records.
    pub logs: JoinHandle<usize>,
}

/// Spawns companion stage 1 from `image`, handing it the child end of the
/// sync channel, the write end of a log pipe, and optionally the exec
/// gate. Logs are forwarded on a background thread until the companion
/// closes its end of the pipe.
///
/// # Errors
///
/// Returns an error if a socket, the forwarder, or the process cannot be
/// created.
pub fn spawn_companion(
    image: &CompanionImage,
    gate: Option<BorrowedFd<'_>>,
    log_level: &str,
) -> Result<Companion> {
    let (parent_end, child_end) = SyncChannel::pair()?;
    let (log_read, log_write) =
        UnixStream::pair().map_err(|e| RuntimeError::external("create log pipe", e))?;
    fd::mark_cloexec_from(3)?;

    let child_sync: OwnedFd = child_end.into();
    let child_log: OwnedFd = log_write.into();
    let mut inherited: Vec<RawFd> = vec![child_sync.as_raw_fd(), child_log.as_raw_fd()];

    let mut cmd = Command::new(image.program());
    let _ = cmd
        .arg(INIT_SUBCOMMAND)
        .arg("--sync-fd")
        .arg(child_sync.as_raw_fd().to_string())
        .arg("--log-fd")
        .arg(child_log.as_raw_fd().to_string())
        .arg("--log-level")
        .arg(log_level);
    if let Some(gate) = gate {
        let _ = cmd.arg("--fifo-fd").arg(gate.as_raw_fd().to_string());
        inherited.push(gate.as_raw_fd());
    }
    // SAFETY: the hook only calls fcntl(2), which is async-signal-safe.
    unsafe {
        let _ = cmd.pre_exec(move || {
            for &fd in &inherited {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| RuntimeError::external(format!("spawn companion {}", image.program().display()), e))?;
    drop(child_sync);
    drop(child_log);
    let logs = logs::forward_logs(log_read)?;
    tracing::debug!(pid = child.id(), "companion spawned");
    Ok(Companion {
        child,
        channel: parent_end,
        logs,
    })
}

/// Runs the stage-1 exchange: sends `attrs`, writes id maps on request,
/// and returns the pid of stage 2.
///
/// # Errors
///
/// Returns an error if stage 1 reports a failure, closes the channel
/// early, or the maps cannot be written.
pub fn negotiate(channel: &mut SyncChannel, stage1_pid: i32, attrs: &BootstrapAttributes) -> Result<i32> {
    channel.write_frame(&attrs.encode())?;
    loop {
        let (ty, arg) = match channel.recv_typed::<BootstrapType>() {
            Ok(msg) => msg,
            Err(SyncError::Closed) => {
                return Err(SyncError::Remote("companion exited during bootstrap".into()).into());
            }
            Err(e) => return Err(e.into()),
        };
        match ty {
            BootstrapType::UsermapRequest => {
                write_mappings(stage1_pid, attrs)?;
                channel.send_typed(BootstrapType::UsermapAck, None)?;
            }
            BootstrapType::ChildPid => {
                let arg: ChildPidArg = arg
                    .map(serde_json::from_value)
                    .transpose()?
                    .ok_or_else(|| SyncError::Malformed("childPid without pid".into()))?;
                return Ok(arg.pid);
            }
            BootstrapType::Error => {
                let message = arg
                    .as_ref()
                    .and_then(|v| v.get("message"))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("companion failed without a message");
                return Err(SyncError::Remote(message.to_string()).into());
            }
            BootstrapType::UsermapAck => {
                return Err(SyncError::Unexpected {
                    expected: "childPid".into(),
                    got: "usermapAck".into(),
                }
                .into());
            }
        }
    }
}

fn write_mappings(pid: i32, attrs: &BootstrapAttributes) -> Result<()> {
    if attrs.setgroups_deny {
        user::deny_setgroups(pid)?;
    }
    write_mapping(pid, MapKind::Uid, &attrs.uid_map, attrs.uidmap_helper.as_deref())?;
    write_mapping(pid, MapKind::Gid, &attrs.gid_map, attrs.gidmap_helper.as_deref())?;
    tracing::debug!(pid, "id mappings written");
    Ok(())
}

fn write_mapping(pid: i32, kind: MapKind, encoded: &str, helper: Option<&Path>) -> Result<()> {
    if encoded.is_empty() {
        return Ok(());
    }
    match helper {
        Some(helper) => user::run_mapping_helper(helper, pid, encoded)?,
        None => user::write_id_mapping(pid, kind, encoded)?,
    }
    Ok(())
}

/// Drives the handshake with stage 2 until it closes the channel.
///
/// `on_hooks` runs when the companion asks for prestart hooks. A seccomp
/// notify descriptor is passed on to `seccomp_listener` when one is
/// configured and dropped otherwise.
///
/// # Errors
///
/// Returns an error if the companion reports a failure, a message is out
/// of sequence, the hooks fail, the listener cannot be reached, or the
/// channel closes before `ready`.
pub fn parse_sync(
    channel: &mut SyncChannel,
    seccomp_listener: Option<&Path>,
    mut on_hooks: impl FnMut() -> Result<()>,
) -> Result<()> {
    let mut ready = false;
    loop {
        let msg = match channel.recv() {
            Ok(msg) => msg,
            Err(SyncError::Closed) => break,
            Err(e) => return Err(e.into()),
        };
        match msg.ty {
            SyncType::Hooks if !ready => {
                on_hooks()?;
                channel.send(SyncType::Resume)?;
            }
            SyncType::Ready if !ready => {
                ready = true;
                channel.send(SyncType::Run)?;
            }
            SyncType::Seccomp if ready => {
                match (msg.file, seccomp_listener) {
                    (Some(notify), Some(path)) => {
                        sync::send_to_listener(path, notify.as_fd())?;
                        tracing::debug!(listener = %path.display(), "seccomp notify descriptor handed over");
                    }
                    (Some(_), None) => tracing::debug!("no seccomp listener configured, dropping descriptor"),
                    (None, _) => return Err(SyncError::Malformed("seccomp message without a descriptor".into()).into()),
                }
                channel.send(SyncType::SeccompDone)?;
            }
            SyncType::Error => return Err(SyncError::Remote(msg.error_message()).into()),
            other => {
                return Err(SyncError::Unexpected {
                    expected: if ready { "seccomp" } else { "ready" }.into(),
                    got: other.to_string(),
                }
                .into());
            }
        }
    }
    if ready {
        Ok(())
    } else {
        Err(SyncError::Closed.into())
    }
}

/// Everything needed to take a companion from spawn to its final
/// handshake.
#[derive(Debug)]
pub struct Launch<'a> {
    /// Executable to run the companion from.
    pub image: &'a CompanionImage,
    /// Stage-1 attributes.
    pub attrs: &'a BootstrapAttributes,
    /// Stage-2 configuration.
    pub init_config: &'a InitConfig,
    /// Exec gate to hand over, for init processes.
    pub gate: Option<BorrowedFd<'a>>,
    /// Cgroup stage 1 is placed in before it forks.
    pub cgroup: &'a dyn CgroupHandle,
    /// Log filter for the companion.
    pub log_level: &'a str,
    /// Socket that receives the seccomp notify descriptor.
    pub seccomp_listener: Option<&'a Path>,
}

/// Spawns and bootstraps a companion, returning stage 2.
///
/// `on_hooks` receives the pid of stage 2. On failure every process that
/// was started is killed and reaped. Either way the companion's remaining
/// log records are forwarded before this returns.
///
/// # Errors
///
/// Returns the first error of the spawn, the bootstrap exchange, or the
/// handshake.
pub fn launch(req: &Launch<'_>, mut on_hooks: impl FnMut(i32) -> Result<()>) -> Result<Tracked> {
    let Companion {
        mut child,
        mut channel,
        logs: forwarder,
    } = spawn_companion(req.image, req.gate, req.log_level)?;
    let mut stage2: Option<Tracked> = None;

    let result = (|| -> Result<Tracked> {
        let stage1_pid = i32::try_from(child.id())
            .map_err(|_| RuntimeError::Liveness(format!("companion pid {} out of range", child.id())))?;
        req.cgroup.apply(stage1_pid)?;
        let pid = negotiate(&mut channel, stage1_pid, req.attrs)?;
        let start_time = proc::start_time(pid)
            .ok_or_else(|| RuntimeError::Liveness(format!("companion stage 2 (pid {pid}) vanished")))?;
        let tracked = Tracked::spawned(pid, start_time);
        stage2 = Some(tracked);

        let status = child
            .wait()
            .map_err(|e| RuntimeError::external("reap companion stage 1", e))?;
        if !status.success() {
            return Err(RuntimeError::Liveness(format!("companion stage 1 exited with {status}")));
        }

        channel.send_json(req.init_config)?;
        parse_sync(&mut channel, req.seccomp_listener, || on_hooks(pid))?;
        Ok(tracked)
    })();

    if result.is_err() {
        let _ = child.kill();
        let _ = child.wait();
        if let Some(stage2) = stage2 {
            let _ = ProcessHandle::setns(stage2).terminate();
        }
    }
    drop(channel);
    let _ = logs::drain(forwarder, LOG_DRAIN_ATTEMPTS, POLL_INTERVAL);

    match result {
        Ok(tracked) => {
            tracing::debug!(pid = tracked.pid(), "companion bootstrapped");
            Ok(tracked)
        }
        Err(e) => {
            tracing::warn!(error = %e, "companion bootstrap failed, torn down");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn attributes_survive_encoding() {
        let attrs = BootstrapAttributes {
            clone_flags: libc::CLONE_NEWNS | libc::CLONE_NEWPID,
            ns_paths: vec!["/proc/1/ns/net".into(), "/proc/1/ns/ipc".into()],
            uid_map: "0 1000 1\n".into(),
            gid_map: "0 1000 1\n".into(),
            gidmap_helper: Some("/usr/bin/newgidmap".into()),
            setgroups_deny: true,
            oom_score_adj: Some(-500),
            ..BootstrapAttributes::default()
        };
        assert_eq!(BootstrapAttributes::decode(&attrs.encode()).expect("decode"), attrs);
    }

    #[test]
    fn truncated_attributes_are_malformed() {
        let mut bytes = BootstrapAttributes {
            uid_map: "0 0 1\n".into(),
            ..BootstrapAttributes::default()
        }
        .encode();
        let _ = bytes.pop();
        assert!(matches!(
            BootstrapAttributes::decode(&bytes),
            Err(SyncError::Malformed(_))
        ));
        assert!(matches!(BootstrapAttributes::decode(&[0, 1, 0]), Err(SyncError::Malformed(_))));
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let mut bytes = Vec::new();
        put(&mut bytes, 999, b"future");
        put(&mut bytes, TAG_ROOTLESS, &[1]);
        let attrs = BootstrapAttributes::decode(&bytes).expect("decode");
        assert!(attrs.rootless);
    }

    #[test]
    fn init_attributes_follow_namespace_config() {
        let config = ContainerConfig {
            rootfs: "/".into(),
            namespaces: vec![
                Namespace::new(NamespaceType::Mount),
                Namespace::new(NamespaceType::User),
            ],
            uid_mappings: vec![IdMap::new(0, 100_000, 65536)],
            gid_mappings: vec![IdMap::new(0, 100_000, 65536)],
            ..ContainerConfig::default()
        };
        let attrs = BootstrapAttributes::for_init(&config).expect("attrs");
        assert_eq!(attrs.clone_flags, libc::CLONE_NEWNS | libc::CLONE_NEWUSER);
        assert_eq!(attrs.uid_map, "0 100000 65536\n");
        assert!(attrs.ns_paths.is_empty());
        assert!(!attrs.setgroups_deny);
    }

    #[test]
    fn own_single_id_needs_no_helper() {
        assert!(!needs_helper(&[IdMap::new(0, 1000, 1)], 1000));
        assert!(needs_helper(&[IdMap::new(0, 1000, 2)], 1000));
        assert!(needs_helper(&[IdMap::new(0, 1000, 1), IdMap::new(1, 1001, 1)], 1000));
    }

    #[test]
    fn negotiate_returns_stage_two_pid() {
        let (mut parent, mut child) = SyncChannel::pair().expect("pair");
        let stage1 = thread::spawn(move || {
            let frame = child.read_frame().expect("attrs frame");
            let attrs = BootstrapAttributes::decode(&frame).expect("decode");
            send_child_pid(&mut child, 4242).expect("send pid");
            attrs
        });
        let attrs = BootstrapAttributes {
            rootless: true,
            ..BootstrapAttributes::default()
        };
        assert_eq!(negotiate(&mut parent, 1, &attrs).expect("negotiate"), 4242);
        assert_eq!(stage1.join().expect("join"), attrs);
    }

    #[test]
    fn negotiate_reports_stage_one_failure() {
        let (mut parent, mut child) = SyncChannel::pair().expect("pair");
        let stage1 = thread::spawn(move || {
            let _ = child.read_frame().expect("attrs frame");
            child.send_error("unshare: operation not permitted").expect("send error");
        });
        let err = negotiate(&mut parent, 1, &BootstrapAttributes::default()).expect_err("fails");
        assert!(err.to_string().contains("operation not permitted"));
        stage1.join().expect("join");
    }

    #[test]
    fn handshake_runs_hooks_then_ready() {
        let (mut parent, mut child) = SyncChannel::pair().expect("pair");
        let companion = thread::spawn(move || {
            child.handshake(SyncType::Hooks, SyncType::Resume).expect("hooks");
            child.handshake(SyncType::Ready, SyncType::Run).expect("ready");
        });
        let mut hooks_run = 0;
        parse_sync(&mut parent, None, || {
            hooks_run += 1;
            Ok(())
        })
        .expect("handshake");
        companion.join().expect("join");
        assert_eq!(hooks_run, 1);
    }

    #[test]
    fn seccomp_descriptor_reaches_the_listener() {
        use std::io::{Read, Seek, SeekFrom, Write};
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("agent.sock");
        let agent = UnixListener::bind(&socket).expect("bind");

        let (mut parent, mut child) = SyncChannel::pair().expect("pair");
        let companion = thread::spawn(move || {
            let mut notify = tempfile::tempfile().expect("tempfile");
            notify.write_all(b"notify-fd").expect("write");
            child.handshake(SyncType::Ready, SyncType::Run).expect("ready");
            child.send_with_fd(SyncType::Seccomp, notify.as_fd()).expect("send fd");
            let _ = child.expect(SyncType::SeccompDone).expect("seccomp done");
        });
        parse_sync(&mut parent, Some(&socket), || Ok(())).expect("handshake");
        companion.join().expect("join");

        let (stream, _) = agent.accept().expect("accept");
        let received = sync::recv_fd(stream.as_raw_fd()).expect("descriptor");
        let mut file = std::fs::File::from(received);
        let _ = file.seek(SeekFrom::Start(0)).expect("seek");
        let mut content = String::new();
        let _ = file.read_to_string(&mut content).expect("read");
        assert_eq!(content, "notify-fd");
    }

    #[test]
    fn unreachable_listener_fails_the_handshake() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("missing.sock");
        let (mut parent, mut child) = SyncChannel::pair().expect("pair");
        let companion = thread::spawn(move || {
            let notify = tempfile::tempfile().expect("tempfile");
            child.handshake(SyncType::Ready, SyncType::Run).expect("ready");
            child.send_with_fd(SyncType::Seccomp, notify.as_fd()).expect("send fd");
        });
        let err = parse_sync(&mut parent, Some(&socket), || Ok(())).expect_err("no agent");
        assert!(matches!(err, RuntimeError::Synchronization(SyncError::Io(_))));
        companion.join().expect("join");
    }

    #[test]
    fn close_before_ready_is_premature() {
        let (mut parent, child) = SyncChannel::pair().expect("pair");
        drop(child);
        let err = parse_sync(&mut parent, None, || Ok(())).expect_err("premature close");
        assert!(matches!(err, RuntimeError::Synchronization(SyncError::Closed)));
    }

    #[test]
    fn second_ready_is_out_of_sequence() {
        let (mut parent, mut child) = SyncChannel::pair().expect("pair");
        let companion = thread::spawn(move || {
            child.handshake(SyncType::Ready, SyncType::Run).expect("ready");
            child.send(SyncType::Ready).expect("send");
        });
        let err = parse_sync(&mut parent, None, || Ok(())).expect_err("out of sequence");
        assert!(matches!(
            err,
            RuntimeError::Synchronization(SyncError::Unexpected { .. })
        ));
        companion.join().expect("join");
    }

    #[test]
    fn companion_error_is_remote() {
        let (mut parent, mut child) = SyncChannel::pair().expect("pair");
        child.send_error("pivot_root: invalid argument").expect("send");
        let err = parse_sync(&mut parent, None, || Ok(())).expect_err("remote");
        assert!(matches!(
            err,
            RuntimeError::Synchronization(SyncError::Remote(ref m)) if m.contains("pivot_root")
        ));
    }
}
