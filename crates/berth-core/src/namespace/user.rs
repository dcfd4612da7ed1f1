//! User namespace isolation.
//!
//! Maps container UIDs/GIDs to host UIDs/GIDs. The mapping files of a
//! process can only be written from outside its user namespace, so this
//! module is used by the privileged parent on behalf of the companion.

use std::path::{Path, PathBuf};
use std::process::Command;

use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

/// One line of a `uid_map` or `gid_map` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First id inside the namespace.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of consecutive ids mapped.
    pub size: u32,
}

impl IdMap {
    /// Maps `size` ids starting at `container_id` onto `host_id`.
    #[must_use]
    pub const fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }
}

/// Kind of mapping file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// `/proc/<pid>/uid_map`.
    Uid,
    /// `/proc/<pid>/gid_map`.
    Gid,
}

impl MapKind {
    const fn file_name(self) -> &'static str {
        match self {
            Self::Uid => "uid_map",
            Self::Gid => "gid_map",
        }
    }

    const fn helper_name(self) -> &'static str {
        match self {
            Self::Uid => "newuidmap",
            Self::Gid => "newgidmap",
        }
    }
}

/// Encodes mappings in the kernel's `uid_map` line format.
#[must_use]
pub fn encode_id_mappings(maps: &[IdMap]) -> String {
    maps.iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

/// Parses the kernel's `uid_map` line format.
///
/// # Errors
///
/// Returns an error if a line does not hold exactly three integers.
pub fn decode_id_mappings(data: &str) -> Result<Vec<IdMap>> {
    data.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<u32> = line
                .split_whitespace()
                .map(str::parse)
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| BerthError::config(format!("invalid id mapping line {line:?}")))?;
            match fields.as_slice() {
                [container_id, host_id, size] => Ok(IdMap::new(*container_id, *host_id, *size)),
                _ => Err(BerthError::config(format!("invalid id mapping line {line:?}"))),
            }
        })
        .collect()
}

/// Returns the id a container-side id maps to on the host, if any.
#[must_use]
pub fn host_id_for(maps: &[IdMap], container_id: u32) -> Option<u32> {
    maps.iter().find_map(|m| {
        let offset = container_id.checked_sub(m.container_id)?;
        (offset < m.size).then(|| m.host_id + offset)
    })
}

/// Writes an encoded mapping to `/proc/<pid>/{uid,gid}_map`.
///
/// # Errors
///
/// Returns an error if the mapping file cannot be written.
pub fn write_id_mapping(pid: i32, kind: MapKind, encoded: &str) -> Result<()> {
    if encoded.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(format!("/proc/{pid}/{}", kind.file_name()));
    std::fs::write(&path, encoded).map_err(|e| BerthError::io(&path, e))?;
    tracing::debug!(pid, file = kind.file_name(), "wrote id mapping");
    Ok(())
}

/// Writes `deny` to `/proc/<pid>/setgroups`.
///
/// Required before an unprivileged writer may set `gid_map`.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be written.
pub fn deny_setgroups(pid: i32) -> Result<()> {
    let path = PathBuf::from(format!("/proc/{pid}/setgroups"));
    match std::fs::write(&path, "deny") {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BerthError::io(path, e)),
    }
}

/// Writes a mapping through a setuid helper such as `newuidmap`.
///
/// Rootless callers cannot write arbitrary mappings themselves; the
/// helper checks `/etc/subuid` and writes them on their behalf.
///
/// # Errors
///
/// Returns an error if the helper cannot be spawned or exits non-zero.
pub fn run_mapping_helper(helper: &Path, pid: i32, encoded: &str) -> Result<()> {
    let mut cmd = Command::new(helper);
    let _ = cmd.arg(pid.to_string());
    for field in encoded.split_whitespace() {
        let _ = cmd.arg(field);
    }
    let output = cmd.output().map_err(|e| BerthError::io(helper, e))?;
    if !output.status.success() {
        return Err(BerthError::PermissionDenied {
            message: format!(
                "{} failed ({}): {}",
                helper.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    tracing::debug!(pid, helper = %helper.display(), "mapping helper succeeded");
    Ok(())
}

/// Locates the mapping helper binary for `kind` on `$PATH`.
#[must_use]
pub fn find_mapping_helper(kind: MapKind) -> Option<PathBuf> {
    which::which(kind.helper_name()).ok()
}
