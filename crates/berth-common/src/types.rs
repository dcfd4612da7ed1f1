//! Domain primitive types used across the berth workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};

/// Unique identifier for a container instance.
///
/// Ids name a directory under the runtime root, so they are restricted to
/// `[A-Za-z0-9_+.-]` and may not be `.` or `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID, validating that it is safe to use as a
    /// directory name.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Config`] if the id is empty, `.`/`..`, or
    /// contains characters outside `[A-Za-z0-9_+.-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '.' | '-'));
        if id.is_empty() || id == "." || id == ".." || !valid_chars {
            return Err(BerthError::config(format!("invalid container id: {id:?}")));
        }
        Ok(Self(id))
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = BerthError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

/// Lifecycle state of a container.
///
/// `Restored` is transient: it is entered after a checkpoint restore and
/// resolves to `Running` or `Stopped` on the next reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The companion is blocked on the exec gate; the user program has not
    /// started yet.
    Created,
    /// The user program is running.
    Running,
    /// All processes in the container's cgroup are frozen.
    Paused,
    /// The init process is gone (or was never started).
    Stopped,
    /// The init process was just brought back by a checkpoint engine.
    Restored,
}

impl ContainerStatus {
    /// Externally visible status string.
    ///
    /// A restored container reports `running`, matching what the process
    /// actually does.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running | Self::Restored => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restored => f.write_str("restored"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Freezer state of a cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezerState {
    /// Processes run normally.
    Thawed,
    /// Processes are frozen.
    Frozen,
}

/// Smallest memory limit the kernel reliably accepts for a container.
pub const MIN_MEMORY_BYTES: u64 = 6 * 1024 * 1024;

/// Resource limits for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU weight (1-10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_weight: Option<u64>,
    /// CPU bandwidth quota in microseconds per `cpu_period_us`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_quota_us: Option<u64>,
    /// CPU bandwidth period in microseconds (defaults to 100000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_period_us: Option<u64>,
    /// Memory limit in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    /// I/O weight (1-10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_weight: Option<u16>,
    /// Maximum number of tasks in the cgroup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_max: Option<u64>,
}

impl ResourceLimits {
    /// Checks that every set limit is within the range the kernel accepts.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Config`] naming the first offending limit.
    pub fn validate(&self) -> Result<()> {
        if let Some(weight) = self.cpu_weight {
            if !(1..=10_000).contains(&weight) {
                return Err(BerthError::config(format!(
                    "cpu weight {weight} out of range 1-10000"
                )));
            }
        }
        if let Some(weight) = self.io_weight {
            if !(1..=10_000).contains(&weight) {
                return Err(BerthError::config(format!(
                    "io weight {weight} out of range 1-10000"
                )));
            }
        }
        if let Some(mem) = self.memory_bytes {
            if mem < MIN_MEMORY_BYTES {
                return Err(BerthError::config(format!(
                    "memory limit {mem} is below the minimum of {MIN_MEMORY_BYTES} bytes"
                )));
            }
        }
        if self.pids_max == Some(0) {
            return Err(BerthError::config("pids limit must be at least 1"));
        }
        if self.cpu_period_us == Some(0) {
            return Err(BerthError::config("cpu period must be non-zero"));
        }
        if self.cpu_period_us.is_some() && self.cpu_quota_us.is_none() {
            return Err(BerthError::config("cpu period set without a cpu quota"));
        }
        Ok(())
    }

    /// Returns `true` if no limit is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cpu_weight.is_none()
            && self.cpu_quota_us.is_none()
            && self.cpu_period_us.is_none()
            && self.memory_bytes.is_none()
            && self.io_weight.is_none()
            && self.pids_max.is_none()
    }
}
