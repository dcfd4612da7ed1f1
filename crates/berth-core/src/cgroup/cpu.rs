//! CPU controller for cgroups v2.

use std::path::Path;

use berth_common::error::Result;

use super::{reset_control, write_control};

/// Kernel default for `cpu.weight`.
pub const DEFAULT_CPU_WEIGHT: u64 = 100;

/// Kernel default bandwidth period in microseconds.
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

/// Sets the CPU weight for a cgroup, or resets it to the default.
///
/// # Errors
///
/// Returns an error if the cgroup file cannot be written.
pub fn set_cpu_weight(cgroup_path: &Path, weight: Option<u64>) -> Result<()> {
    match weight {
        Some(weight) => {
            write_control(cgroup_path, "cpu.weight", &weight.to_string())?;
            tracing::debug!(weight, "set cpu.weight");
            Ok(())
        }
        None => reset_control(cgroup_path, "cpu.weight", &DEFAULT_CPU_WEIGHT.to_string()),
    }
}

/// Sets the CPU bandwidth limit (`cpu.max`), or removes it.
///
/// # Errors
///
/// Returns an error if the cgroup file cannot be written.
pub fn set_cpu_max(cgroup_path: &Path, quota_us: Option<u64>, period_us: Option<u64>) -> Result<()> {
    let period = period_us.unwrap_or(DEFAULT_CPU_PERIOD_US);
    match quota_us {
        Some(quota) => {
            write_control(cgroup_path, "cpu.max", &format!("{quota} {period}"))?;
            tracing::debug!(quota, period, "set cpu.max");
            Ok(())
        }
        None => reset_control(cgroup_path, "cpu.max", &format!("max {period}")),
    }
}
