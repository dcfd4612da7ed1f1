//! Pids controller for cgroups v2.

use std::path::Path;

use berth_common::error::Result;

use super::{reset_control, write_control};

/// Sets the task limit (`pids.max`), or removes it.
///
/// # Errors
///
/// Returns an error if the cgroup file cannot be written.
pub fn set_pids_max(cgroup_path: &Path, max: Option<u64>) -> Result<()> {
    match max {
        Some(max) => {
            write_control(cgroup_path, "pids.max", &max.to_string())?;
            tracing::debug!(max, "set pids.max");
            Ok(())
        }
        None => reset_control(cgroup_path, "pids.max", "max"),
    }
}
