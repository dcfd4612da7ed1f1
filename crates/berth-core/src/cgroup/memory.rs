//! Memory controller for cgroups v2.

use std::path::Path;

use berth_common::error::Result;

use super::{reset_control, write_control};

/// Sets the hard memory limit (`memory.max`), or removes it.
///
/// # Errors
///
/// Returns an error if the cgroup file cannot be written.
pub fn set_memory_max(cgroup_path: &Path, bytes: Option<u64>) -> Result<()> {
    match bytes {
        Some(bytes) => {
            write_control(cgroup_path, "memory.max", &bytes.to_string())?;
            tracing::debug!(bytes, "set memory.max");
            Ok(())
        }
        None => reset_control(cgroup_path, "memory.max", "max"),
    }
}
