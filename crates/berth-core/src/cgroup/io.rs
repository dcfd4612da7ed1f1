//! I/O controller for cgroups v2.

use std::path::Path;

use berth_common::error::Result;

use super::{reset_control, write_control};

/// Sets the default I/O weight (`io.weight`), or resets it to 100.
///
/// # Errors
///
/// Returns an error if the cgroup file cannot be written.
pub fn set_io_weight(cgroup_path: &Path, weight: Option<u16>) -> Result<()> {
    match weight {
        Some(weight) => {
            write_control(cgroup_path, "io.weight", &format!("default {weight}"))?;
            tracing::debug!(weight, "set io.weight");
            Ok(())
        }
        None => reset_control(cgroup_path, "io.weight", "default 100"),
    }
}
