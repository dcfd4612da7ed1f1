//! Cgroup v2 freezer.
//!
//! Writing `cgroup.freeze` only requests the transition; the kernel reports
//! completion through the `frozen` key of `cgroup.events`.

use std::path::Path;
use std::time::{Duration, Instant};

use berth_common::error::{BerthError, Result};
use berth_common::types::FreezerState;

use super::write_control;

const FREEZE_TIMEOUT: Duration = Duration::from_secs(2);
const FREEZE_POLL: Duration = Duration::from_millis(10);

/// Drives the cgroup at `cgroup_path` to `state` and waits for the kernel to
/// confirm it.
///
/// # Errors
///
/// Returns an error if `cgroup.freeze` cannot be written or the transition
/// is not confirmed before the timeout.
pub fn set_state(cgroup_path: &Path, state: FreezerState) -> Result<()> {
    let value = match state {
        FreezerState::Frozen => "1",
        FreezerState::Thawed => "0",
    };
    write_control(cgroup_path, "cgroup.freeze", value)?;

    let events = cgroup_path.join("cgroup.events");
    if !events.exists() {
        tracing::debug!(?state, path = %cgroup_path.display(), "freezer updated");
        return Ok(());
    }

    let expected = format!("frozen {value}");
    let deadline = Instant::now() + FREEZE_TIMEOUT;
    loop {
        let content = std::fs::read_to_string(&events).map_err(|e| BerthError::io(&events, e))?;
        if content.lines().any(|line| line.trim() == expected) {
            tracing::debug!(?state, path = %cgroup_path.display(), "freezer updated");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(BerthError::config(format!(
                "cgroup {} did not reach {state:?} in time",
                cgroup_path.display()
            )));
        }
        std::thread::sleep(FREEZE_POLL);
    }
}

/// Reads the requested freezer state. A cgroup without a freezer file is
/// reported as thawed.
///
/// # Errors
///
/// Returns an error if `cgroup.freeze` exists but cannot be read.
pub fn state(cgroup_path: &Path) -> Result<FreezerState> {
    let file = cgroup_path.join("cgroup.freeze");
    match std::fs::read_to_string(&file) {
        Ok(content) if content.trim() == "1" => Ok(FreezerState::Frozen),
        Ok(_) => Ok(FreezerState::Thawed),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FreezerState::Thawed),
        Err(e) => Err(BerthError::io(file, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_freezer_is_thawed() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(state(dir.path()).expect("state"), FreezerState::Thawed);
    }

    #[test]
    fn freeze_then_thaw_without_events_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        set_state(dir.path(), FreezerState::Frozen).expect("freeze");
        assert_eq!(state(dir.path()).expect("state"), FreezerState::Frozen);
        set_state(dir.path(), FreezerState::Thawed).expect("thaw");
        assert_eq!(state(dir.path()).expect("state"), FreezerState::Thawed);
    }

    #[test]
    fn freeze_waits_for_events_confirmation() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.events"), "populated 1\nfrozen 1\n").expect("seed");
        set_state(dir.path(), FreezerState::Frozen).expect("freeze");
    }

    #[test]
    fn unconfirmed_freeze_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.events"), "populated 1\nfrozen 0\n").expect("seed");
        assert!(set_state(dir.path(), FreezerState::Frozen).is_err());
    }
}
