//! Time namespace offsets.
//!
//! Offsets must be written to `/proc/self/timens_offsets` after
//! `unshare(CLONE_NEWTIME)` and before the first child enters the
//! namespace.

use std::collections::BTreeMap;

use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

const OFFSETS_PATH: &str = "/proc/self/timens_offsets";

/// Clock offset applied inside a time namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOffset {
    /// Whole seconds.
    pub secs: i64,
    /// Nanoseconds (0-999999999).
    pub nanosecs: u32,
}

/// Encodes offsets keyed by clock name (`monotonic`, `boottime`).
///
/// # Errors
///
/// Returns an error for unknown clocks or out-of-range nanoseconds.
pub fn encode_time_offsets(offsets: &BTreeMap<String, TimeOffset>) -> Result<String> {
    let mut out = String::new();
    for (clock, offset) in offsets {
        if clock != "monotonic" && clock != "boottime" {
            return Err(BerthError::config(format!("unknown time namespace clock {clock:?}")));
        }
        if offset.nanosecs >= 1_000_000_000 {
            return Err(BerthError::config(format!(
                "time offset for {clock} has {} nanoseconds",
                offset.nanosecs
            )));
        }
        out.push_str(&format!("{clock} {} {}\n", offset.secs, offset.nanosecs));
    }
    Ok(out)
}

/// Writes encoded offsets for the calling process's new time namespace.
///
/// # Errors
///
/// Returns an error if `timens_offsets` cannot be written.
pub fn write_time_offsets(encoded: &str) -> Result<()> {
    if encoded.is_empty() {
        return Ok(());
    }
    std::fs::write(OFFSETS_PATH, encoded).map_err(|e| BerthError::io(OFFSETS_PATH, e))?;
    tracing::debug!("time namespace offsets written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_clocks() {
        let mut offsets = BTreeMap::new();
        let _ = offsets.insert(
            "boottime".to_string(),
            TimeOffset {
                secs: 3600,
                nanosecs: 0,
            },
        );
        let _ = offsets.insert(
            "monotonic".to_string(),
            TimeOffset {
                secs: -5,
                nanosecs: 10,
            },
        );
        let encoded = encode_time_offsets(&offsets).expect("encode");
        assert_eq!(encoded, "boottime 3600 0\nmonotonic -5 10\n");
    }

    #[test]
    fn rejects_unknown_clock() {
        let mut offsets = BTreeMap::new();
        let _ = offsets.insert("realtime".to_string(), TimeOffset::default());
        assert!(encode_time_offsets(&offsets).is_err());
    }
}
