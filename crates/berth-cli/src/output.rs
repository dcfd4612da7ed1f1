//! Formatted output helpers for CLI commands.
//!
//! Provides the container table, JSON printing, and exit status mapping.

use berth_runtime::process::ExitState;
use berth_runtime::state::State;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::Serialize;

/// Output format of listing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Aligned columns.
    Table,
    /// Pretty-printed JSON.
    Json,
}

/// Prints `value` as pretty JSON on stdout.
///
/// # Errors
///
/// Returns an error if `value` cannot be serialized.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints one row per container.
pub fn print_state_table(states: &[State]) {
    println!("{:<24} {:<8} {:<10} {:<22} ROOTFS", "ID", "PID", "STATUS", "CREATED");
    for state in states {
        println!(
            "{:<24} {:<8} {:<10} {:<22} {}",
            state.id.as_str(),
            format_pid(state.pid),
            state.status.as_str(),
            format_created(state.created),
            state.rootfs.display()
        );
    }
}

/// Formats an optional pid, `-` when absent.
#[must_use]
pub fn format_pid(pid: Option<i32>) -> String {
    pid.map_or_else(|| "-".to_string(), |p| p.to_string())
}

/// Formats a creation time as RFC 3339 with second precision.
#[must_use]
pub fn format_created(created: DateTime<Utc>) -> String {
    created.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The process exit status a shell would report for `exit`.
#[must_use]
pub fn exit_status_byte(exit: ExitState) -> u8 {
    u8::try_from(exit.code()).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use nix::sys::signal::Signal;

    use super::*;

    #[test]
    fn format_pid_uses_dash_when_absent() {
        assert_eq!(format_pid(None), "-");
        assert_eq!(format_pid(Some(42)), "42");
    }

    #[test]
    fn format_created_drops_subseconds() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).single().expect("time");
        assert_eq!(format_created(ts), "2024-05-01T12:30:00Z");
    }

    #[test]
    fn exit_status_follows_shell_convention() {
        assert_eq!(exit_status_byte(ExitState::Exited(3)), 3);
        assert_eq!(exit_status_byte(ExitState::Signaled(Signal::SIGKILL)), 137);
        assert_eq!(exit_status_byte(ExitState::Unknown), 255);
    }
}
