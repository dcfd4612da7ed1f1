//! Lifecycle hooks.
//!
//! Each hook is an external command that receives the container state as
//! JSON on stdin. Prestart hooks run in the runtime namespace while the
//! companion is paused inside rootfs setup; poststart hooks run after the
//! exec gate is released; poststop hooks run on destroy.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use berth_common::error::BerthError;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::state::State;

const HOOK_POLL: Duration = Duration::from_millis(10);

/// A single hook command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    /// Absolute path of the executable.
    pub path: PathBuf,
    /// Full argv, including `argv[0]`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment as `KEY=value` strings; the runtime's own environment
    /// is not inherited.
    #[serde(default)]
    pub env: Vec<String>,
    /// Seconds before the hook is killed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Hooks grouped by lifecycle point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hooks {
    /// Run after namespaces exist, before `pivot_root`.
    pub prestart: Vec<Hook>,
    /// Run after the user program has been released.
    pub poststart: Vec<Hook>,
    /// Run after the container is destroyed.
    pub poststop: Vec<Hook>,
}

impl Hook {
    /// Runs the hook with `state` on stdin and waits for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the hook cannot be spawned, exits non-zero, or
    /// outlives its timeout.
    pub fn run(&self, state: &State) -> Result<()> {
        let input = serde_json::to_vec(state)?;

        let mut cmd = Command::new(&self.path);
        if let Some((argv0, rest)) = self.args.split_first() {
            let _ = cmd.arg0(argv0).args(rest);
        }
        let _ = cmd.env_clear();
        for var in &self.env {
            if let Some((key, value)) = var.split_once('=') {
                let _ = cmd.env(key, value);
            }
        }
        let _ = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| BerthError::io(&self.path, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A hook that ignores its input may exit before reading it.
            if let Err(e) = stdin.write_all(&input) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(BerthError::io(&self.path, e).into());
                }
            }
        }

        let deadline = self.timeout.map(|secs| Instant::now() + Duration::from_secs(secs));
        let status = loop {
            if let Some(status) = child.try_wait().map_err(|e| BerthError::io(&self.path, e))? {
                break status;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeError::external(
                    format!("hook {}", self.path.display()),
                    format!("timed out after {}s", self.timeout.unwrap_or_default()),
                ));
            }
            std::thread::sleep(HOOK_POLL);
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = std::io::Read::read_to_string(&mut pipe, &mut stderr);
            }
            return Err(RuntimeError::external(
                format!("hook {}", self.path.display()),
                format!("{status}: {}", stderr.trim()),
            ));
        }
        tracing::debug!(hook = %self.path.display(), "hook succeeded");
        Ok(())
    }
}

/// Runs `hooks` in order, stopping at the first failure.
///
/// # Errors
///
/// Returns the first hook's error.
pub fn run_hooks(stage: &str, hooks: &[Hook], state: &State) -> Result<()> {
    for hook in hooks {
        tracing::info!(id = %state.id, stage, hook = %hook.path.display(), "running hook");
        hook.run(state)?;
    }
    Ok(())
}
