//! `berth init` — Companion entry point.
//!
//! Started by the runtime itself with the descriptors it prepared; never
//! meant to be typed by hand.

use std::os::fd::RawFd;
use std::process::ExitCode;

use berth_runtime::init::InitArgs;
use clap::Args;

/// Arguments for the hidden `init` command.
#[derive(Args, Debug)]
pub struct InitCommandArgs {
    /// Child end of the sync channel.
    #[arg(long)]
    pub sync_fd: RawFd,

    /// Write end of the log pipe.
    #[arg(long)]
    pub log_fd: RawFd,

    /// Exec gate descriptor, for init processes.
    #[arg(long)]
    pub fifo_fd: Option<RawFd>,
}

/// Runs the companion. Returns only if it fails or after stage 1 has
/// handed over to stage 2.
pub fn execute(args: &InitCommandArgs, log_level: &str) -> ExitCode {
    let code = berth_runtime::init::main(&InitArgs {
        sync_fd: args.sync_fd,
        log_fd: args.log_fd,
        fifo_fd: args.fifo_fd,
        log_level: log_level.to_string(),
    });
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
