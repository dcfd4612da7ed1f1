//! `berth kill` — Send a signal to a container.

use std::str::FromStr;

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use clap::Args;
use nix::sys::signal::Signal;

/// Arguments for the `kill` command.
#[derive(Args, Debug)]
pub struct KillArgs {
    /// Container id.
    #[arg(value_parser = super::parse_id)]
    pub id: ContainerId,

    /// Signal name (`TERM`, `SIGTERM`) or number.
    #[arg(default_value = "SIGTERM", value_parser = parse_signal)]
    pub signal: Signal,
}

/// Executes the `kill` command.
///
/// `SIGKILL` also waits for the container to stop.
///
/// # Errors
///
/// Returns an error if the container is not running or survives
/// `SIGKILL`.
pub fn execute(args: &KillArgs, factory: &Factory) -> anyhow::Result<()> {
    let container = factory.load(&args.id)?;
    if args.signal == Signal::SIGKILL {
        berth_runtime::signal::kill(&container)?;
    } else {
        container.signal(args.signal)?;
    }
    Ok(())
}

fn parse_signal(s: &str) -> Result<Signal, String> {
    if let Ok(number) = s.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| format!("unknown signal {number}"));
    }
    let upper = s.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| format!("unknown signal {s:?}"))
}
