//! `berth ps` — List the processes of a container.

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use clap::Args;

use crate::output::{self, OutputFormat};

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Container id.
    #[arg(value_parser = super::parse_id)]
    pub id: ContainerId,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or its cgroup cannot be
/// read.
pub fn execute(args: &PsArgs, factory: &Factory) -> anyhow::Result<()> {
    let pids = factory.load(&args.id)?.processes()?;
    match args.format {
        OutputFormat::Json => output::print_json(&pids),
        OutputFormat::Table => {
            println!("PID");
            for pid in pids {
                println!("{pid}");
            }
            Ok(())
        }
    }
}
