//! `berth update` — Change the resource limits of a container.

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use clap::Args;

/// Arguments for the `update` command.
#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Container id.
    #[arg(value_parser = super::parse_id)]
    pub id: ContainerId,

    /// Memory limit in bytes.
    #[arg(long)]
    pub memory: Option<u64>,

    /// CPU weight (1-10000).
    #[arg(long)]
    pub cpu_weight: Option<u64>,

    /// IO weight (1-10000).
    #[arg(long)]
    pub io_weight: Option<u16>,

    /// Maximum number of processes.
    #[arg(long)]
    pub pids: Option<u64>,
}

/// Executes the `update` command. Limits not given on the command line
/// keep their current value.
///
/// # Errors
///
/// Returns an error if the limits are invalid or cannot be applied; the
/// previous limits stay in effect.
pub fn execute(args: &UpdateArgs, factory: &Factory) -> anyhow::Result<()> {
    let container = factory.load(&args.id)?;
    let mut limits = container.state()?.config.resources;
    limits.memory_bytes = args.memory.or(limits.memory_bytes);
    limits.cpu_weight = args.cpu_weight.or(limits.cpu_weight);
    limits.io_weight = args.io_weight.or(limits.io_weight);
    limits.pids_max = args.pids.or(limits.pids_max);
    container.set(limits)?;
    Ok(())
}
