//! `berth delete` — Remove a stopped container.

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use clap::Args;

/// Arguments for the `delete` command.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Container id.
    #[arg(value_parser = super::parse_id)]
    pub id: ContainerId,

    /// Kill the container first if it is still running.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `delete` command.
///
/// # Errors
///
/// Returns an error if the container is not stopped (without `--force`)
/// or its resources cannot be released.
pub fn execute(args: &DeleteArgs, factory: &Factory) -> anyhow::Result<()> {
    let container = factory.load(&args.id)?;
    if args.force {
        berth_runtime::signal::kill(&container)?;
    }
    container.destroy()?;
    tracing::info!(id = %args.id, "container deleted");
    Ok(())
}
