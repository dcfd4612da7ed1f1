//! `berth start` — Run the user program of a created container.

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use clap::Args;

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container id.
    #[arg(value_parser = super::parse_id)]
    pub id: ContainerId,
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or not created.
pub fn execute(args: &StartArgs, factory: &Factory) -> anyhow::Result<()> {
    factory.load(&args.id)?.exec()?;
    Ok(())
}
