//! `berth pause` — Freeze every process of a container.

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use clap::Args;

/// Arguments for the `pause` command.
#[derive(Args, Debug)]
pub struct PauseArgs {
    /// Container id.
    #[arg(value_parser = super::parse_id)]
    pub id: ContainerId,
}

/// Executes the `pause` command.
///
/// # Errors
///
/// Returns an error unless the container is running or created.
pub fn execute(args: &PauseArgs, factory: &Factory) -> anyhow::Result<()> {
    factory.load(&args.id)?.pause()?;
    Ok(())
}
