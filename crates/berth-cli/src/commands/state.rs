//! `berth state` — Print the state of a container as JSON.

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use clap::Args;

use crate::output;

/// Arguments for the `state` command.
#[derive(Args, Debug)]
pub struct StateArgs {
    /// Container id.
    #[arg(value_parser = super::parse_id)]
    pub id: ContainerId,
}

/// Executes the `state` command.
///
/// # Errors
///
/// Returns an error if the container is unknown.
pub fn execute(args: &StateArgs, factory: &Factory) -> anyhow::Result<()> {
    let state = factory.load(&args.id)?.state()?;
    output::print_json(&state)
}
