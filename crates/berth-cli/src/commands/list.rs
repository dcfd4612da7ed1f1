//! `berth list` — List containers.

use berth_runtime::factory::Factory;
use berth_runtime::state::State;
use clap::Args;

use crate::output::{self, OutputFormat};

/// Arguments for the `list` command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Executes the `list` command.
///
/// Containers whose state cannot be loaded are skipped with a warning.
///
/// # Errors
///
/// Returns an error if the root directory cannot be read.
pub fn execute(args: &ListArgs, factory: &Factory) -> anyhow::Result<()> {
    let mut states: Vec<State> = Vec::new();
    for id in factory.list()? {
        match factory.load(&id).and_then(|container| container.state()) {
            Ok(state) => states.push(state),
            Err(e) => tracing::warn!(id = %id, error = %e, "skipping container"),
        }
    }
    match args.format {
        OutputFormat::Json => output::print_json(&states),
        OutputFormat::Table => {
            output::print_state_table(&states);
            Ok(())
        }
    }
}
