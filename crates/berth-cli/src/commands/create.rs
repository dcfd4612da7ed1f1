//! `berth create` — Create a container and stop it at the exec gate.

use std::path::PathBuf;

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use berth_runtime::process::ContainerProcess;
use clap::Args;

use super::ProcessArgs;

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container id; generated when omitted.
    #[arg(value_parser = super::parse_id)]
    pub id: Option<ContainerId>,

    /// Path to the container configuration (JSON).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Init process.
    #[command(flatten)]
    pub process: ProcessArgs,
}

/// Executes the `create` command.
///
/// A container whose init fails to start is removed again.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the id is taken, or
/// the init process cannot be started.
pub fn execute(args: CreateArgs, factory: &Factory) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;
    let id = args.id.unwrap_or_else(ContainerId::generate);
    let container = factory.create(&id, config)?;
    let handle = match container.start(&args.process.into_process(true)) {
        Ok(handle) => handle,
        Err(e) => {
            if let Err(cleanup) = container.destroy() {
                tracing::warn!(id = %id, error = %cleanup, "could not remove failed container");
            }
            return Err(e.into());
        }
    };
    println!("{id} {}", handle.pid());
    Ok(())
}
