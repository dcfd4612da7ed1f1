//! `berth run` — Create and start a container in one step.

use std::path::PathBuf;
use std::process::ExitCode;

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use berth_runtime::process::ContainerProcess;
use clap::Args;

use super::ProcessArgs;
use crate::output;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container id; generated when omitted.
    #[arg(value_parser = super::parse_id)]
    pub id: Option<ContainerId>,

    /// Path to the container configuration (JSON).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Print the init pid and return instead of waiting for it.
    #[arg(short, long)]
    pub detach: bool,

    /// Init process.
    #[command(flatten)]
    pub process: ProcessArgs,
}

/// Executes the `run` command.
///
/// In the foreground the command waits for init, removes the container,
/// and exits with init's status.
///
/// # Errors
///
/// Returns an error if the container cannot be created or started.
pub fn execute(args: RunArgs, factory: &Factory) -> anyhow::Result<ExitCode> {
    let config = super::load_config(&args.config)?;
    let id = args.id.unwrap_or_else(ContainerId::generate);
    let container = factory.create(&id, config)?;
    let handle = match container.run(&args.process.into_process(true)) {
        Ok(handle) => handle,
        Err(e) => {
            let _ = berth_runtime::signal::kill(&container);
            if let Err(cleanup) = container.destroy() {
                tracing::warn!(id = %id, error = %cleanup, "could not remove failed container");
            }
            return Err(e.into());
        }
    };
    if args.detach {
        println!("{id} {}", handle.pid());
        return Ok(ExitCode::SUCCESS);
    }

    let exit = handle.wait()?;
    tracing::info!(id = %id, code = exit.code(), "init exited");
    container.destroy()?;
    Ok(ExitCode::from(output::exit_status_byte(exit)))
}
