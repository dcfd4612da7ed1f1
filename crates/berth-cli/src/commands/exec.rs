//! `berth exec` — Run an additional process inside a running container.

use std::process::ExitCode;

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use berth_runtime::process::ContainerProcess;
use clap::Args;

use super::ProcessArgs;
use crate::output;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container id.
    #[arg(value_parser = super::parse_id)]
    pub id: ContainerId,

    /// Print the process pid and return instead of waiting for it.
    #[arg(short, long)]
    pub detach: bool,

    /// Process to run.
    #[command(flatten)]
    pub process: ProcessArgs,
}

/// Executes the `exec` command and exits with the process's status.
///
/// # Errors
///
/// Returns an error if the container is not running or the process
/// cannot be started.
pub fn execute(args: ExecArgs, factory: &Factory) -> anyhow::Result<ExitCode> {
    let container = factory.load(&args.id)?;
    let handle = container.start(&args.process.into_process(false))?;
    if args.detach {
        println!("{}", handle.pid());
        return Ok(ExitCode::SUCCESS);
    }
    let exit = handle.wait()?;
    Ok(ExitCode::from(output::exit_status_byte(exit)))
}
