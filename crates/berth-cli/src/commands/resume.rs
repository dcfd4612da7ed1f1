//! `berth resume` — Thaw a paused container.

use berth_common::types::ContainerId;
use berth_runtime::factory::Factory;
use clap::Args;

/// Arguments for the `resume` command.
#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Container id.
    #[arg(value_parser = super::parse_id)]
    pub id: ContainerId,
}

/// Executes the `resume` command.
///
/// # Errors
///
/// Returns an error unless the container is paused.
pub fn execute(args: &ResumeArgs, factory: &Factory) -> anyhow::Result<()> {
    factory.load(&args.id)?.resume()?;
    Ok(())
}
