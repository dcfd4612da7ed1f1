//! Stage 2 of a process joining a running container.

use std::convert::Infallible;

use crate::collaborators::SecurityApply;
use crate::config::InitConfig;
use crate::error::Result;

use super::Session;

/// Applies the process's security attributes and credentials, completes
/// the handshake, and execs the program right away.
///
/// # Errors
///
/// Returns the first failing step; on success it does not return.
pub fn run(session: &mut Session, config: &InitConfig, security: &dyn SecurityApply) -> Result<Infallible> {
    super::apply_labels(config, security)?;
    if config.no_new_privileges {
        super::set_no_new_privileges()?;
    }
    super::sync_ready(session, config, security)?;
    super::finalize_namespace(config, security)?;
    tracing::debug!(id = %config.id, args = ?config.process.args, "joining container");
    session.close();
    super::exec_process(&config.process)
}
