//! Continuous sync command implementation.

use super::{build_engine, open_store, runtime};
use crate::cli::SyncArgs;
use crate::error::Result;
use std::path::Path;
use tracing::info;

/// Execute the run command: watch the vault and sync until interrupted.
///
/// # Errors
///
/// Returns [`crate::error::Error::NotInitialized`] when no database
/// exists, [`crate::error::Error::VaultNotFound`] for a bad root, and
/// config errors for a missing API URL.
pub fn execute(args: &SyncArgs, db: Option<&Path>, _json: bool) -> Result<()> {
    let store = open_store(db)?;
    let engine = build_engine(args, store)?;

    let rt = runtime()?;
    rt.block_on(engine.run())?;
    info!("Sync engine stopped");
    Ok(())
}
