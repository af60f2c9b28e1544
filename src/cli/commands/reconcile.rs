//! One-shot reconcile command implementation.

use super::{build_engine, open_store, runtime};
use crate::cli::SyncArgs;
use crate::error::Result;
use colored::Colorize;
use std::path::Path;

/// Execute a single reconcile pass and report what it corrected.
///
/// # Errors
///
/// Same failure modes as the run command.
pub fn execute(args: &SyncArgs, db: Option<&Path>, json: bool) -> Result<()> {
    let store = open_store(db)?;
    let engine = build_engine(args, store)?;

    let rt = runtime()?;
    let report = rt.block_on(async { engine.reconcile_once().await })?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    println!("Scanned {} files", report.scanned);
    if report.corrections() == 0 {
        println!("{}", "Everything in sync".green());
    } else {
        println!("  new: {}", report.untracked);
        println!("  changed: {}", report.drifted);
        println!("  deleted: {}", report.vanished);
        println!("  re-queued: {}", report.pending);
    }
    Ok(())
}
