//! Dead-letter queue inspection and replay.

use super::{build_engine, open_store, runtime};
use crate::cli::{DeadletterCommands, SyncArgs};
use crate::error::Result;
use crate::model::{ChangeEvent, EventKind};
use colored::Colorize;
use std::path::Path;

/// Execute a deadletter subcommand.
///
/// # Errors
///
/// Returns [`crate::error::Error::NotInitialized`] when no database
/// exists, [`crate::error::Error::DeadLetterNotFound`] for an unknown
/// replay id, plus the engine's failure modes during replay.
pub fn execute(command: &DeadletterCommands, db: Option<&Path>, json: bool) -> Result<()> {
    match command {
        DeadletterCommands::List { limit } => list(db, *limit, json),
        DeadletterCommands::Replay { id, root, api } => replay(id, root, api, db, json),
        DeadletterCommands::Purge => purge(db, json),
    }
}

fn list(db: Option<&Path>, limit: Option<usize>, json: bool) -> Result<()> {
    let store = open_store(db)?;
    let entries = store.list_dead_letters(limit)?;

    if json {
        println!("{}", serde_json::to_string(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No dead-lettered operations");
        return Ok(());
    }
    for entry in entries {
        let when = chrono::DateTime::from_timestamp_millis(entry.created_at)
            .map_or_else(|| "?".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        println!(
            "{}  {}  {}  {}  attempts={}  {}",
            entry.id.dimmed(),
            when,
            entry.error_code.red(),
            entry.path,
            entry.attempts,
            entry.error
        );
    }
    Ok(())
}

fn replay(
    id: &str,
    root: &Path,
    api: &crate::cli::ApiArgs,
    db: Option<&Path>,
    json: bool,
) -> Result<()> {
    let store = open_store(db)?;
    let entry = store.get_dead_letter(id)?;

    let args = SyncArgs {
        root: root.to_path_buf(),
        api: crate::cli::ApiArgs {
            api_url: api.api_url.clone(),
            token: api.token.clone(),
        },
        collection: entry.collection.clone(),
        merge_policy: crate::model::MergePolicy::default(),
        debounce_ms: 0,
        concurrency: 1,
    };
    let engine = build_engine(&args, store)?;

    // Stamp the entry as replayed up front; a replay that fails again
    // opens a fresh pending entry with current error details.
    engine.store().mark_replayed(id)?;

    let event = ChangeEvent::new(entry.path.clone(), EventKind::Modify, chrono::Utc::now().timestamp_millis());
    let rt = runtime()?;
    rt.block_on(engine.handle_event(event))?;

    let replayed = engine.store().list_dead_letters(None)?;
    let failed_again = replayed.iter().any(|e| e.path == entry.path);

    if json {
        println!(
            "{}",
            serde_json::json!({ "id": id, "path": entry.path, "replayed": !failed_again })
        );
    } else if failed_again {
        println!("{} {} failed again; see `deadletter list`", "✗".red(), entry.path);
    } else {
        println!("{} {} replayed", "✓".green(), entry.path);
    }
    Ok(())
}

fn purge(db: Option<&Path>, json: bool) -> Result<()> {
    let store = open_store(db)?;
    let removed = store.purge_dead_letters()?;

    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("Removed {removed} dead-letter entries");
    }
    Ok(())
}
