//! Initialize the VaultSync state database.
//!
//! VaultSync keeps one global database (`~/.vaultsync/data/vaultsync.db`)
//! shared by every vault on the machine; identity records are keyed by
//! vault-relative path per vault root. When `VAULTSYNC_TEST_DB=1` is
//! set the database lands under `~/.vaultsync/test/` instead.

use crate::config::{global_state_dir, is_test_mode, resolve_db_path};
use crate::error::{Error, Result};
use crate::storage::IdentityStore;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct InitOutput {
    database: PathBuf,
}

/// Execute the init command.
///
/// # Errors
///
/// Returns [`Error::AlreadyInitialized`] when the database exists and
/// `--force` was not given, and IO/database errors from creation.
pub fn execute(force: bool, db: Option<&Path>, json: bool) -> Result<()> {
    let db_path = match db {
        Some(path) => path.to_path_buf(),
        None => {
            // Mirror the normal resolution, but fall back through the
            // global dir so the error names a concrete location.
            let base = global_state_dir().ok_or_else(|| {
                Error::Config("could not determine home directory".to_string())
            })?;
            let sub = if is_test_mode() { "test" } else { "data" };
            resolve_db_path(None).unwrap_or_else(|| base.join(sub).join("vaultsync.db"))
        }
    };

    if db_path.exists() && !force {
        return Err(Error::AlreadyInitialized { path: db_path });
    }

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if force && db_path.exists() {
        fs::remove_file(&db_path)?;
    }

    // Opening applies the schema and migrations.
    IdentityStore::open(&db_path)?;

    if json {
        let output = InitOutput {
            database: db_path,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Initialized VaultSync state database");
        println!("  Database: {}", db_path.display());
        println!();
        println!("Next: run `vaultsync run <vault-root>` to start syncing.");
    }

    Ok(())
}
