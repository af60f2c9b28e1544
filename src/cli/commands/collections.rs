//! List remote collections.

use super::{http_api, open_store, runtime};
use crate::cli::ApiArgs;
use crate::config::{BreakerConfig, RateLimitConfig, RetryConfig};
use crate::engine::dispatcher::Dispatcher;
use crate::error::Result;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Execute the collections command.
///
/// Goes through a dispatcher like every other remote call, so listing
/// gets the same throttling and retry treatment as the engine.
///
/// # Errors
///
/// Returns a config error for a missing API URL and a remote error if
/// the listing fails.
pub fn execute(api: &ApiArgs, db: Option<&Path>, json: bool) -> Result<()> {
    let store = open_store(db)?;
    let client = http_api(api)?;
    let dispatcher = Dispatcher::new(
        client,
        store,
        PathBuf::new(),
        RetryConfig::default(),
        RateLimitConfig::default(),
        BreakerConfig::default(),
    );

    let rt = runtime()?;
    let collections = rt.block_on(dispatcher.list_collections())?;

    if json {
        let rows: Vec<_> = collections
            .iter()
            .map(|c| json!({ "id": c.id, "name": c.name }))
            .collect();
        println!("{}", serde_json::Value::Array(rows));
        return Ok(());
    }

    if collections.is_empty() {
        println!("No collections");
        return Ok(());
    }
    for collection in collections {
        println!("{}  {}", collection.id, collection.name);
    }
    Ok(())
}
