//! Command implementations.

pub mod collections;
pub mod completions;
pub mod deadletter;
pub mod init;
pub mod reconcile;
pub mod run;
pub mod status;
pub mod version;

use crate::cli::{ApiArgs, SyncArgs};
use crate::config::{SyncConfig, resolve_db_path};
use crate::engine::SyncEngine;
use crate::error::{Error, Result};
use crate::remote::HttpDocumentApi;
use crate::storage::IdentityStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Open the state database, failing if `init` has not been run.
pub(crate) fn open_store(db: Option<&Path>) -> Result<Arc<IdentityStore>> {
    let path = resolve_db_path(db).ok_or(Error::NotInitialized)?;
    if !path.exists() {
        return Err(Error::NotInitialized);
    }
    Ok(Arc::new(IdentityStore::open(&path)?))
}

/// Single-purpose runtime for commands that need async internals.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(Error::from)
}

pub(crate) fn http_api(api: &ApiArgs) -> Result<HttpDocumentApi> {
    if api.api_url.trim().is_empty() {
        return Err(Error::Config("no remote API URL given".to_string()));
    }
    Ok(HttpDocumentApi::new(&api.api_url, api.token.clone()))
}

/// Build an engine for the given vault + remote arguments.
pub(crate) fn build_engine(
    args: &SyncArgs,
    store: Arc<IdentityStore>,
) -> Result<Arc<SyncEngine<HttpDocumentApi>>> {
    if !args.root.is_dir() {
        return Err(Error::VaultNotFound {
            path: args.root.clone(),
        });
    }
    let api = http_api(&args.api)?;

    let mut config = SyncConfig::for_vault(&args.root);
    config.default_collection.clone_from(&args.collection);
    config.merge_policy = args.merge_policy;
    config.debounce = Duration::from_millis(args.debounce_ms);
    config.concurrency = args.concurrency;

    Ok(Arc::new(SyncEngine::new(config, store, api)))
}
