//! Filesystem watcher adapter.
//!
//! Wraps a [`notify`] recursive watcher and converts its events into
//! the engine's [`RawEvent`] stream over a bounded channel. The
//! channel is drained by the run loop; if it ever fills up (editor
//! doing something pathological), events are dropped with a warning
//! and the next reconcile pass repairs the gap.

use super::normalizer::{RawEvent, RawEventKind};
use crate::error::{Error, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default channel capacity between the watcher thread and the run loop.
const CHANNEL_CAPACITY: usize = 1024;

/// A live recursive watch on a vault root.
pub struct VaultWatcher {
    // Dropping the watcher stops the stream.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<RawEvent>,
}

impl VaultWatcher {
    /// Start watching `root` recursively.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VaultNotFound`] if the root does not exist and
    /// a config error if the platform watcher cannot be created.
    pub fn start(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::VaultNotFound {
                path: root.to_path_buf(),
            });
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let vault_root = root.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for raw in convert(&event, &vault_root) {
                        if tx.try_send(raw).is_err() {
                            warn!("Watch channel full, dropping event");
                        }
                    }
                }
                Err(err) => warn!(error = %err, "Watcher error"),
            }
        })
        .map_err(|e| Error::Config(format!("cannot create filesystem watcher: {e}")))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::Config(format!("cannot watch {}: {e}", root.display())))?;
        debug!(root = %root.display(), "Watching vault");

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Next raw event, or `None` once the watcher has shut down.
    pub async fn recv(&mut self) -> Option<RawEvent> {
        self.rx.recv().await
    }
}

/// Translate one notify event into zero or more raw engine events with
/// vault-relative paths.
fn convert(event: &notify::Event, root: &Path) -> Vec<RawEvent> {
    let at = chrono::Utc::now().timestamp_millis();
    let cookie = event.attrs.tracker();

    let kinds: Vec<(usize, RawEventKind)> = match event.kind {
        EventKind::Create(_) => vec![(0, RawEventKind::Create)],
        EventKind::Remove(_) => vec![(0, RawEventKind::Delete)],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            vec![(0, RawEventKind::RenameFrom)]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => vec![(0, RawEventKind::RenameTo)],
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => vec![
            (0, RawEventKind::RenameFrom),
            (1, RawEventKind::RenameTo),
        ],
        EventKind::Modify(_) => vec![(0, RawEventKind::Modify)],
        // Access and metadata-only events are noise here.
        _ => Vec::new(),
    };

    kinds
        .into_iter()
        .filter_map(|(index, kind)| {
            let path = relative(event.paths.get(index)?, root)?;
            Some(RawEvent {
                path,
                kind,
                cookie,
                at,
            })
        })
        .collect()
}

fn relative(path: &Path, root: &Path) -> Option<PathBuf> {
    path.strip_prefix(root).ok().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn root() -> PathBuf {
        PathBuf::from("/vault")
    }

    #[test]
    fn test_create_event_converts() {
        let event = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/vault/notes/a.md"));
        let raws = convert(&event, &root());
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].kind, RawEventKind::Create);
        assert_eq!(raws[0].path, PathBuf::from("notes/a.md"));
    }

    #[test]
    fn test_remove_event_converts() {
        let event = notify::Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/vault/a.md"));
        let raws = convert(&event, &root());
        assert_eq!(raws[0].kind, RawEventKind::Delete);
    }

    #[test]
    fn test_rename_both_splits_into_halves() {
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/vault/old.md"))
            .add_path(PathBuf::from("/vault/new.md"));
        let raws = convert(&event, &root());
        assert_eq!(raws.len(), 2);
        assert_eq!(raws[0].kind, RawEventKind::RenameFrom);
        assert_eq!(raws[0].path, PathBuf::from("old.md"));
        assert_eq!(raws[1].kind, RawEventKind::RenameTo);
        assert_eq!(raws[1].path, PathBuf::from("new.md"));
    }

    #[test]
    fn test_paths_outside_root_dropped() {
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/elsewhere/a.md"));
        assert!(convert(&event, &root()).is_empty());
    }
}
