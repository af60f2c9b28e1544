//! Event normalization: dedup, coalesce, debounce.
//!
//! Raw watcher notifications arrive duplicated, reordered within a
//! small window, and in bursts. The normalizer keeps one pending slot
//! per path with a debounce deadline; each new notification merges
//! into the slot by net effect and pushes the deadline out. When a
//! deadline passes with no further activity, one [`ChangeEvent`] is
//! emitted.
//!
//! Net-effect merge rules:
//! - create then delete inside the window cancels both
//! - delete then create collapses to modify (an unchanged recreate is
//!   dropped downstream when hashes match)
//! - repeated modifies collapse
//!
//! Rename halves are paired on a correlation window keyed by the
//! watcher's rename cookie; an unpaired half decays into a plain
//! delete or create.
//!
//! The normalizer is pure state + instants: no IO, no timers of its
//! own. The caller drives it with [`Normalizer::tick`] and sleeps
//! until [`Normalizer::next_deadline`].

use crate::model::{ChangeEvent, EventKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Kind of a raw, un-normalized watcher notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Create,
    Modify,
    Delete,
    /// First half of a rename (old path).
    RenameFrom,
    /// Second half of a rename (new path).
    RenameTo,
}

/// A raw notification as delivered by the event source.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawEventKind,
    /// Watcher-assigned rename correlation id, when available.
    pub cookie: Option<usize>,
    /// Unix millis at observation.
    pub at: i64,
}

/// Net effect accumulated in a pending slot.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Net {
    Create,
    Modify,
    Delete,
    Move { from: PathBuf },
}

#[derive(Debug)]
struct Slot {
    net: Net,
    observed_at: i64,
    deadline: Instant,
}

#[derive(Debug)]
struct PendingRename {
    from: PathBuf,
    cookie: Option<usize>,
    expires: Instant,
    observed_at: i64,
}

/// Per-path debouncing coalescer.
#[derive(Debug)]
pub struct Normalizer {
    window: Duration,
    correlation: Duration,
    slots: HashMap<PathBuf, Slot>,
    renames: Vec<PendingRename>,
}

/// Whether a path is in scope for synchronization.
#[must_use]
pub fn is_markdown(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md" | "markdown")
    )
}

impl Normalizer {
    #[must_use]
    pub fn new(window: Duration, correlation: Duration) -> Self {
        Self {
            window,
            correlation,
            slots: HashMap::new(),
            renames: Vec::new(),
        }
    }

    /// Feed one raw notification into the pending state.
    pub fn observe(&mut self, event: RawEvent, now: Instant) {
        match event.kind {
            RawEventKind::RenameFrom => {
                if is_markdown(&event.path) {
                    self.renames.push(PendingRename {
                        from: event.path,
                        cookie: event.cookie,
                        expires: now + self.correlation,
                        observed_at: event.at,
                    });
                }
            }
            RawEventKind::RenameTo => {
                if !is_markdown(&event.path) {
                    // Renamed out of scope: the unpaired From half will
                    // decay into a delete.
                    return;
                }
                match self.take_rename(event.cookie, now) {
                    Some(pending) => {
                        self.merge(
                            event.path,
                            Net::Move { from: pending.from },
                            pending.observed_at,
                            now,
                        );
                    }
                    None => self.merge(event.path, Net::Create, event.at, now),
                }
            }
            RawEventKind::Create => {
                if is_markdown(&event.path) {
                    self.merge(event.path, Net::Create, event.at, now);
                }
            }
            RawEventKind::Modify => {
                if is_markdown(&event.path) {
                    self.merge(event.path, Net::Modify, event.at, now);
                }
            }
            RawEventKind::Delete => {
                if is_markdown(&event.path) {
                    self.merge(event.path, Net::Delete, event.at, now);
                }
            }
        }
    }

    /// Pop the matching pending rename, if one is live.
    ///
    /// With a cookie, the match is exact. Without one, pairing is only
    /// attempted when a single candidate is live; anything ambiguous
    /// is left to decay into independent delete + create.
    fn take_rename(&mut self, cookie: Option<usize>, now: Instant) -> Option<PendingRename> {
        let live: Vec<usize> = self
            .renames
            .iter()
            .enumerate()
            .filter(|(_, r)| r.expires > now && (cookie.is_none() || r.cookie == cookie))
            .map(|(i, _)| i)
            .collect();
        match (cookie, live.as_slice()) {
            (Some(_), [i, ..]) | (None, [i]) => Some(self.renames.remove(*i)),
            _ => None,
        }
    }

    /// Merge an incoming net effect into the path's slot and reset the
    /// debounce deadline.
    fn merge(&mut self, path: PathBuf, incoming: Net, observed_at: i64, now: Instant) {
        let deadline = now + self.window;
        match self.slots.remove(&path) {
            None => {
                self.slots.insert(
                    path,
                    Slot {
                        net: incoming,
                        observed_at,
                        deadline,
                    },
                );
            }
            Some(slot) => {
                let merged = match (slot.net, incoming) {
                    // File never existed from the consumer's view.
                    (Net::Create, Net::Delete) => None,
                    // Still a brand-new file, whatever happened in between.
                    (Net::Create, _) => Some(Net::Create),
                    // Recreate collapses to modify.
                    (Net::Delete, Net::Create | Net::Modify) => Some(Net::Modify),
                    (_, Net::Delete) => Some(Net::Delete),
                    (Net::Move { from }, Net::Modify | Net::Create) => {
                        Some(Net::Move { from })
                    }
                    (_, incoming) => Some(incoming),
                };
                if let Some(net) = merged {
                    self.slots.insert(
                        path,
                        Slot {
                            net,
                            observed_at: slot.observed_at,
                            deadline,
                        },
                    );
                }
            }
        }
    }

    /// Drain everything whose debounce window has elapsed.
    ///
    /// Returns coalesced events ordered by first observation, which
    /// preserves per-path causal order (each path has at most one slot).
    pub fn tick(&mut self, now: Instant) -> Vec<ChangeEvent> {
        // Unpaired rename halves decay into deletes of the old path.
        let expired: Vec<PendingRename> = {
            let (expired, live) = std::mem::take(&mut self.renames)
                .into_iter()
                .partition(|r| r.expires <= now);
            self.renames = live;
            expired
        };
        for rename in expired {
            self.merge(rename.from, Net::Delete, rename.observed_at, now);
        }

        let ready: Vec<PathBuf> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        let mut events: Vec<ChangeEvent> = ready
            .into_iter()
            .filter_map(|path| {
                let slot = self.slots.remove(&path)?;
                let (kind, from_path) = match slot.net {
                    Net::Create => (EventKind::Create, None),
                    Net::Modify => (EventKind::Modify, None),
                    Net::Delete => (EventKind::Delete, None),
                    Net::Move { from } => (EventKind::Move, Some(from)),
                };
                Some(ChangeEvent {
                    path,
                    kind,
                    observed_at: slot.observed_at,
                    from_path,
                })
            })
            .collect();
        events.sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then(a.path.cmp(&b.path)));
        events
    }

    /// The next instant at which [`tick`](Self::tick) could emit.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let slot_min = self.slots.values().map(|s| s.deadline).min();
        let rename_min = self.renames.iter().map(|r| r.expires).min();
        match (slot_min, rename_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether anything is pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.slots.is_empty() && self.renames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);
    const CORRELATION: Duration = Duration::from_millis(500);

    fn normalizer() -> Normalizer {
        Normalizer::new(WINDOW, CORRELATION)
    }

    fn raw(path: &str, kind: RawEventKind, at: i64) -> RawEvent {
        RawEvent {
            path: PathBuf::from(path),
            kind,
            cookie: None,
            at,
        }
    }

    #[test]
    fn test_create_then_delete_nets_to_nothing() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        norm.observe(raw("a.md", RawEventKind::Create, 1), t0);
        norm.observe(raw("a.md", RawEventKind::Delete, 2), t0);

        let events = norm.tick(t0 + WINDOW + Duration::from_millis(1));
        assert!(events.is_empty());
        assert!(norm.is_idle());
    }

    #[test]
    fn test_create_then_modify_stays_create() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        norm.observe(raw("a.md", RawEventKind::Create, 1), t0);
        norm.observe(raw("a.md", RawEventKind::Modify, 2), t0);

        let events = norm.tick(t0 + WINDOW + Duration::from_millis(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Create);
    }

    #[test]
    fn test_rapid_modifies_collapse_to_one() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        for i in 0..10 {
            norm.observe(
                raw("a.md", RawEventKind::Modify, i),
                t0 + Duration::from_millis(u64::try_from(i).unwrap() * 10),
            );
        }

        let events = norm.tick(t0 + Duration::from_secs(3));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Modify);
        assert_eq!(events[0].observed_at, 0);
    }

    #[test]
    fn test_delete_then_create_becomes_modify() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        norm.observe(raw("a.md", RawEventKind::Delete, 1), t0);
        norm.observe(raw("a.md", RawEventKind::Create, 2), t0);

        let events = norm.tick(t0 + WINDOW + Duration::from_millis(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Modify);
    }

    #[test]
    fn test_new_event_resets_debounce_deadline() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        norm.observe(raw("a.md", RawEventKind::Modify, 1), t0);
        let t1 = t0 + Duration::from_millis(1500);
        norm.observe(raw("a.md", RawEventKind::Modify, 2), t1);

        // Original deadline has passed, but the burst is still hot.
        assert!(norm.tick(t0 + WINDOW + Duration::from_millis(1)).is_empty());
        let events = norm.tick(t1 + WINDOW + Duration::from_millis(1));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_non_markdown_filtered() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        norm.observe(raw("a.txt", RawEventKind::Create, 1), t0);
        norm.observe(raw(".obsidian/cache.json", RawEventKind::Modify, 2), t0);

        assert!(norm.tick(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_paths_are_independent() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        norm.observe(raw("a.md", RawEventKind::Create, 1), t0);
        norm.observe(raw("b.md", RawEventKind::Delete, 2), t0);

        let events = norm.tick(t0 + WINDOW + Duration::from_millis(1));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path, PathBuf::from("a.md"));
        assert_eq!(events[0].kind, EventKind::Create);
        assert_eq!(events[1].kind, EventKind::Delete);
    }

    #[test]
    fn test_rename_halves_pair_by_cookie() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        norm.observe(
            RawEvent {
                path: "old.md".into(),
                kind: RawEventKind::RenameFrom,
                cookie: Some(7),
                at: 1,
            },
            t0,
        );
        norm.observe(
            RawEvent {
                path: "new.md".into(),
                kind: RawEventKind::RenameTo,
                cookie: Some(7),
                at: 2,
            },
            t0 + Duration::from_millis(50),
        );

        let events = norm.tick(t0 + Duration::from_secs(3));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Move);
        assert_eq!(events[0].path, PathBuf::from("new.md"));
        assert_eq!(events[0].from_path, Some(PathBuf::from("old.md")));
    }

    #[test]
    fn test_unpaired_rename_from_decays_to_delete() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        norm.observe(
            RawEvent {
                path: "old.md".into(),
                kind: RawEventKind::RenameFrom,
                cookie: Some(7),
                at: 1,
            },
            t0,
        );

        // First tick past the correlation window decays the half into a
        // pending delete, which then debounces like any other event.
        let decayed_at = t0 + CORRELATION + Duration::from_millis(10);
        assert!(norm.tick(decayed_at).is_empty());
        let events = norm.tick(decayed_at + WINDOW);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Delete);
        assert_eq!(events[0].path, PathBuf::from("old.md"));
    }

    #[test]
    fn test_unpaired_rename_to_is_create() {
        let mut norm = normalizer();
        let t0 = Instant::now();
        norm.observe(
            RawEvent {
                path: "new.md".into(),
                kind: RawEventKind::RenameTo,
                cookie: Some(9),
                at: 1,
            },
            t0,
        );

        let events = norm.tick(t0 + WINDOW + Duration::from_millis(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Create);
    }

    #[test]
    fn test_next_deadline_tracks_earliest() {
        let mut norm = normalizer();
        assert!(norm.next_deadline().is_none());

        let t0 = Instant::now();
        norm.observe(raw("a.md", RawEventKind::Modify, 1), t0);
        let deadline = norm.next_deadline().unwrap();
        assert!(deadline > t0 && deadline <= t0 + WINDOW);
    }
}
