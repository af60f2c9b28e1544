//! Status command implementation.

use super::open_store;
use crate::engine::dispatcher::LAST_BREAKER_OPEN_KEY;
use crate::engine::reconciler::LAST_RECONCILE_KEY;
use crate::error::Result;
use crate::storage::StateCounts;
use colored::Colorize;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct BreakerTrip {
    category: String,
    at: i64,
}

#[derive(Serialize)]
struct StatusOutput {
    records: StateCounts,
    total: usize,
    dead_letters: usize,
    last_reconcile_at: Option<i64>,
    last_breaker_open: Option<BreakerTrip>,
}

/// Execute the status command.
///
/// # Errors
///
/// Returns [`crate::error::Error::NotInitialized`] when no database
/// exists, and database errors otherwise.
pub fn execute(db: Option<&Path>, json: bool) -> Result<()> {
    let store = open_store(db)?;
    let counts = store.state_counts()?;
    let dead_letters = store.list_dead_letters(None)?.len();
    let last_reconcile_at = store
        .meta_get(LAST_RECONCILE_KEY)?
        .and_then(|v| v.parse::<i64>().ok());
    let last_breaker_open = store.meta_get(LAST_BREAKER_OPEN_KEY)?.and_then(|v| {
        let (category, millis) = v.split_once(' ')?;
        Some(BreakerTrip {
            category: category.to_string(),
            at: millis.parse().ok()?,
        })
    });

    if json {
        let output = StatusOutput {
            records: counts,
            total: counts.total(),
            dead_letters,
            last_reconcile_at,
            last_breaker_open,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("Tracked files: {}", counts.total());
    println!("  {} {}", "synced".green(), counts.synced);
    println!("  {} {}", "unsynced".yellow(), counts.unsynced);
    println!("  {} {}", "conflicted".red(), counts.conflicted);
    println!("  {} {}", "dead".red().bold(), counts.dead);
    println!("Dead letters: {dead_letters}");
    match last_reconcile_at.and_then(chrono::DateTime::from_timestamp_millis) {
        Some(at) => println!("Last reconcile: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last reconcile: never"),
    }
    match last_breaker_open {
        Some(trip) => {
            let when = chrono::DateTime::from_timestamp_millis(trip.at)
                .map_or_else(|| "?".to_string(), |at| {
                    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
                });
            println!(
                "Last breaker trip: {} ({})",
                trip.category.red(),
                when
            );
        }
        None => println!("Last breaker trip: never"),
    }
    Ok(())
}
