//! VaultSync - one-way markdown vault to knowledge-base sync
//!
//! This crate provides the core functionality for the `vaultsync` CLI
//! tool: it watches a local markdown vault and mirrors it into a remote
//! document store, remembering which file maps to which remote document
//! across restarts.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`model`] - Data types (records, events, operations, front matter)
//! - [`storage`] - SQLite identity store with per-path leases
//! - [`engine`] - Normalizer, resolver, dispatcher, reconciler, watcher
//! - [`remote`] - Document store API trait and HTTP client
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod remote;
pub mod storage;

pub use error::{Error, Result};
