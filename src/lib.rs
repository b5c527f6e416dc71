//! recur - Recurring Task Instance Library
//!
//! This library provides the core functionality for the recur CLI tool,
//! expanding recurring task templates into concrete dated occurrences.
//!
//! # Core Concepts
//!
//! - **Templates**: User-authored task definitions, optionally repeating every N months
//! - **Occurrences**: One stored task per scheduled date (`TEMPLATE#yyyy-MM-dd`)
//! - **Overrides**: Per-occurrence edits that survive template changes
//! - **Reconciliation**: Diffing templates against what was last seen and
//!   regenerating or cascading only what changed
//! - **Combined view**: One subscribable list of single tasks and occurrences
//!
//! # Module Organization
//!
//! - `cli`: Command-line interface using clap
//! - `combined`: Merged task list with a serialized mutation queue
//! - `config`: Configuration loading from `.recur/config.toml`
//! - `date`: Calendar dates and anchored month arithmetic
//! - `error`: Error types and result aliases
//! - `events`: JSONL change events
//! - `generator`: Schedule expansion and diff against stored occurrences
//! - `lock`: File locking and atomic operations for concurrency safety
//! - `occurrence`: Occurrence records, snapshots, and overrides
//! - `output`: Shared human/JSON output envelope
//! - `reconcile`: Change detection and per-template serialization
//! - `repository`: Template sources (memory and JSON file)
//! - `storage`: Data directory layout
//! - `store`: Occurrence persistence (memory and JSON file)
//! - `template`: Templates and template patches

pub mod cli;
pub mod combined;
pub mod config;
pub mod date;
pub mod error;
pub mod events;
pub mod generator;
pub mod lock;
pub mod occurrence;
pub mod output;
pub mod reconcile;
pub mod repository;
pub mod storage;
pub mod store;
pub mod template;

pub use error::{Error, Result};
