// src/ingest/mod.rs
//! Source-facing layer: upstream clients, tolerant parsing, configuration,
//! and the caller-side scheduler that persists state and delivers events.

pub mod config;
pub mod fields;
pub mod providers;
pub mod scheduler;
pub mod sink;
pub mod types;

pub use types::{
    ChangeEvent, ChangeType, EventMetadata, FetchOutcome, Geography, RawRecord, RecordSource,
    SourceError, SourceKind, SourceState, UnavailableReason,
};
