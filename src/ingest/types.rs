// src/ingest/types.rs
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::severity::SeverityHint;

/// Which feed produced an event. Fixed per adapter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum SourceKind {
    /// EPA ECHO sanitary/combined sewer overflow events.
    SsoCso,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::SsoCso => "SSO_CSO",
        }
    }

    /// Short prefix used at the front of event ids.
    pub fn event_prefix(&self) -> &'static str {
        match self {
            SourceKind::SsoCso => "sso",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ChangeType {
    NewRecord,
}

/// Loosely-sourced upstream record after tolerant parsing.
/// Magnitudes default to 0; strings default to empty.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    pub permit_id: String,
    /// Event date exactly as the upstream reported it.
    pub event_date: String,
    pub facility_name: Option<String>,
    pub volume: f64,
    pub duration_hours: f64,
    pub cause: Option<String>,
    pub state_abbr: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geography {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_abbr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// The identity key used for deduplication.
    pub source_record_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facility_id: Option<String>,
}

/// Unit of work handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub event_id: String,
    pub source: SourceKind,
    pub detected_at: DateTime<Utc>,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub change_type: ChangeType,
    pub geography: Geography,
    pub severity_hint: SeverityHint,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub metadata: EventMetadata,
}

/// Identity memory for one polling source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceState {
    #[serde(default)]
    pub known_ids: BTreeSet<String>,
}

impl SourceState {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.known_ids.contains(key)
    }

    pub fn len(&self) -> usize {
        self.known_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known_ids.is_empty()
    }
}

/// Why a fetch produced no observation this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    Timeout,
    Status(u16),
    Transport(String),
    Malformed(String),
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Status(code) => write!(f, "http status {code}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Malformed(msg) => write!(f, "malformed body: {msg}"),
        }
    }
}

/// Result of one fetch. `Unavailable` means nothing was observed,
/// which is different from observing zero records.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fresh(Vec<RawRecord>),
    Unavailable(UnavailableReason),
}

impl FetchOutcome {
    /// Records observed, empty when the source was unavailable.
    pub fn records(&self) -> &[RawRecord] {
        match self {
            FetchOutcome::Fresh(v) => v,
            FetchOutcome::Unavailable(_) => &[],
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, FetchOutcome::Fresh(_))
    }
}

/// Structural failures that must reach the caller instead of being swallowed.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid endpoint `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("request could not be built: {0}")]
    InvalidRequest(String),
    #[error("http client could not be built")]
    ClientBuild(#[source] reqwest::Error),
    #[error("source misconfigured: {0}")]
    Misconfigured(String),
}

#[async_trait::async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_raw_records(&self) -> Result<FetchOutcome, SourceError>;
    fn kind(&self) -> SourceKind;
    fn name(&self) -> &str;
}
