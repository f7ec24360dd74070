// src/lib.rs
// Public library surface for the service binary and integration tests.

pub mod change_detector;
pub mod health;
pub mod ingest;
pub mod observe;
pub mod poller;
pub mod severity;
pub mod state_store;

// Operator surface (/health, /sources, /metrics)
pub mod api;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::change_detector::{detect_changes, identity_key, Detection};
pub use crate::ingest::types::{ChangeEvent, RawRecord, SourceState};
pub use crate::poller::{PollError, PollOutcome, Poller};
pub use crate::severity::{classify_severity, SeverityHint, SeverityThresholds};
