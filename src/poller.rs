//! Poll lifecycle: fetch, detect, classify, return.
//!
//! [`Poller`] holds no mutable state. The caller loads the prior
//! [`SourceState`], passes it in and persists the returned one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::change_detector::detect_changes;
use crate::ingest::types::{
    ChangeEvent, FetchOutcome, RecordSource, SourceError, SourceState, UnavailableReason,
};
use crate::observe::{PollObserver, PollStats, TracingObserver};
use crate::severity::SeverityThresholds;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("source `{name}` failed structurally")]
    Source {
        name: String,
        #[source]
        error: SourceError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub events: Vec<ChangeEvent>,
    pub updated_state: SourceState,
    /// `None` when the upstream answered, otherwise why it did not.
    pub unavailable: Option<UnavailableReason>,
    pub stats: PollStats,
}

impl PollOutcome {
    pub fn source_available(&self) -> bool {
        self.unavailable.is_none()
    }
}

#[derive(Clone)]
pub struct Poller {
    source: Arc<dyn RecordSource>,
    thresholds: SeverityThresholds,
    observer: Arc<dyn PollObserver>,
}

impl Poller {
    pub fn new(source: Arc<dyn RecordSource>, thresholds: SeverityThresholds) -> Self {
        Self {
            source,
            thresholds,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PollObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Name of the underlying source, used as the state key.
    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub async fn poll(&self, prior: &SourceState) -> Result<PollOutcome, PollError> {
        self.poll_at(prior, Utc::now()).await
    }

    /// Same as [`Poller::poll`] with an explicit detection time.
    pub async fn poll_at(
        &self,
        prior: &SourceState,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome, PollError> {
        let fetched = self
            .source
            .fetch_raw_records()
            .await
            .map_err(|error| PollError::Source {
                name: self.source.name().to_string(),
                error,
            })?;

        let records = match fetched {
            FetchOutcome::Fresh(records) => records,
            // Nothing observed, nothing forgotten.
            FetchOutcome::Unavailable(reason) => {
                return Ok(PollOutcome {
                    events: Vec::new(),
                    updated_state: prior.clone(),
                    unavailable: Some(reason),
                    stats: PollStats::default(),
                });
            }
        };

        let detection = detect_changes(
            self.source.kind(),
            &records,
            prior,
            &self.thresholds,
            now,
        );

        let stats = PollStats {
            fetched: records.len(),
            new_events: detection.events.len(),
            forgotten: prior
                .known_ids
                .difference(&detection.next_state.known_ids)
                .count(),
        };
        self.observer.poll_completed(self.source.name(), &stats);

        Ok(PollOutcome {
            events: detection.events,
            updated_state: detection.next_state,
            unavailable: None,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{RawRecord, SourceKind};
    use crate::observe::testing::RecordingObserver;
    use crate::severity::SeverityHint;
    use async_trait::async_trait;

    enum Behaviour {
        Records(Vec<RawRecord>),
        Unavailable(UnavailableReason),
        Fatal,
    }

    struct StubSource(Behaviour);

    #[async_trait]
    impl RecordSource for StubSource {
        async fn fetch_raw_records(&self) -> Result<FetchOutcome, SourceError> {
            match &self.0 {
                Behaviour::Records(v) => Ok(FetchOutcome::Fresh(v.clone())),
                Behaviour::Unavailable(r) => Ok(FetchOutcome::Unavailable(r.clone())),
                Behaviour::Fatal => Err(SourceError::Misconfigured("no endpoint".into())),
            }
        }

        fn kind(&self) -> SourceKind {
            SourceKind::SsoCso
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn poller(b: Behaviour) -> (Poller, Arc<RecordingObserver>) {
        let obs = Arc::new(RecordingObserver::default());
        let p = Poller::new(Arc::new(StubSource(b)), SeverityThresholds::default())
            .with_observer(obs.clone());
        (p, obs)
    }

    fn rec(permit: &str, date: &str, volume: f64) -> RawRecord {
        RawRecord {
            permit_id: permit.into(),
            event_date: date.into(),
            volume,
            ..RawRecord::default()
        }
    }

    #[tokio::test]
    async fn unavailable_source_keeps_prior_state() {
        let prior = SourceState::new(["A|1", "B|2"]);
        let (p, obs) = poller(Behaviour::Unavailable(UnavailableReason::Timeout));
        let out = p.poll(&prior).await.unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.updated_state, prior);
        assert_eq!(out.unavailable, Some(UnavailableReason::Timeout));
        assert!(obs.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fatal_source_error_propagates() {
        let (p, _) = poller(Behaviour::Fatal);
        let err = p.poll(&SourceState::default()).await.unwrap_err();
        let PollError::Source { name, error } = err;
        assert_eq!(name, "stub");
        assert!(matches!(error, SourceError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn fresh_records_flow_through_detector() {
        let prior = SourceState::new(["PERMIT123|2024-01-01", "GONE|2023-11-01"]);
        let (p, obs) = poller(Behaviour::Records(vec![
            rec("PERMIT123", "2024-01-01", 500.0),
            rec("PERMIT999", "2024-02-15", 2_000_000.0),
        ]));
        let out = p.poll(&prior).await.unwrap();
        assert!(out.source_available());
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].severity_hint, SeverityHint::Critical);
        assert_eq!(
            out.updated_state,
            SourceState::new(["PERMIT123|2024-01-01", "PERMIT999|2024-02-15"])
        );
        assert_eq!(
            out.stats,
            PollStats {
                fetched: 2,
                new_events: 1,
                forgotten: 1
            }
        );
        assert_eq!(obs.completed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn poller_does_not_carry_state_between_calls() {
        let (p, _) = poller(Behaviour::Records(vec![rec("X", "1", 0.0)]));
        let empty = SourceState::default();
        let a = p.poll(&empty).await.unwrap();
        let b = p.poll(&empty).await.unwrap();
        assert_eq!(a.events.len(), 1);
        assert_eq!(b.events.len(), 1);
        let c = p.poll(&a.updated_state).await.unwrap();
        assert!(c.events.is_empty());
    }
}
