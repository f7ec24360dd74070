// src/observe.rs
//! Injected observability hook for the poll pipeline.
//!
//! Library code reports through [`PollObserver`] instead of logging directly,
//! so fail-open paths stay visible to whatever monitoring the caller wires in.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use once_cell::sync::OnceCell;

use crate::ingest::types::UnavailableReason;

/// Summary of one successful poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollStats {
    pub fetched: usize,
    pub new_events: usize,
    /// Keys in the prior state that the upstream no longer reports.
    pub forgotten: usize,
}

pub trait PollObserver: Send + Sync {
    /// The upstream could not be read; the cycle yields nothing.
    fn source_unavailable(&self, source: &str, reason: &UnavailableReason);

    /// Records parsed from one upstream response.
    fn records_parsed(&self, _source: &str, _count: usize, _skipped: usize, _parse_ms: f64) {}

    fn poll_completed(&self, _source: &str, _stats: &PollStats) {}
}

/// Default hook: WARN/DEBUG logs plus Prometheus series.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PollObserver for TracingObserver {
    fn source_unavailable(&self, source: &str, reason: &UnavailableReason) {
        ensure_metrics_described();
        tracing::warn!(source, reason = %reason, "source unavailable, yielding no records");
        counter!("sentinel_source_unavailable_total", "source" => source.to_string()).increment(1);
    }

    fn records_parsed(&self, source: &str, count: usize, skipped: usize, parse_ms: f64) {
        ensure_metrics_described();
        tracing::debug!(source, count, skipped, parse_ms, "upstream records parsed");
        histogram!("sentinel_parse_ms").record(parse_ms);
        counter!("sentinel_records_total", "source" => source.to_string())
            .increment(count as u64);
    }

    fn poll_completed(&self, source: &str, stats: &PollStats) {
        ensure_metrics_described();
        tracing::info!(
            source,
            fetched = stats.fetched,
            new_events = stats.new_events,
            forgotten = stats.forgotten,
            "poll completed"
        );
        counter!("sentinel_new_records_total", "source" => source.to_string())
            .increment(stats.new_events as u64);
    }
}

/// Discards everything. Handy in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PollObserver for NoopObserver {
    fn source_unavailable(&self, _source: &str, _reason: &UnavailableReason) {}
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "sentinel_records_total",
            "Raw records parsed from upstream responses."
        );
        describe_counter!(
            "sentinel_source_unavailable_total",
            "Fetches that failed open (timeout, status, transport, malformed)."
        );
        describe_counter!(
            "sentinel_new_records_total",
            "Records not present in the prior identity set."
        );
        describe_counter!("sentinel_cycles_total", "Scheduler cycles executed.");
        describe_counter!(
            "sentinel_cycle_failures_total",
            "Scheduler cycles that ended in an error."
        );
        describe_counter!(
            "sentinel_events_emitted_total",
            "Change events delivered to the sink."
        );
        describe_histogram!("sentinel_parse_ms", "Upstream parse time in milliseconds.");
        describe_gauge!(
            "sentinel_last_cycle_ts",
            "Unix ts when a scheduler cycle last finished."
        );
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every callback for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub unavailable: Mutex<Vec<(String, UnavailableReason)>>,
        pub completed: Mutex<Vec<(String, PollStats)>>,
    }

    impl PollObserver for RecordingObserver {
        fn source_unavailable(&self, source: &str, reason: &UnavailableReason) {
            self.unavailable
                .lock()
                .unwrap()
                .push((source.to_string(), reason.clone()));
        }

        fn poll_completed(&self, source: &str, stats: &PollStats) {
            self.completed
                .lock()
                .unwrap()
                .push((source.to_string(), *stats));
        }
    }
}
