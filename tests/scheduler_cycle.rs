// tests/scheduler_cycle.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use sso_sentinel::health::{HealthRegistry, HealthStatus};
use sso_sentinel::ingest::config::HealthConfig;
use sso_sentinel::ingest::scheduler::{run_cycle, spawn_scheduler, CycleReport, SchedulerCtx};
use sso_sentinel::ingest::sink::MemorySink;
use sso_sentinel::ingest::types::{
    FetchOutcome, RawRecord, RecordSource, SourceError, SourceKind, SourceState,
    UnavailableReason,
};
use sso_sentinel::state_store::{JsonFileStateStore, MemoryStateStore, StateStore};
use sso_sentinel::{Poller, SeverityThresholds};

/// Serves a scripted sequence of outcomes, repeating the last one.
struct Scripted {
    name: String,
    script: Vec<Result<FetchOutcome, String>>,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(name: &str, script: Vec<Result<FetchOutcome, String>>) -> Self {
        Self {
            name: name.into(),
            script,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RecordSource for Scripted {
    async fn fetch_raw_records(&self) -> Result<FetchOutcome, SourceError> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = &self.script[i.min(self.script.len() - 1)];
        match step {
            Ok(o) => Ok(o.clone()),
            Err(msg) => Err(SourceError::Misconfigured(msg.clone())),
        }
    }
    fn kind(&self) -> SourceKind {
        SourceKind::SsoCso
    }
    fn name(&self) -> &str {
        &self.name
    }
}

fn rec(permit: &str, date: &str) -> RawRecord {
    RawRecord {
        permit_id: permit.into(),
        event_date: date.into(),
        ..RawRecord::default()
    }
}

fn fresh(records: Vec<RawRecord>) -> Result<FetchOutcome, String> {
    Ok(FetchOutcome::Fresh(records))
}

fn poller(src: Scripted) -> Poller {
    Poller::new(Arc::new(src), SeverityThresholds::default())
}

fn ctx(store: Arc<dyn StateStore>, sink: Arc<MemorySink>) -> SchedulerCtx {
    SchedulerCtx::new(
        store,
        sink,
        Arc::new(HealthRegistry::new()),
        HealthConfig::default(),
        300,
    )
}

#[tokio::test]
async fn cycle_delivers_then_persists_and_dedups_next_time() {
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(MemorySink::new());
    let c = ctx(store.clone(), sink.clone());
    let p = poller(Scripted::new(
        "echo-sso",
        vec![fresh(vec![rec("A", "1"), rec("B", "2")])],
    ));
    let t = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();

    let r1 = run_cycle(&p, &c, t).await.unwrap();
    assert_eq!(r1, CycleReport::Completed { emitted: 2, known: 2 });
    let r2 = run_cycle(&p, &c, t + Duration::minutes(5)).await.unwrap();
    assert_eq!(r2, CycleReport::Completed { emitted: 0, known: 2 });

    assert_eq!(sink.events().len(), 2);
    assert_eq!(store.load("echo-sso").await.unwrap().len(), 2);
    assert_eq!(c.health.get("echo-sso").status, HealthStatus::Live);
}

#[tokio::test]
async fn unavailable_cycle_leaves_state_and_degrades_health() {
    let store = Arc::new(MemoryStateStore::new());
    store.insert("echo-sso", SourceState::new(["A|1"])).await;
    let sink = Arc::new(MemorySink::new());
    let c = ctx(store.clone(), sink.clone());
    let p = poller(Scripted::new(
        "echo-sso",
        vec![Ok(FetchOutcome::Unavailable(UnavailableReason::Status(502)))],
    ));
    let t = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();

    let r = run_cycle(&p, &c, t).await.unwrap();
    assert_eq!(
        r,
        CycleReport::Unavailable {
            reason: UnavailableReason::Status(502)
        }
    );
    assert_eq!(store.load("echo-sso").await.unwrap(), SourceState::new(["A|1"]));
    assert!(sink.events().is_empty());

    let h = c.health.get("echo-sso");
    assert_eq!(h.status, HealthStatus::Degraded);
    assert_eq!(h.consecutive_failures, 1);

    // Inside the 15 minute backoff the cycle is skipped without fetching.
    let skipped = run_cycle(&p, &c, t + Duration::minutes(5)).await.unwrap();
    assert!(matches!(skipped, CycleReport::Skipped { .. }));
}

#[tokio::test]
async fn failed_delivery_skips_state_write() {
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(MemorySink::failing());
    let c = ctx(store.clone(), sink.clone());
    let p = poller(Scripted::new("echo-sso", vec![fresh(vec![rec("A", "1")])]));
    let t = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();

    assert!(run_cycle(&p, &c, t).await.is_err());
    assert!(store.load("echo-sso").await.unwrap().is_empty());

    // Sink recovers: once the backoff has passed the same record is detected again.
    sink.fail.store(false, Ordering::SeqCst);
    let r = run_cycle(&p, &c, t + Duration::minutes(16)).await.unwrap();
    assert_eq!(r, CycleReport::Completed { emitted: 1, known: 1 });
    assert_eq!(c.health.get("echo-sso").status, HealthStatus::Live);
}

#[tokio::test]
async fn failing_sink_degrades_then_kills_source_health() {
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(MemorySink::failing());
    let c = ctx(store.clone(), sink.clone());
    let p = poller(Scripted::new("echo-sso", vec![fresh(vec![rec("A", "1")])]));
    let t = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();

    assert!(run_cycle(&p, &c, t).await.is_err());
    let h = c.health.get("echo-sso");
    assert_eq!(h.status, HealthStatus::Degraded);
    assert_eq!(h.consecutive_failures, 1);
    assert!(h.last_error.as_deref().unwrap_or_default().contains("sink rejected"));

    // Still backing off a few minutes later.
    let skipped = run_cycle(&p, &c, t + Duration::minutes(5)).await.unwrap();
    assert!(matches!(skipped, CycleReport::Skipped { .. }));

    for i in 1..=4 {
        assert!(run_cycle(&p, &c, t + Duration::hours(2 * i)).await.is_err());
    }
    let h = c.health.get("echo-sso");
    assert_eq!(h.consecutive_failures, 5);
    assert_eq!(h.status, HealthStatus::Dead);
    assert_eq!(h.backoff_minutes, 60);
    assert!(store.load("echo-sso").await.unwrap().is_empty());
}

/// State store that can neither read nor write.
struct BrokenStore;

#[async_trait]
impl StateStore for BrokenStore {
    async fn load(&self, key: &str) -> anyhow::Result<SourceState> {
        anyhow::bail!("disk gone while reading {key}")
    }
    async fn save(&self, key: &str, _state: &SourceState) -> anyhow::Result<()> {
        anyhow::bail!("disk gone while writing {key}")
    }
}

#[tokio::test]
async fn state_store_failure_counts_against_health() {
    let sink = Arc::new(MemorySink::new());
    let c = ctx(Arc::new(BrokenStore), sink.clone());
    let p = poller(Scripted::new("echo-sso", vec![fresh(vec![rec("A", "1")])]));
    let t = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();

    let err = run_cycle(&p, &c, t).await.unwrap_err();
    assert!(format!("{err:#}").contains("loading state for echo-sso"));
    let h = c.health.get("echo-sso");
    assert_eq!(h.status, HealthStatus::Degraded);
    assert!(h.last_error.as_deref().unwrap_or_default().contains("disk gone"));
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn fatal_error_surfaces_and_counts_as_failure() {
    let store = Arc::new(MemoryStateStore::new());
    store.insert("broken", SourceState::new(["A|1"])).await;
    let sink = Arc::new(MemorySink::new());
    let c = ctx(store.clone(), sink.clone());
    let p = poller(Scripted::new("broken", vec![Err("no endpoint".into())]));

    let err = run_cycle(&p, &c, Utc::now()).await.unwrap_err();
    assert!(format!("{err:#}").contains("no endpoint"));
    assert_eq!(store.load("broken").await.unwrap(), SourceState::new(["A|1"]));
    assert_eq!(c.health.get("broken").consecutive_failures, 1);
}

#[tokio::test]
async fn one_failing_source_does_not_block_another() {
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(MemorySink::new());
    let c = ctx(store.clone(), sink.clone());
    let good = poller(Scripted::new("good", vec![fresh(vec![rec("G", "1")])]));
    let bad = poller(Scripted::new("bad", vec![Err("boom".into())]));
    let now = Utc::now();

    let (rg, rb) = tokio::join!(run_cycle(&good, &c, now), run_cycle(&bad, &c, now));
    assert!(rb.is_err());
    assert_eq!(rg.unwrap(), CycleReport::Completed { emitted: 1, known: 1 });
    assert_eq!(store.load("good").await.unwrap().len(), 1);
}

#[tokio::test]
async fn same_key_cycles_do_not_double_emit() {
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(MemorySink::new());
    let c = ctx(store.clone(), sink.clone());
    let p1 = poller(Scripted::new("shared", vec![fresh(vec![rec("A", "1")])]));
    let p2 = poller(Scripted::new("shared", vec![fresh(vec![rec("A", "1")])]));
    let now = Utc::now();

    let (r1, r2) = tokio::join!(run_cycle(&p1, &c, now), run_cycle(&p2, &c, now));
    r1.unwrap();
    r2.unwrap();
    assert_eq!(sink.events().len(), 1);
}

#[tokio::test]
async fn file_store_survives_between_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStateStore::new(dir.path()));
    let sink = Arc::new(MemorySink::new());
    let c = ctx(store.clone(), sink.clone());
    let p = poller(Scripted::new(
        "echo-sso",
        vec![
            fresh(vec![rec("A", "1")]),
            fresh(vec![rec("A", "1"), rec("B", "2")]),
        ],
    ));

    run_cycle(&p, &c, Utc::now()).await.unwrap();
    let reopened = JsonFileStateStore::new(dir.path());
    assert!(reopened.load("echo-sso").await.unwrap().contains("A|1"));

    let r = run_cycle(&p, &c, Utc::now()).await.unwrap();
    assert_eq!(r, CycleReport::Completed { emitted: 1, known: 2 });
    assert_eq!(sink.events()[1].metadata.source_record_id, "B|2");
}

#[tokio::test(start_paused = true)]
async fn spawned_scheduler_ticks_each_source() {
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(MemorySink::new());
    let c = Arc::new(ctx(store.clone(), sink.clone()));
    let pollers = vec![
        poller(Scripted::new("one", vec![fresh(vec![rec("A", "1")])])),
        poller(Scripted::new("two", vec![fresh(vec![rec("B", "1")])])),
    ];

    let handles = spawn_scheduler(pollers, c);
    // First tick fires immediately.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    for _ in 0..50 {
        if sink.events().len() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    for h in &handles {
        h.abort();
    }
    assert_eq!(sink.events().len(), 2);
    assert_eq!(store.load("one").await.unwrap().len(), 1);
    assert_eq!(store.load("two").await.unwrap().len(), 1);
}
