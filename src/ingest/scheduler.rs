// src/ingest/scheduler.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::task::JoinHandle;

use crate::health::HealthRegistry;
use crate::ingest::config::HealthConfig;
use crate::ingest::sink::EventSink;
use crate::ingest::types::UnavailableReason;
use crate::observe::ensure_metrics_described;
use crate::poller::Poller;
use crate::state_store::StateStore;

/// One async lock per source key. Cycles for the same key never interleave.
#[derive(Debug, Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut m = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        m.entry(key.to_string()).or_default().clone()
    }
}

/// Everything a cycle needs besides the poller itself.
pub struct SchedulerCtx {
    pub store: Arc<dyn StateStore>,
    pub sink: Arc<dyn EventSink>,
    pub health: Arc<HealthRegistry>,
    pub health_cfg: HealthConfig,
    pub interval_secs: u64,
    pub locks: KeyLocks,
}

impl SchedulerCtx {
    pub fn new(
        store: Arc<dyn StateStore>,
        sink: Arc<dyn EventSink>,
        health: Arc<HealthRegistry>,
        health_cfg: HealthConfig,
        interval_secs: u64,
    ) -> Self {
        Self {
            store,
            sink,
            health,
            health_cfg,
            interval_secs,
            locks: KeyLocks::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    /// Source is backing off after failures.
    Skipped { until: Option<DateTime<Utc>> },
    /// Upstream gave nothing; state untouched.
    Unavailable { reason: UnavailableReason },
    Completed { emitted: usize, known: usize },
}

/// One isolated load -> poll -> deliver -> save cycle for a single source.
///
/// Events are delivered before the state is written; if delivery fails the
/// state is left alone so the same records are detected again next cycle.
/// Every failure after the backoff check counts against the source's health.
pub async fn run_cycle(
    poller: &Poller,
    ctx: &SchedulerCtx,
    now: DateTime<Utc>,
) -> Result<CycleReport> {
    ensure_metrics_described();
    let key = poller.name().to_string();

    let current = ctx.health.get(&key);
    if current.should_skip(now) {
        tracing::debug!(source = %key, until = ?current.next_check_after, "backing off");
        return Ok(CycleReport::Skipped {
            until: current.next_check_after,
        });
    }

    let lock = ctx.locks.lock_for(&key);
    let _guard = lock.lock().await;

    let prior = match ctx.store.load(&key).await {
        Ok(state) => state,
        Err(e) => {
            let e = e.context(format!("loading state for {key}"));
            return Err(fail(ctx, &key, now, e));
        }
    };

    let outcome = match poller.poll_at(&prior, now).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let e = anyhow::Error::new(e).context(format!("polling {key}"));
            return Err(fail(ctx, &key, now, e));
        }
    };

    if let Some(reason) = outcome.unavailable {
        ctx.health
            .update(&key, |h| h.record_failure(now, reason.to_string(), &ctx.health_cfg));
        return Ok(CycleReport::Unavailable { reason });
    }

    if let Err(e) = ctx.sink.deliver(&outcome.events).await {
        let e = e.context(format!("delivering {} events for {key}", outcome.events.len()));
        return Err(fail(ctx, &key, now, e));
    }
    counter!("sentinel_events_emitted_total").increment(outcome.events.len() as u64);

    if let Err(e) = ctx.store.save(&key, &outcome.updated_state).await {
        let e = e.context(format!("saving state for {key}"));
        return Err(fail(ctx, &key, now, e));
    }

    ctx.health
        .update(&key, |h| h.record_success(now, ctx.interval_secs));

    Ok(CycleReport::Completed {
        emitted: outcome.events.len(),
        known: outcome.updated_state.len(),
    })
}

/// Count a failed cycle against the source's health and hand the error back.
fn fail(ctx: &SchedulerCtx, key: &str, now: DateTime<Utc>, e: anyhow::Error) -> anyhow::Error {
    ctx.health
        .update(key, |h| h.record_failure(now, format!("{e:#}"), &ctx.health_cfg));
    e
}

/// Spawn one ticking task per poller. A failing source only affects its own task.
pub fn spawn_scheduler(pollers: Vec<Poller>, ctx: Arc<SchedulerCtx>) -> Vec<JoinHandle<()>> {
    pollers
        .into_iter()
        .map(|poller| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let period = std::time::Duration::from_secs(ctx.interval_secs.max(1));
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let now = Utc::now();
                    counter!("sentinel_cycles_total").increment(1);

                    match run_cycle(&poller, &ctx, now).await {
                        Ok(report) => {
                            tracing::info!(target: "ingest", source = poller.name(), ?report, "poll cycle");
                        }
                        Err(e) => {
                            counter!("sentinel_cycle_failures_total").increment(1);
                            tracing::warn!(target: "ingest", source = poller.name(), error = ?e, "poll cycle failed");
                        }
                    }
                    gauge!("sentinel_last_cycle_ts").set(now.timestamp() as f64);
                }
            })
        })
        .collect()
}
