// src/ingest/providers/echo_sso.rs
//! EPA ECHO sanitary/combined sewer overflow feed.
//!
//! The feed is best-effort public data: every transient failure is turned
//! into [`FetchOutcome::Unavailable`] and reported to the observer. Only
//! request-construction problems come back as [`SourceError`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::ingest::config::{EchoConfig, MAX_LOOKBACK_DAYS};
use crate::ingest::fields;
use crate::ingest::types::{
    FetchOutcome, RawRecord, RecordSource, SourceError, SourceKind, UnavailableReason,
};
use crate::observe::{PollObserver, TracingObserver};

const PERMIT: &[&str] = &["NPDESID", "npdes_id"];
const EVENT_DATE: &[&str] = &["EventDate", "event_date"];
const FACILITY: &[&str] = &["FacilityName", "facility_name"];
const VOLUME: &[&str] = &["VolumeGallons", "volume_gallons"];
const DURATION: &[&str] = &["DurationHours", "duration_hours"];
const CAUSE: &[&str] = &["Cause", "cause"];
const STATE: &[&str] = &["State", "state"];
const LATITUDE: &[&str] = &["Latitude", "latitude"];
const LONGITUDE: &[&str] = &["Longitude", "longitude"];

/// Translate one untyped upstream object into a [`RawRecord`].
///
/// Defaulting rules: identity and descriptive strings become empty/`None`
/// when absent, magnitudes become 0 when absent or unparseable, coordinates
/// stay `None` unless they parse.
pub fn record_from_json(obj: &Map<String, Value>) -> RawRecord {
    RawRecord {
        permit_id: fields::text_or_empty(obj, PERMIT),
        event_date: fields::text_or_empty(obj, EVENT_DATE),
        facility_name: fields::text(obj, FACILITY),
        volume: fields::number_or_zero(obj, VOLUME),
        duration_hours: fields::number_or_zero(obj, DURATION),
        cause: fields::text(obj, CAUSE),
        state_abbr: fields::text(obj, STATE),
        lat: fields::number(obj, LATITUDE),
        lng: fields::number(obj, LONGITUDE),
    }
}

/// Accepts `{Results: {SSOEvents: [...]}}` and `{Results: [...]}`.
/// Returns `(records, skipped_non_objects)`.
pub fn parse_body(body: &str) -> Result<(Vec<RawRecord>, usize), UnavailableReason> {
    let root: Value = serde_json::from_str(body)
        .map_err(|e| UnavailableReason::Malformed(format!("json: {e}")))?;

    let results = root
        .get("Results")
        .ok_or_else(|| UnavailableReason::Malformed("missing `Results`".into()))?;

    let items = match results {
        Value::Array(items) => items,
        Value::Object(o) => match o.get("SSOEvents") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(UnavailableReason::Malformed(
                    "`Results` has no `SSOEvents` array".into(),
                ))
            }
        },
        _ => {
            return Err(UnavailableReason::Malformed(
                "`Results` is neither object nor array".into(),
            ))
        }
    };

    let mut out = Vec::with_capacity(items.len());
    let mut skipped = 0usize;
    for it in items {
        match it.as_object() {
            Some(obj) => out.push(record_from_json(obj)),
            None => skipped += 1,
        }
    }
    Ok((out, skipped))
}

/// `MM/DD/YYYY` start of the rolling window ending at `now`.
///
/// `None` when the window reaches past the earliest representable date.
pub fn window_start(now: DateTime<Utc>, lookback_days: u32) -> Option<String> {
    let from = now.checked_sub_signed(chrono::Duration::days(i64::from(lookback_days)))?;
    Some(from.format("%m/%d/%Y").to_string())
}

pub struct EchoSsoClient {
    name: String,
    mode: Mode,
    observer: Arc<dyn PollObserver>,
}

enum Mode {
    Fixture(String),
    Http {
        cfg: EchoConfig,
        client: reqwest::Client,
    },
}

impl EchoSsoClient {
    /// HTTP mode. Fails if the endpoint does not parse or the client cannot be built.
    pub fn from_config(name: impl Into<String>, cfg: EchoConfig) -> Result<Self, SourceError> {
        reqwest::Url::parse(&cfg.endpoint).map_err(|e| SourceError::InvalidEndpoint {
            url: cfg.endpoint.clone(),
            reason: e.to_string(),
        })?;
        if cfg.timeout_secs == 0 {
            return Err(SourceError::Misconfigured("echo.timeout_secs must be > 0".into()));
        }
        if cfg.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(SourceError::Misconfigured(format!(
                "echo.lookback_days must be <= {MAX_LOOKBACK_DAYS}, got {}",
                cfg.lookback_days
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(concat!("sso-sentinel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(SourceError::ClientBuild)?;
        Ok(Self {
            name: name.into(),
            mode: Mode::Http { cfg, client },
            observer: Arc::new(TracingObserver),
        })
    }

    /// Serve a fixed response body instead of calling the network.
    pub fn from_fixture_str(name: impl Into<String>, body: &str) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Fixture(body.to_string()),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PollObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn unavailable(&self, reason: UnavailableReason) -> FetchOutcome {
        self.observer.source_unavailable(&self.name, &reason);
        FetchOutcome::Unavailable(reason)
    }

    fn parse(&self, body: &str) -> FetchOutcome {
        let t0 = Instant::now();
        match parse_body(body) {
            Ok((records, skipped)) => {
                let ms = t0.elapsed().as_secs_f64() * 1_000.0;
                self.observer.records_parsed(&self.name, records.len(), skipped, ms);
                FetchOutcome::Fresh(records)
            }
            Err(reason) => self.unavailable(reason),
        }
    }

    async fn fetch_http(
        &self,
        cfg: &EchoConfig,
        client: &reqwest::Client,
    ) -> Result<FetchOutcome, SourceError> {
        let from = window_start(Utc::now(), cfg.lookback_days).ok_or_else(|| {
            SourceError::Misconfigured(format!(
                "echo.lookback_days = {} reaches before the earliest representable date",
                cfg.lookback_days
            ))
        })?;
        let mut params: Vec<(&str, &str)> = vec![(cfg.date_param.as_str(), from.as_str())];
        params.extend(cfg.extra_params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let req = client
            .get(&cfg.endpoint)
            .query(&params)
            .build()
            .map_err(|e| SourceError::InvalidRequest(e.to_string()))?;

        let resp = match client.execute(req).await {
            Ok(resp) => resp,
            Err(e) if e.is_builder() => return Err(SourceError::InvalidRequest(e.to_string())),
            Err(e) if e.is_timeout() => return Ok(self.unavailable(UnavailableReason::Timeout)),
            Err(e) => {
                return Ok(self.unavailable(UnavailableReason::Transport(e.to_string())));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            return Ok(self.unavailable(UnavailableReason::Status(status.as_u16())));
        }

        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Ok(self.unavailable(UnavailableReason::Timeout)),
            Err(e) => {
                return Ok(self.unavailable(UnavailableReason::Transport(e.to_string())));
            }
        };

        Ok(self.parse(&body))
    }
}

#[async_trait]
impl RecordSource for EchoSsoClient {
    async fn fetch_raw_records(&self) -> Result<FetchOutcome, SourceError> {
        match &self.mode {
            Mode::Fixture(body) => Ok(self.parse(body)),
            Mode::Http { cfg, client } => self.fetch_http(cfg, client).await,
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SsoCso
    }

    fn name(&self) -> &str {
        &self.name
    }
}
