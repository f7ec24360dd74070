//! Identity-key deduplication against the previously seen set.
//!
//! Pure transformation: `(records, prior state) -> (new events, next state)`.
//! The next state holds the keys of every record visible in this poll, not the
//! union with the prior set, so keys that leave the upstream window age out.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::ingest::types::{
    ChangeEvent, ChangeType, EventMetadata, Geography, RawRecord, SourceKind, SourceState,
};
use crate::severity::SeverityThresholds;

const FRAGMENT_MAX: usize = 40;

/// Deterministic dedup key: `permit|event_date`, both verbatim.
pub fn identity_key(rec: &RawRecord) -> String {
    format!("{}|{}", rec.permit_id, rec.event_date)
}

/// `{prefix}-{fragment}-{millis base36}{index base36}`.
/// Unique enough to tell events apart, not a cryptographic id.
pub fn event_id(kind: SourceKind, key: &str, detected_at: DateTime<Utc>, index: usize) -> String {
    static RE_UNSAFE: OnceCell<Regex> = OnceCell::new();
    let re = RE_UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9]+").unwrap());

    let mut fragment = re.replace_all(key, "_").trim_matches('_').to_string();
    if fragment.len() > FRAGMENT_MAX {
        fragment.truncate(FRAGMENT_MAX);
    }
    if fragment.is_empty() {
        fragment.push_str("unknown");
    }

    let millis = u64::try_from(detected_at.timestamp_millis()).unwrap_or(0);
    format!(
        "{}-{}-{}{}",
        kind.event_prefix(),
        fragment,
        base36(millis),
        base36(index as u64)
    )
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

/// Best-effort parse of the upstream event date.
pub fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%m/%d/%Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ndt.and_utc());
        }
    }
    for fmt in ["%m/%d/%Y", "%Y-%m-%d", "%d-%b-%y", "%d-%b-%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
        }
    }
    None
}

fn build_payload(rec: &RawRecord) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("permitId".into(), json!(rec.permit_id));
    payload.insert("eventDate".into(), json!(rec.event_date));
    if let Some(name) = &rec.facility_name {
        payload.insert("facilityName".into(), json!(name));
    }
    payload.insert("volumeGallons".into(), json!(rec.volume));
    payload.insert("durationHours".into(), json!(rec.duration_hours));
    if let Some(cause) = &rec.cause {
        payload.insert("cause".into(), json!(cause));
    }
    payload
}

/// Result of one detection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub events: Vec<ChangeEvent>,
    pub next_state: SourceState,
}

impl Detection {
    /// Identity keys of the emitted events, in emission order.
    pub fn new_keys(&self) -> Vec<&str> {
        self.events
            .iter()
            .map(|e| e.metadata.source_record_id.as_str())
            .collect()
    }
}

/// Find records whose identity key is absent from `prior` and build events for them.
///
/// A key repeated inside one batch is emitted once.
pub fn detect_changes(
    kind: SourceKind,
    records: &[RawRecord],
    prior: &SourceState,
    thresholds: &SeverityThresholds,
    now: DateTime<Utc>,
) -> Detection {
    let mut visible: BTreeSet<String> = BTreeSet::new();
    let mut events = Vec::new();

    for rec in records {
        let key = identity_key(rec);
        let first_in_batch = visible.insert(key.clone());
        if !first_in_batch || prior.contains(&key) {
            continue;
        }

        let severity = thresholds.classify(rec.duration_hours, rec.volume);
        let facility_id = (!rec.permit_id.is_empty()).then(|| rec.permit_id.clone());

        events.push(ChangeEvent {
            event_id: event_id(kind, &key, now, events.len()),
            source: kind,
            detected_at: now,
            source_timestamp: parse_source_timestamp(&rec.event_date),
            change_type: ChangeType::NewRecord,
            geography: Geography {
                state_abbr: rec.state_abbr.clone(),
                lat: rec.lat,
                lng: rec.lng,
            },
            severity_hint: severity,
            payload: build_payload(rec),
            metadata: EventMetadata {
                source_record_id: key,
                facility_id,
            },
        });
    }

    Detection {
        events,
        next_state: SourceState { known_ids: visible },
    }
}
