use crate::request_log::HasId;
use crate::request_log::collect_ring;
use crate::request_log::tail_after;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;

pub const EVENT_CAPACITY: usize = 10_000;
pub const METRIC_SERIES_CAP: usize = 1_000;
pub const MAX_ATTRS: usize = 64;
pub const MAX_ATTR_VALUE_BYTES: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub id: u64,
    pub timestamp: i64,
    pub agent: String,
    pub event_name: String,
    pub attrs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_log: Option<serde_json::Value>,
}

impl HasId for TelemetryEvent {
    fn id(&self) -> u64 {
        self.id
    }
}

/// An agent event before the buffer assigns its ID and timestamp.
#[derive(Clone, Debug)]
pub struct EventInput {
    pub agent: String,
    pub event_name: String,
    pub attrs: BTreeMap<String, String>,
    pub raw_log: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricSummary {
    pub name: String,
    pub agent: String,
    pub value: f64,
    pub attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl MetricSummary {
    fn key(&self) -> (String, String, String) {
        (
            self.name.clone(),
            self.agent.clone(),
            self.attributes.get("type").cloned().unwrap_or_default(),
        )
    }
}

#[derive(Debug)]
struct TelemetryInner {
    events: Vec<Option<TelemetryEvent>>,
    pos: usize,
    full: bool,
    next_id: u64,
    metrics: HashMap<(String, String, String), MetricSummary>,
}

/// Agent telemetry store: an event ring buffer with the same cursor contract
/// as the request log, plus a bounded map of metric summaries. One mutex
/// covers both; critical sections are O(1) for inserts.
#[derive(Debug)]
pub struct TelemetryBuffer {
    inner: Mutex<TelemetryInner>,
    capacity: usize,
    series_cap: usize,
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self::with_limits(EVENT_CAPACITY, METRIC_SERIES_CAP)
    }

    pub fn with_limits(capacity: usize, series_cap: usize) -> Self {
        Self {
            inner: Mutex::new(TelemetryInner {
                events: vec![None; capacity],
                pos: 0,
                full: false,
                next_id: 1,
                metrics: HashMap::new(),
            }),
            capacity,
            series_cap,
        }
    }

    pub fn record_event(&self, input: EventInput) -> u64 {
        let attrs = trim_attrs(input.attrs);
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        let event = TelemetryEvent {
            id,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            agent: input.agent,
            event_name: input.event_name,
            attrs,
            raw_log: input.raw_log,
        };
        let pos = inner.pos;
        inner.events[pos] = Some(event);
        inner.pos = (pos + 1) % self.capacity;
        if inner.pos == 0 && !inner.full {
            inner.full = true;
        }
        id
    }

    /// Upsert a metric sample. Existing series are always updated; new
    /// series are silently dropped once the cap is reached.
    pub fn record_metric(&self, summary: MetricSummary) {
        let key = summary.key();
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.metrics.contains_key(&key) || inner.metrics.len() < self.series_cap {
            inner.metrics.insert(key, summary);
        }
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        collect_ring(&inner.events, inner.pos, inner.full)
    }

    pub fn events_after(&self, after_id: u64) -> Vec<TelemetryEvent> {
        tail_after(self.events(), after_id)
    }

    /// Snapshot of all metric summaries, ordered by `(agent, name)`.
    pub fn metrics(&self) -> Vec<MetricSummary> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out: Vec<MetricSummary> = inner.metrics.values().cloned().collect();
        out.sort_by(|a, b| (&a.agent, &a.name).cmp(&(&b.agent, &b.name)));
        out
    }
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_attrs(attrs: BTreeMap<String, String>) -> BTreeMap<String, String> {
    attrs
        .into_iter()
        .take(MAX_ATTRS)
        .map(|(key, value)| (key, truncate_utf8(value, MAX_ATTR_VALUE_BYTES)))
        .collect()
}

/// Truncate to at most `max_bytes` without splitting a multibyte character.
fn truncate_utf8(mut value: String, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes;
    while cut > 0 && !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value.truncate(cut);
    value
}
