use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;

pub const REQUEST_LOG_CAPACITY: usize = 10_000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogAction {
    Allow,
    Block,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Proxy,
    Dns,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestLogEntry {
    pub id: u64,
    pub timestamp: i64,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    pub action: LogAction,
    pub source: LogSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One allow/block decision, before the log assigns it an ID and timestamp.
#[derive(Clone, Debug)]
pub struct Decision {
    pub domain: String,
    pub port: Option<String>,
    pub action: LogAction,
    pub source: LogSource,
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainStats {
    pub allowed: u64,
    pub blocked: u64,
}

#[derive(Debug)]
struct LogInner {
    entries: Vec<Option<RequestLogEntry>>,
    pos: usize,
    full: bool,
    next_id: u64,
    stats: HashMap<String, DomainStats>,
}

/// Bounded in-memory log of every allow/block decision. A ring buffer keeps
/// memory flat while monotonic IDs give clients a stable polling cursor;
/// per-domain counters survive eviction.
#[derive(Debug)]
pub struct RequestLog {
    inner: Mutex<LogInner>,
    capacity: usize,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::with_capacity(REQUEST_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                entries: vec![None; capacity],
                pos: 0,
                full: false,
                next_id: 1,
                stats: HashMap::new(),
            }),
            capacity,
        }
    }

    /// Append a decision. Serialized under the buffer mutex; the earlier
    /// completer always receives the lower ID.
    pub fn add(&self, decision: Decision) -> u64 {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;

        let stats = inner.stats.entry(decision.domain.clone()).or_default();
        match decision.action {
            LogAction::Allow => stats.allowed += 1,
            LogAction::Block => stats.blocked += 1,
        }

        let entry = RequestLogEntry {
            id,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            domain: decision.domain,
            port: decision.port,
            action: decision.action,
            source: decision.source,
            reason: decision.reason,
        };
        let pos = inner.pos;
        inner.entries[pos] = Some(entry);
        inner.pos = (pos + 1) % self.capacity;
        if inner.pos == 0 && !inner.full {
            inner.full = true;
        }
        id
    }

    /// Chronologically ordered copy of all live entries.
    pub fn entries(&self) -> Vec<RequestLogEntry> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        collect_ring(&inner.entries, inner.pos, inner.full)
    }

    /// Entries with ID strictly greater than `after_id`. An `after_id` of 0
    /// returns at most the last 25 entries; a cursor older than the oldest
    /// live entry returns everything currently held.
    pub fn entries_after(&self, after_id: u64) -> Vec<RequestLogEntry> {
        let all = self.entries();
        tail_after(all, after_id)
    }

    pub fn stats(&self) -> HashMap<String, DomainStats> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.stats.clone()
    }
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn collect_ring<T: Clone>(slots: &[Option<T>], pos: usize, full: bool) -> Vec<T> {
    let mut out = Vec::new();
    if full {
        for slot in &slots[pos..] {
            out.extend(slot.clone());
        }
    }
    for slot in &slots[..pos] {
        out.extend(slot.clone());
    }
    out
}

pub(crate) fn tail_after<T>(all: Vec<T>, after_id: u64) -> Vec<T>
where
    T: HasId,
{
    const DEFAULT_TAIL: usize = 25;
    if after_id == 0 {
        let skip = all.len().saturating_sub(DEFAULT_TAIL);
        return all.into_iter().skip(skip).collect();
    }
    all.into_iter().filter(|e| e.id() > after_id).collect()
}

pub(crate) trait HasId {
    fn id(&self) -> u64;
}

impl HasId for RequestLogEntry {
    fn id(&self) -> u64 {
        self.id
    }
}
