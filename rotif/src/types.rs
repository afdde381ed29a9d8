use std::sync::atomic::{AtomicU64, Ordering};

use redis::streams::StreamId;
use redis::Value;
use serde::{Deserialize, Serialize};

/// A message flowing through the broker. `id` is the broker-assigned stream
/// entry ID once the message has been written to a stream; it is empty for
/// messages that only exist as a scheduled-set member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel: String,
    pub payload: String,
    pub timestamp: u64,
    pub attempt: u32,
    pub pattern: String,
    pub exactly_once: bool,
    pub dedup_ttl_secs: u64,
}

impl Message {
    pub fn validate(&self) -> Result<(), String> {
        if self.channel.is_empty() {
            return Err("channel must not be empty".to_string());
        }
        if self.attempt == 0 {
            return Err("attempt must be >= 1".to_string());
        }
        Ok(())
    }
}

/// The JSON shape stored as a member of the `rotif:scheduled` sorted set.
/// Carries the full message plus a destination-stream hint and a nonce so
/// that two scheduled entries for an identical payload remain distinguishable
/// members of the set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEntry {
    #[serde(flatten)]
    pub message: Message,
    pub target_stream: String,
    pub nonce: String,
}

/// A message that failed to process and was moved to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub channel: String,
    pub payload: String,
    pub error: String,
    pub timestamp: u64,
    pub attempt: u32,
}

impl DlqEntry {
    pub fn to_field_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("channel", self.channel.clone()),
            ("payload", self.payload.clone()),
            ("error", self.error.clone()),
            ("timestamp", self.timestamp.to_string()),
            ("attempt", self.attempt.to_string()),
        ]
    }

    pub fn from_stream_id(stream_id: &StreamId) -> Option<Self> {
        Some(Self {
            id: stream_id.id.clone(),
            channel: field_string(stream_id, "channel")?,
            payload: field_string(stream_id, "payload")?,
            error: field_string(stream_id, "error").unwrap_or_default(),
            timestamp: field_string(stream_id, "timestamp")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            attempt: field_string(stream_id, "attempt")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
        })
    }
}

pub(crate) fn field_string(stream_id: &StreamId, field: &str) -> Option<String> {
    match stream_id.map.get(field)? {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

impl Message {
    /// Reconstructs a `Message` from a stream record's field-value pairs, as
    /// written by the publish / retry / scheduler-promotion scripts.
    pub fn from_stream_id(stream_id: &StreamId, pattern_fallback: &str) -> Option<Self> {
        Some(Self {
            id: stream_id.id.clone(),
            channel: field_string(stream_id, "channel")?,
            payload: field_string(stream_id, "payload")?,
            timestamp: field_string(stream_id, "timestamp")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            attempt: field_string(stream_id, "attempt")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            pattern: field_string(stream_id, "pattern").unwrap_or_else(|| pattern_fallback.to_string()),
            exactly_once: field_string(stream_id, "exactlyOnce")
                .map(|s| s == "1")
                .unwrap_or_default(),
            dedup_ttl_secs: field_string(stream_id, "dedupTTL")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
        })
    }

    pub fn to_field_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("channel", self.channel.clone()),
            ("payload", self.payload.clone()),
            ("timestamp", self.timestamp.to_string()),
            ("attempt", self.attempt.to_string()),
            ("pattern", self.pattern.clone()),
            ("exactlyOnce", if self.exactly_once { "1" } else { "0" }.to_string()),
            ("dedupTTL", self.dedup_ttl_secs.to_string()),
        ]
    }
}

/// The outcome of a `publish` call, matching spec.md §4.9 / §7: `null` for
/// no matching pattern, an id or ids for successful writes, or the
/// "DUPLICATE" sentinel when every matching pattern's publish was rejected
/// by deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    NoMatch,
    Ids(Vec<String>),
    Duplicate,
}

/// Options accepted by a single `publish` call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub delay_ms: Option<u64>,
    pub deliver_at_ms: Option<u64>,
    pub exactly_once: bool,
    pub deduplication_ttl_secs: Option<u64>,
}

/// Per-subscription counters, as described in spec.md §3.
#[derive(Debug, Default)]
pub struct Stats {
    messages: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    last_message_at: AtomicU64,
}

/// A point-in-time snapshot of a subscription's stats, returned by the
/// `stats()` handle method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages: u64,
    pub retries: u64,
    pub failures: u64,
    pub last_message_at: u64,
}

impl Stats {
    pub fn record_message(&self, now_ms: u64) {
        self.messages.fetch_add(1, Ordering::SeqCst);
        self.last_message_at.store(now_ms, Ordering::SeqCst);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages: self.messages.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            last_message_at: self.last_message_at.load(Ordering::SeqCst),
        }
    }
}

/// Dispatch mode for a shared consumer loop serving more than one
/// subscription on the same (stream, group) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    FanOut,
    LocalRoundRobin,
}
