//! Redis key and stream naming conventions for the broker.
//!
//! Centralising these avoids subtle drift between the publish pipeline, the
//! consumer loop and the DLQ manager reaching for slightly different key
//! shapes for the same concept.

use std::process;

use rand::Rng;

pub const SCHEDULED_SET_KEY: &str = "rotif:scheduled";
pub const DLQ_STREAM_KEY: &str = "rotif:dlq";
pub const PATTERN_REGISTRY_KEY: &str = "rotif:patterns";
pub const SUBSCRIPTION_UPDATES_CHANNEL: &str = "rotif:subscriptions:updates";
pub const DEFAULT_CONSUMER_GROUP: &str = "rotif-group";

pub fn stream_key(pattern: &str) -> String {
    format!("rotif:stream:{pattern}")
}

pub fn retry_stream_key(pattern: &str) -> String {
    format!("{}:retry", stream_key(pattern))
}

pub fn dedup_publish_key(pattern: &str, channel: &str, payload_hash: &str) -> String {
    format!("rotif:dedup:pub:{pattern}:{channel}:{payload_hash}")
}

pub fn dedup_consume_key(group: &str, channel: &str, payload_hash: &str) -> String {
    format!("rotif:dedup:con:{group}:{channel}:{payload_hash}")
}

pub fn dlq_archive_key(date: &str) -> String {
    format!("rotif:dlq:archive:{date}")
}

/// Derives a default consumer name unique to this process and task, in the
/// `<host>:<pid>:<rand0..9999>` shape from spec.md.
pub fn default_consumer_name() -> String {
    let host = hostname();
    let pid = process::id();
    let rand_suffix: u32 = rand::thread_rng().gen_range(0..10000);
    format!("{host}:{pid}:{rand_suffix}")
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_and_retry_stream_key() {
        assert_eq!(stream_key("orders.*"), "rotif:stream:orders.*");
        assert_eq!(
            retry_stream_key("orders.*"),
            "rotif:stream:orders.*:retry"
        );
    }

    #[test]
    fn test_dedup_keys_are_namespaced_by_side() {
        let pub_key = dedup_publish_key("orders.*", "orders.created", "abc123");
        let con_key = dedup_consume_key("rotif-group", "orders.created", "abc123");
        assert_eq!(pub_key, "rotif:dedup:pub:orders.*:orders.created:abc123");
        assert_eq!(con_key, "rotif:dedup:con:rotif-group:orders.created:abc123");
        assert_ne!(pub_key, con_key);
    }

    #[test]
    fn test_default_consumer_name_has_three_colon_separated_parts() {
        let name = default_consumer_name();
        assert_eq!(name.split(':').count(), 3);
    }
}
