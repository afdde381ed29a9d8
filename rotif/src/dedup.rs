//! Deduplication key derivation (spec.md §4.3). Both publisher-side and
//! consumer-side dedup share the same atomic set-if-absent-with-TTL
//! primitive, `ConnectionWrapper::pset_ex_nx`, which the teacher already
//! uses for its DLQ trim lock.

use rotif_helpers::redis::ConnectionWrapper;

use crate::keys::{dedup_consume_key, dedup_publish_key};

/// Hashes a payload into the stable hex digest used as the final segment of
/// a dedup key.
pub fn payload_hash(payload: &str) -> String {
    format!("{:x}", md5::compute(payload.as_bytes()))
}

/// Publisher-side dedup key: keyed by pattern + channel + payload hash, so a
/// duplicate publish to the same pattern/channel is rejected even if a
/// different process double-publishes the same payload.
pub fn publish_key(pattern: &str, channel: &str, payload: &str) -> String {
    dedup_publish_key(pattern, channel, &payload_hash(payload))
}

/// Consumer-side dedup key: keyed by group + channel + payload hash, so a
/// message re-delivered to a restarted consumer group is only ever handled
/// once across every worker holding that group.
pub fn consume_key(group: &str, channel: &str, payload: &str) -> String {
    dedup_consume_key(group, channel, &payload_hash(payload))
}

/// Attempts to acquire the consumer-side dedup key for `exactlyOnce`
/// processing. Returns `true` if this call won the race and should proceed
/// with the handler; `false` if another consumer already holds the key.
pub async fn try_acquire_consume_key(
    conn: &mut ConnectionWrapper,
    group: &str,
    channel: &str,
    payload: &str,
    ttl_ms: u64,
) -> redis::RedisResult<bool> {
    let key = consume_key(group, channel, payload);
    conn.pset_ex_nx(&key, "1", ttl_ms as usize).await
}

/// Deletes the consumer-side dedup key so a failed exactly-once message can
/// be reprocessed on retry, per spec.md §4.6.
pub async fn release_consume_key(
    conn: &mut ConnectionWrapper,
    group: &str,
    channel: &str,
    payload: &str,
) -> redis::RedisResult<()> {
    let key = consume_key(group, channel, payload);
    conn.del(&key).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_hash_is_stable_and_content_sensitive() {
        let a = payload_hash("{\"order\":1}");
        let b = payload_hash("{\"order\":1}");
        let c = payload_hash("{\"order\":2}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_publish_and_consume_keys_are_distinct_namespaces() {
        let pub_key = publish_key("orders.*", "orders.created", "{}");
        let con_key = consume_key("rotif-group", "orders.created", "{}");
        assert_ne!(pub_key, con_key);
        assert!(pub_key.starts_with("rotif:dedup:pub:"));
        assert!(con_key.starts_with("rotif:dedup:con:"));
    }
}
