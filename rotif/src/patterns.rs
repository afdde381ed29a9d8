//! Pattern registry and cross-process discovery (spec.md §4.4). The
//! `rotif:patterns` sorted set tracks a reference count per glob pattern;
//! this module keeps an in-memory mirror up to date via a dedicated pub/sub
//! connection, grounded on the teacher's `celerity_ws_redis::pubsub::connect`
//! dedicated-connection-forwarding-to-an-internal-channel idiom.

use std::collections::HashMap;
use std::sync::Arc;

use globset::GlobBuilder;
use redis::PushKind;
use rotif_helpers::redis::{get_redis_connection, ConnectionConfig, ConnectionWrapper};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::errors::RotifResult;
use crate::keys::PATTERN_REGISTRY_KEY;
use crate::scripts::ScriptRunner;

/// Returns whether `channel` matches the minimatch-style glob `pattern`.
///
/// Channels are dot-segmented (`orders.created`), not path-segmented, so
/// dots are mapped onto globset's `/` separator before compiling: this
/// makes `*` stop at a segment boundary while `**` still crosses it, the
/// same distinction globset reserves for path components.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let glob = match GlobBuilder::new(&pattern.replace('.', "/"))
        .literal_separator(true)
        .build()
    {
        Ok(glob) => glob,
        Err(e) => {
            warn!("invalid glob pattern {pattern}: {e}");
            return false;
        }
    };
    glob.compile_matcher().is_match(channel.replace('.', "/"))
}

/// In-memory mirror of `rotif:patterns`, kept in sync with every other
/// process subscribed to `rotif:subscriptions:updates`.
#[derive(Clone)]
pub struct PatternRegistry {
    active_patterns: Arc<RwLock<HashMap<String, i64>>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self {
            active_patterns: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Connects a dedicated pub/sub connection to the subscription-updates
    /// channel and spawns a task forwarding `add:<pattern>` / `remove:<pattern>`
    /// announcements into the in-memory map, resyncing first from
    /// `rotif:patterns` via `ZRANGEBYSCORE ... 1 +inf`.
    pub async fn start(
        &self,
        conn_config: &ConnectionConfig,
        command_conn: &mut ConnectionWrapper,
        channel_name: &str,
    ) -> RotifResult<()> {
        self.resync(command_conn).await?;

        let (redis_tx, mut redis_rx) = unbounded_channel();
        let mut pubsub_conn = get_redis_connection(conn_config, Some(redis_tx)).await?;
        pubsub_conn.subscribe(channel_name).await?;

        let active_patterns = self.active_patterns.clone();
        let channel_name = channel_name.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(message) = redis_rx.recv() => {
                        if message.kind != PushKind::Message {
                            continue;
                        }
                        let Ok(payload) = redis::FromRedisValue::from_redis_value(&message.data[1])
                            .map(|v: String| v)
                        else {
                            continue;
                        };
                        if let Some(pattern) = payload.strip_prefix("add:") {
                            active_patterns.write().await.insert(pattern.to_string(), 1);
                            debug!("pattern registry: added {pattern}");
                        } else if let Some(pattern) = payload.strip_prefix("remove:") {
                            active_patterns.write().await.remove(pattern);
                            debug!("pattern registry: removed {pattern}");
                        }
                    }
                    else => {
                        error!("pattern update listener on {channel_name} terminated");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Rebuilds the in-memory set from `rotif:patterns`, used on startup and
    /// after a pub/sub reconnect.
    pub async fn resync(&self, conn: &mut ConnectionWrapper) -> RotifResult<()> {
        let entries = conn.zrangebyscore_withscores(PATTERN_REGISTRY_KEY, 1.0).await?;
        let mut map = self.active_patterns.write().await;
        map.clear();
        for (pattern, score) in entries {
            map.insert(pattern, score as i64);
        }
        Ok(())
    }

    /// Registers one more subscriber for `pattern`; announces `add:<pattern>`
    /// on the update channel if the refcount transitioned 0 -> 1.
    pub async fn subscribe_pattern(
        &self,
        conn: &mut ConnectionWrapper,
        update_channel: &str,
        pattern: &str,
    ) -> RotifResult<()> {
        let new_score = conn.zincrby(PATTERN_REGISTRY_KEY, pattern, 1.0).await?;
        self.active_patterns
            .write()
            .await
            .insert(pattern.to_string(), new_score as i64);
        if (new_score - 1.0).abs() < f64::EPSILON {
            conn.publish(update_channel, format!("add:{pattern}")).await?;
        }
        Ok(())
    }

    /// Deregisters one subscriber for `pattern` via the `safe-unsubscribe`
    /// script; announces `remove:<pattern>` on transition 1 -> 0.
    pub async fn unsubscribe_pattern(
        &self,
        conn: &mut ConnectionWrapper,
        scripts: &ScriptRunner,
        update_channel: &str,
        pattern: &str,
    ) -> RotifResult<()> {
        let new_score = scripts
            .safe_unsubscribe(conn, PATTERN_REGISTRY_KEY, pattern)
            .await?;
        if new_score <= 0.0 {
            self.active_patterns.write().await.remove(pattern);
            conn.publish(update_channel, format!("remove:{pattern}")).await?;
        } else {
            self.active_patterns
                .write()
                .await
                .insert(pattern.to_string(), new_score as i64);
        }
        Ok(())
    }

    /// Returns every active pattern matching `channel`.
    pub async fn matching_patterns(&self, channel: &str) -> Vec<String> {
        self.active_patterns
            .read()
            .await
            .keys()
            .filter(|pattern| pattern_matches(pattern, channel))
            .cloned()
            .collect()
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches_star_within_segment() {
        assert!(pattern_matches("orders.*", "orders.created"));
        assert!(!pattern_matches("orders.*", "orders.created.extra"));
    }

    #[test]
    fn test_pattern_matches_double_star_across_segments() {
        assert!(pattern_matches("orders.**", "orders.created.extra"));
        assert!(pattern_matches("**", "anything.at.all"));
    }

    #[tokio::test]
    async fn test_matching_patterns_filters_by_glob() {
        let registry = PatternRegistry::new();
        registry
            .active_patterns
            .write()
            .await
            .insert("orders.*".to_string(), 1);
        registry
            .active_patterns
            .write()
            .await
            .insert("users.*".to_string(), 1);

        let matches = registry.matching_patterns("orders.created").await;
        assert_eq!(matches, vec!["orders.*".to_string()]);
    }
}
