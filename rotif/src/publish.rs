//! The publish pipeline (spec.md §4.9): resolve the channel against the
//! pattern registry, run the `beforePublish`/`afterPublish` middleware hooks
//! around the atomic `publish-message` script, and fold per-pattern results
//! into a single `PublishOutcome`. A publish failure against one matching
//! pattern is logged and reported to `onError` rather than aborting
//! delivery to the others, the same partial-failure stance the teacher
//! takes in `message_consumer.rs` when one of several handlers errors.

use std::sync::Arc;

use rand::Rng;
use rotif_helpers::redis::ConnectionWrapper;
use rotif_helpers::time::Clock;
use tracing::error;

use crate::config::RotifFinalisedConfig;
use crate::consumer_loop::publish_now;
use crate::dedup;
use crate::errors::{RotifError, RotifResult};
use crate::keys::{stream_key, SCHEDULED_SET_KEY};
use crate::middleware::MiddlewarePipeline;
use crate::patterns::PatternRegistry;
use crate::scripts::{DeliveryType, PublishMessageArgs, PublishScriptResult, ScriptRunner};
use crate::types::{PublishOptions, PublishOutcome};

pub struct PublishPipeline {
    conn: ConnectionWrapper,
    scripts: Arc<ScriptRunner>,
    patterns: PatternRegistry,
    middleware: Arc<MiddlewarePipeline>,
    clock: Arc<dyn Clock>,
    config: Arc<RotifFinalisedConfig>,
}

impl PublishPipeline {
    pub fn new(
        conn: ConnectionWrapper,
        scripts: Arc<ScriptRunner>,
        patterns: PatternRegistry,
        middleware: Arc<MiddlewarePipeline>,
        clock: Arc<dyn Clock>,
        config: Arc<RotifFinalisedConfig>,
    ) -> Self {
        Self {
            conn,
            scripts,
            patterns,
            middleware,
            clock,
            config,
        }
    }

    pub async fn publish(
        &self,
        channel: &str,
        payload: &str,
        options: PublishOptions,
    ) -> RotifResult<PublishOutcome> {
        self.middleware.before_publish(channel, payload, &options).await;

        let matching = self.patterns.matching_patterns(channel).await;
        if matching.is_empty() {
            self.middleware.after_publish(channel, payload, "no_match").await;
            return Ok(PublishOutcome::NoMatch);
        }

        let now_ms = self.clock.now_ms();
        let delivery_type = if options.delay_ms.is_some() || options.deliver_at_ms.is_some() {
            DeliveryType::Delayed
        } else {
            DeliveryType::Normal
        };
        let delay_timestamp_ms = match (options.deliver_at_ms, options.delay_ms) {
            (Some(at), _) => at,
            (None, Some(delay)) => now_ms + delay,
            (None, None) => 0,
        };
        let dedup_ttl_secs = options
            .deduplication_ttl_secs
            .unwrap_or(self.config.deduplication_ttl_secs);

        let mut ids = Vec::new();
        let mut any_duplicate = false;
        let mut any_success = false;
        let mut conn = self.conn.clone();

        for pattern in &matching {
            let stream = stream_key(pattern);
            let dedup_key = dedup::publish_key(pattern, channel, payload);
            let nonce = format!("{:x}", rand::thread_rng().gen::<u64>());

            let args = PublishMessageArgs {
                stream: &stream,
                scheduled_set: SCHEDULED_SET_KEY,
                payload,
                timestamp_ms: now_ms,
                channel,
                attempt: 1,
                delivery_type,
                delay_timestamp_ms,
                max_stream_length: self.config.max_stream_length,
                min_stream_id: self.config.min_stream_id.as_deref(),
                dedup_key: options.exactly_once.then(|| dedup_key.as_str()),
                dedup_ttl_ms: dedup_ttl_secs * 1000,
                nonce: &nonce,
                exactly_once: options.exactly_once,
                pattern,
            };

            let result = match delivery_type {
                DeliveryType::Normal => publish_now(&mut conn, &self.scripts, args).await,
                DeliveryType::Delayed => self.scripts.publish_message(&mut conn, args).await,
            };

            match result {
                Ok(PublishScriptResult::Id(id)) => {
                    any_success = true;
                    ids.push(id);
                }
                Ok(PublishScriptResult::Scheduled(nonce)) => {
                    any_success = true;
                    ids.push(nonce);
                }
                Ok(PublishScriptResult::Duplicate) => {
                    any_duplicate = true;
                }
                Err(e) => {
                    let err = RotifError::Transport(e);
                    error!("publish to pattern {pattern} failed: {err}");
                    self.middleware
                        .on_error(&placeholder_message(channel, payload), &err.to_string())
                        .await;
                }
            }
        }

        let outcome = if any_success {
            PublishOutcome::Ids(ids)
        } else if any_duplicate {
            PublishOutcome::Duplicate
        } else {
            PublishOutcome::NoMatch
        };

        self.middleware
            .after_publish(channel, payload, outcome_label(&outcome))
            .await;

        Ok(outcome)
    }
}

fn outcome_label(outcome: &PublishOutcome) -> &'static str {
    match outcome {
        PublishOutcome::NoMatch => "no_match",
        PublishOutcome::Ids(_) => "ok",
        PublishOutcome::Duplicate => "duplicate",
    }
}

fn placeholder_message(channel: &str, payload: &str) -> crate::types::Message {
    crate::types::Message {
        id: String::new(),
        channel: channel.to_string(),
        payload: payload.to_string(),
        timestamp: 0,
        attempt: 1,
        pattern: String::new(),
        exactly_once: false,
        dedup_ttl_secs: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_label_matches_each_variant() {
        assert_eq!(outcome_label(&PublishOutcome::NoMatch), "no_match");
        assert_eq!(outcome_label(&PublishOutcome::Ids(vec!["1-0".to_string()])), "ok");
        assert_eq!(outcome_label(&PublishOutcome::Duplicate), "duplicate");
    }
}
