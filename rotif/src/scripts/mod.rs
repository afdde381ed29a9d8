//! Wrappers around the seven atomic Lua scripts from spec.md §4.2. Each
//! script is loaded once via `redis::Script::new(include_str!(...))`,
//! mirroring the teacher's `update_last_message_id` in
//! `message_consumer.rs`; `redis::Script` already retries `EVALSHA` misses
//! with a full `EVAL`, so none of the wrapper methods handle `NOSCRIPT`
//! themselves.

use redis::{RedisResult, Script};

use rotif_helpers::redis::ConnectionWrapper;

/// Delivery type passed to `publish-message`, matching spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryType {
    Normal,
    Delayed,
}

impl DeliveryType {
    fn as_str(self) -> &'static str {
        match self {
            DeliveryType::Normal => "normal",
            DeliveryType::Delayed => "delayed",
        }
    }
}

/// The outcome of invoking `publish-message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishScriptResult {
    Id(String),
    Scheduled(String),
    Duplicate,
}

/// Arguments for a single `publish-message` invocation.
pub struct PublishMessageArgs<'a> {
    pub stream: &'a str,
    pub scheduled_set: &'a str,
    pub payload: &'a str,
    pub timestamp_ms: u64,
    pub channel: &'a str,
    pub attempt: u32,
    pub delivery_type: DeliveryType,
    pub delay_timestamp_ms: u64,
    pub max_stream_length: Option<u64>,
    pub min_stream_id: Option<&'a str>,
    pub dedup_key: Option<&'a str>,
    pub dedup_ttl_ms: u64,
    pub nonce: &'a str,
    pub exactly_once: bool,
    pub pattern: &'a str,
}

/// Arguments for a single `retry-message` invocation.
pub struct RetryMessageArgs<'a> {
    pub retry_stream: &'a str,
    pub scheduled_set: &'a str,
    pub group: &'a str,
    pub id: &'a str,
    pub channel: &'a str,
    pub payload: &'a str,
    pub timestamp_ms: u64,
    pub next_attempt: u32,
    pub due_at_ms: u64,
    pub nonce: &'a str,
    pub exactly_once: bool,
    pub dedup_ttl_ms: u64,
    pub main_stream: &'a str,
    pub pattern: &'a str,
}

/// Arguments for a single `move-to-dlq` invocation.
pub struct MoveToDlqArgs<'a> {
    pub stream: &'a str,
    pub dlq_stream: &'a str,
    pub group: &'a str,
    pub id: &'a str,
    pub channel: &'a str,
    pub payload: &'a str,
    pub error: &'a str,
    pub timestamp_ms: u64,
    pub attempt: u32,
}

/// Holds a compiled `redis::Script` for each of the seven atomic routines.
pub struct ScriptRunner {
    publish_message: Script,
    move_scheduled_messages: Script,
    ack_message: Script,
    retry_message: Script,
    move_to_dlq: Script,
    requeue_from_dlq: Script,
    safe_unsubscribe: Script,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self {
            publish_message: Script::new(include_str!("../../lua-scripts/publish_message.lua")),
            move_scheduled_messages: Script::new(include_str!(
                "../../lua-scripts/move_scheduled_messages.lua"
            )),
            ack_message: Script::new(include_str!("../../lua-scripts/ack_message.lua")),
            retry_message: Script::new(include_str!("../../lua-scripts/retry_message.lua")),
            move_to_dlq: Script::new(include_str!("../../lua-scripts/move_to_dlq.lua")),
            requeue_from_dlq: Script::new(include_str!("../../lua-scripts/requeue_from_dlq.lua")),
            safe_unsubscribe: Script::new(include_str!("../../lua-scripts/safe_unsubscribe.lua")),
        }
    }

    pub async fn publish_message(
        &self,
        conn: &mut ConnectionWrapper,
        args: PublishMessageArgs<'_>,
    ) -> RedisResult<PublishScriptResult> {
        let result: String = conn
            .eval_script(
                &self.publish_message,
                &[args.stream, args.scheduled_set],
                &[
                    args.payload.to_string(),
                    args.timestamp_ms.to_string(),
                    args.channel.to_string(),
                    args.attempt.to_string(),
                    args.delivery_type.as_str().to_string(),
                    args.delay_timestamp_ms.to_string(),
                    args.max_stream_length.unwrap_or(0).to_string(),
                    args.min_stream_id.unwrap_or("").to_string(),
                    args.dedup_key.unwrap_or("").to_string(),
                    args.dedup_ttl_ms.to_string(),
                    args.nonce.to_string(),
                    if args.exactly_once { "1" } else { "0" }.to_string(),
                    args.pattern.to_string(),
                ],
            )
            .await?;

        Ok(if result == "DUPLICATE" {
            PublishScriptResult::Duplicate
        } else if let Some(nonce) = result.strip_prefix("SCHEDULED:") {
            PublishScriptResult::Scheduled(nonce.to_string())
        } else {
            PublishScriptResult::Id(result)
        })
    }

    pub async fn move_scheduled_messages(
        &self,
        conn: &mut ConnectionWrapper,
        scheduled_set: &str,
        now_ms: u64,
        batch_size: isize,
    ) -> RedisResult<i64> {
        conn.eval_script(
            &self.move_scheduled_messages,
            &[scheduled_set],
            &[now_ms.to_string(), batch_size.to_string()],
        )
        .await
    }

    pub async fn ack_message(
        &self,
        conn: &mut ConnectionWrapper,
        stream: &str,
        group: &str,
        id: &str,
        delete: bool,
    ) -> RedisResult<i64> {
        conn.eval_script(
            &self.ack_message,
            &[stream],
            &[
                group.to_string(),
                id.to_string(),
                if delete { "1" } else { "0" }.to_string(),
            ],
        )
        .await
    }

    pub async fn retry_message(
        &self,
        conn: &mut ConnectionWrapper,
        args: RetryMessageArgs<'_>,
    ) -> RedisResult<String> {
        conn.eval_script(
            &self.retry_message,
            &[args.retry_stream, args.scheduled_set],
            &[
                args.group.to_string(),
                args.id.to_string(),
                args.channel.to_string(),
                args.payload.to_string(),
                args.timestamp_ms.to_string(),
                args.next_attempt.to_string(),
                args.due_at_ms.to_string(),
                args.nonce.to_string(),
                if args.exactly_once { "1" } else { "0" }.to_string(),
                args.dedup_ttl_ms.to_string(),
                args.main_stream.to_string(),
                args.pattern.to_string(),
            ],
        )
        .await
    }

    pub async fn move_to_dlq(
        &self,
        conn: &mut ConnectionWrapper,
        args: MoveToDlqArgs<'_>,
    ) -> RedisResult<String> {
        conn.eval_script(
            &self.move_to_dlq,
            &[args.stream, args.dlq_stream],
            &[
                args.group.to_string(),
                args.id.to_string(),
                args.channel.to_string(),
                args.payload.to_string(),
                args.error.to_string(),
                args.timestamp_ms.to_string(),
                args.attempt.to_string(),
            ],
        )
        .await
    }

    pub async fn requeue_from_dlq(
        &self,
        conn: &mut ConnectionWrapper,
        dlq_stream: &str,
        count: usize,
    ) -> RedisResult<i64> {
        conn.eval_script(&self.requeue_from_dlq, &[dlq_stream], &[count.to_string()])
            .await
    }

    pub async fn safe_unsubscribe(
        &self,
        conn: &mut ConnectionWrapper,
        patterns_key: &str,
        pattern: &str,
    ) -> RedisResult<f64> {
        let raw: String = conn
            .eval_script(&self.safe_unsubscribe, &[patterns_key], &[pattern.to_string()])
            .await?;
        Ok(raw.parse().unwrap_or(0.0))
    }
}
