//! The shared consumer loop (spec.md §4.7): one task per (stream, group)
//! pair, lazily created on first subscribe and torn down once its
//! subscription set empties. Grounded on the teacher's
//! `RedisMessageConsumer::start_worker` / `receive_messages` /
//! `handle_single_message_with_retries` shape, adapted from a single
//! registered handler to fan-out/round-robin dispatch across many local
//! subscriptions sharing one stream.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use redis::streams::StreamId;
use rotif_helpers::redis::ConnectionWrapper;
use rotif_helpers::time::Clock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RotifFinalisedConfig;
use crate::dedup;
use crate::keys::DLQ_STREAM_KEY;
use crate::patterns::pattern_matches;
use crate::retry::RetryStrategy;
use crate::scripts::{DeliveryType, MoveToDlqArgs, PublishMessageArgs, RetryMessageArgs, ScriptRunner};
use crate::subscription::Subscription;
use crate::types::{DispatchMode, Message};

/// Commands sent from the lifecycle manager to a running loop. Only the
/// loop task ever mutates its own subscription set, per the
/// ownership-per-task model.
pub enum LoopCommand {
    Add(Subscription),
    Remove {
        subscription_id: String,
        done: oneshot::Sender<()>,
    },
}

/// A handle the lifecycle manager holds for an attached loop.
pub struct LoopHandle {
    pub command_tx: mpsc::UnboundedSender<LoopCommand>,
    pub join_handle: JoinHandle<()>,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    stream: String,
    group: String,
    dispatch_mode: DispatchMode,
    mut conn: ConnectionWrapper,
    scripts: Arc<ScriptRunner>,
    clock: Arc<dyn Clock>,
    config: Arc<RotifFinalisedConfig>,
    initial_subscription: Subscription,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> LoopHandle {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();

    let join_handle = tokio::spawn(async move {
        let mut subs: Vec<Subscription> = vec![initial_subscription];
        let mut round_robin = 0usize;
        let mut block_interval = Duration::from_millis(config.block_interval_ms);
        let mut pending_check = tokio::time::interval(Duration::from_millis(
            config.pending_check_interval_ms,
        ));

        'outer: loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("consumer loop for {stream}/{group} shutting down");
                    break 'outer;
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        LoopCommand::Add(sub) => {
                            debug!("consumer loop for {stream}/{group} gained a subscription");
                            subs.push(sub);
                        }
                        LoopCommand::Remove { subscription_id, done } => {
                            subs.retain(|s| s.id != subscription_id);
                            let _ = done.send(());
                            if subs.is_empty() {
                                debug!("consumer loop for {stream}/{group} has no subscriptions left, stopping");
                                break 'outer;
                            }
                        }
                    }
                }

                _ = pending_check.tick(), if !config.disable_pending_message_recovery && !subs.is_empty() => {
                    if let Err(e) = recover_stale_pending(
                        &mut conn,
                        &scripts,
                        &stream,
                        &group,
                        config.pending_idle_threshold_ms,
                        &mut subs,
                        &mut round_robin,
                        dispatch_mode,
                        &config,
                        &clock,
                    ).await {
                        error!("stale-pending recovery failed for {stream}/{group}: {e}");
                    }
                }

                read_result = read_batch(&mut conn, &stream, &group, block_interval), if !subs.is_empty() => {
                    block_interval = Duration::from_millis(config.block_interval_ms.min(1000));
                    match read_result {
                        Ok(records) => {
                            for record in records {
                                dispatch_record(
                                    &mut conn,
                                    &scripts,
                                    &stream,
                                    &group,
                                    &record,
                                    &mut subs,
                                    &mut round_robin,
                                    dispatch_mode,
                                    &config,
                                    &clock,
                                ).await;
                            }
                        }
                        Err(e) => error!("failed to read from {stream}: {e}"),
                    }
                }
            }

            if subs.is_empty() {
                // Idle until the lifecycle manager attaches a new subscription
                // or tears this loop down entirely.
                tokio::select! {
                    _ = shutdown_rx.recv() => break 'outer,
                    command = command_rx.recv() => match command {
                        Some(LoopCommand::Add(sub)) => subs.push(sub),
                        Some(LoopCommand::Remove { done, .. }) => { let _ = done.send(()); }
                        None => break 'outer,
                    }
                }
            }
        }
    });

    LoopHandle {
        command_tx,
        join_handle,
    }
}

async fn read_batch(
    conn: &mut ConnectionWrapper,
    stream: &str,
    group: &str,
    block_interval: Duration,
) -> redis::RedisResult<Vec<StreamId>> {
    let consumer = crate::keys::default_consumer_name();
    let reply = conn
        .xreadgroup(group, &consumer, stream, 5000, block_interval.as_millis() as usize)
        .await?;
    let mut records = Vec::new();
    for key in reply.keys {
        records.extend(key.ids);
    }
    Ok(records)
}

#[allow(clippy::too_many_arguments)]
async fn recover_stale_pending(
    conn: &mut ConnectionWrapper,
    scripts: &ScriptRunner,
    stream: &str,
    group: &str,
    idle_threshold_ms: u64,
    subs: &mut [Subscription],
    round_robin: &mut usize,
    dispatch_mode: DispatchMode,
    config: &RotifFinalisedConfig,
    clock: &Arc<dyn Clock>,
) -> redis::RedisResult<()> {
    let pending = conn.xpending_idle(stream, group, idle_threshold_ms, 100).await?;
    if pending.ids.is_empty() {
        return Ok(());
    }
    let consumer = crate::keys::default_consumer_name();
    let ids: Vec<&str> = pending.ids.iter().map(|p| p.id.as_str()).collect();
    let claimed = conn
        .xclaim(stream, group, &consumer, idle_threshold_ms, &ids)
        .await?;
    for record in claimed.ids {
        dispatch_record(
            conn, scripts, stream, group, &record, subs, round_robin, dispatch_mode, config, clock,
        )
        .await;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_record(
    conn: &mut ConnectionWrapper,
    scripts: &ScriptRunner,
    stream: &str,
    group: &str,
    record: &StreamId,
    subs: &mut [Subscription],
    round_robin: &mut usize,
    dispatch_mode: DispatchMode,
    config: &RotifFinalisedConfig,
    clock: &Arc<dyn Clock>,
) {
    let Some(message) = Message::from_stream_id(record, "") else {
        warn!("dropping malformed record {} on {stream}, acking", record.id);
        let _ = scripts.ack_message(conn, stream, group, &record.id, true).await;
        return;
    };

    let matching: Vec<usize> = subs
        .iter()
        .enumerate()
        .filter(|(_, s)| pattern_matches(&s.pattern, &message.channel))
        .map(|(i, _)| i)
        .collect();

    if matching.is_empty() {
        debug!("no local subscription for {} on {stream}, acking", message.channel);
        let _ = scripts.ack_message(conn, stream, group, &message.id, false).await;
        return;
    }

    let active: Vec<usize> = matching
        .iter()
        .copied()
        .filter(|i| !subs[*i].paused.load(Ordering::SeqCst))
        .collect();

    if active.is_empty() {
        debug!("all matching subscriptions paused for {} on {stream}, acking", message.channel);
        let _ = scripts.ack_message(conn, stream, group, &message.id, false).await;
        return;
    }

    let targets: Vec<usize> = match dispatch_mode {
        DispatchMode::FanOut => active,
        DispatchMode::LocalRoundRobin => {
            let idx = active[*round_robin % active.len()];
            *round_robin = round_robin.wrapping_add(1);
            vec![idx]
        }
    };

    for idx in targets {
        process_for_subscription(conn, scripts, stream, group, &message, record, &mut subs[idx], config, clock)
            .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_for_subscription(
    conn: &mut ConnectionWrapper,
    scripts: &ScriptRunner,
    stream: &str,
    group: &str,
    message: &Message,
    record: &StreamId,
    sub: &mut Subscription,
    config: &RotifFinalisedConfig,
    clock: &Arc<dyn Clock>,
) {
    sub.in_flight.fetch_add(1, Ordering::SeqCst);

    if sub.exactly_once {
        let ttl_ms = sub.dedup_ttl_secs.unwrap_or(config.deduplication_ttl_secs) * 1000;
        match dedup::try_acquire_consume_key(conn, group, &message.channel, &message.payload, ttl_ms).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("duplicate delivery for {} on group {group}, acking silently", message.channel);
                let _ = scripts.ack_message(conn, stream, group, &message.id, false).await;
                sub.in_flight.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                error!("dedup key acquisition failed for {}: {e}", message.channel);
            }
        }
    }

    let handler_result = sub.handler.handle(message).await;

    match handler_result {
        Ok(()) => {
            if let Err(e) = scripts.ack_message(conn, stream, group, &message.id, false).await {
                error!("failed to ack {} on {stream}: {e}", message.id);
            }
            sub.stats.record_message(clock.now_ms());
        }
        Err(e) => {
            let error_message = e.to_string();
            error!("handler failed for {}: {error_message}", message.channel);
            if sub.exactly_once {
                if let Err(e) = dedup::release_consume_key(conn, group, &message.channel, &message.payload).await
                {
                    error!("failed to release dedup key for retry: {e}");
                }
            }

            let max_retries = sub.max_retries.unwrap_or(config.max_retries);
            if message.attempt > max_retries {
                sub.stats.record_failure();
                let dlq_args = MoveToDlqArgs {
                    stream,
                    dlq_stream: DLQ_STREAM_KEY,
                    group,
                    id: &message.id,
                    channel: &message.channel,
                    payload: &message.payload,
                    error: &error_message,
                    timestamp_ms: clock.now_ms(),
                    attempt: message.attempt,
                };
                if let Err(e) = scripts.move_to_dlq(conn, dlq_args).await {
                    error!("failed to move {} to DLQ: {e}", message.id);
                }
            } else {
                sub.stats.record_retry();
                // Precedence per spec.md §4.6: subscription retryStrategy, process
                // retryStrategy, subscription retryDelay (function then number),
                // process retryDelay (function then number), default fixed 1000ms.
                let strategy = sub
                    .retry_strategy
                    .clone()
                    .or_else(|| config.retry_strategy.clone())
                    .or_else(|| sub.retry_delay_fn.clone().map(RetryStrategy::Custom))
                    .or_else(|| sub.retry_delay_ms.map(RetryStrategy::Fixed))
                    .or_else(|| config.retry_delay_fn.clone().map(RetryStrategy::Custom))
                    .unwrap_or_else(|| RetryStrategy::Fixed(config.retry_delay_ms));
                let delay_ms = strategy.delay_ms(message.attempt, message);
                let due_at_ms = clock.now_ms() + delay_ms;
                let next_attempt = message.attempt + 1;
                let retry_args = RetryMessageArgs {
                    retry_stream: stream,
                    scheduled_set: crate::keys::SCHEDULED_SET_KEY,
                    group,
                    id: &message.id,
                    channel: &message.channel,
                    payload: &message.payload,
                    timestamp_ms: message.timestamp,
                    next_attempt,
                    due_at_ms,
                    nonce: &record.id,
                    exactly_once: message.exactly_once,
                    dedup_ttl_ms: message.dedup_ttl_secs * 1000,
                    main_stream: stream,
                    pattern: &message.pattern,
                };
                if let Err(e) = scripts.retry_message(conn, retry_args).await {
                    error!("failed to schedule retry for {}: {e}", message.id);
                }
            }
        }
    }

    sub.in_flight.fetch_sub(1, Ordering::SeqCst);
}

/// Invokes `publish-message` for a normal (non-delayed) delivery, used by
/// the DLQ requeue path and the publish pipeline alike.
pub async fn publish_now(
    conn: &mut ConnectionWrapper,
    scripts: &ScriptRunner,
    args: PublishMessageArgs<'_>,
) -> redis::RedisResult<crate::scripts::PublishScriptResult> {
    debug_assert_eq!(args.delivery_type, DeliveryType::Normal);
    scripts.publish_message(conn, args).await
}

pub type LoopRegistry = HashMap<(String, String), LoopHandle>;
