//! Subscription lifecycle (spec.md §4.10): create/attach shared consumer
//! loops, maintain the pattern-registry reference count, and drain
//! in-flight work on unsubscribe. The loop registry is the one piece of
//! shared mutable state multiple caller tasks can touch concurrently, so
//! unlike the loop-owned subscription sets it is guarded by a mutex,
//! exactly as the teacher guards `MessageLocks` behind `Arc<Mutex<_>>`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rotif_helpers::redis::ConnectionWrapper;
use rotif_helpers::time::Clock;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::{RetryDelayFn, RotifFinalisedConfig};
use crate::consumer_loop::{self, LoopCommand, LoopRegistry};
use crate::errors::RotifResult;
use crate::handler::MessageHandler;
use crate::keys::{retry_stream_key, stream_key, DEFAULT_CONSUMER_GROUP};
use crate::patterns::PatternRegistry;
use crate::retry::RetryStrategy;
use crate::scripts::ScriptRunner;
use crate::types::{Stats, StatsSnapshot};

/// Per-subscribe overrides of the process-level retry/dedup defaults.
#[derive(Default)]
pub struct SubscribeOptions {
    pub group: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_strategy: Option<RetryStrategy>,
    pub retry_delay_ms: Option<u64>,
    pub retry_delay_fn: Option<RetryDelayFn>,
    pub exactly_once: bool,
    pub deduplication_ttl_secs: Option<u64>,
}

/// Loop-local subscription state. Owned exclusively by the consumer loop
/// task it is attached to; `paused`/`in_flight`/`stats` are atomics shared
/// with the caller's `SubscriptionHandle` so pause/resume and stats reads
/// never need to reach into the loop task.
pub struct Subscription {
    pub id: String,
    pub pattern: String,
    pub handler: Arc<dyn MessageHandler>,
    pub paused: Arc<AtomicBool>,
    pub in_flight: Arc<AtomicU64>,
    pub stats: Arc<Stats>,
    pub exactly_once: bool,
    pub max_retries: Option<u32>,
    pub retry_strategy: Option<RetryStrategy>,
    pub retry_delay_ms: Option<u64>,
    pub retry_delay_fn: Option<RetryDelayFn>,
    pub dedup_ttl_secs: Option<u64>,
}

/// A handle returned from `subscribe`, letting the caller pause, resume,
/// inspect stats, or unsubscribe.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub(crate) id: String,
    pub(crate) pattern: String,
    pub(crate) group: String,
    pub(crate) paused: Arc<AtomicBool>,
    pub(crate) in_flight: Arc<AtomicU64>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) manager: SubscriptionManager,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn unsubscribe(&self, remove_pattern: bool) -> RotifResult<()> {
        self.manager.unsubscribe(self, remove_pattern).await
    }
}

/// Owns the registry of shared consumer loops and coordinates
/// subscribe/unsubscribe against it and the pattern registry.
#[derive(Clone)]
pub struct SubscriptionManager {
    loops: Arc<Mutex<LoopRegistry>>,
    conn: ConnectionWrapper,
    scripts: Arc<ScriptRunner>,
    clock: Arc<dyn Clock>,
    config: Arc<RotifFinalisedConfig>,
    patterns: PatternRegistry,
    update_channel: String,
    shutdown_tx: broadcast::Sender<()>,
}

impl SubscriptionManager {
    pub fn new(
        conn: ConnectionWrapper,
        scripts: Arc<ScriptRunner>,
        clock: Arc<dyn Clock>,
        config: Arc<RotifFinalisedConfig>,
        patterns: PatternRegistry,
        update_channel: String,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            loops: Arc::new(Mutex::new(LoopRegistry::new())),
            conn,
            scripts,
            clock,
            config,
            patterns,
            update_channel,
            shutdown_tx,
        }
    }

    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> RotifResult<SubscriptionHandle> {
        let group = options
            .group
            .clone()
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let stream = stream_key(pattern);
        let retry_stream = retry_stream_key(pattern);

        let mut conn = self.conn.clone();
        conn.xgroup_create_mkstream(&stream, &group).await?;
        conn.xgroup_create_mkstream(&retry_stream, &group).await?;

        let id = format!(
            "sub-{}-{:08x}",
            self.clock.now_ms(),
            rand::thread_rng().gen::<u32>()
        );
        let paused = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicU64::new(0));
        let stats = Arc::new(Stats::default());

        let build_subscription = || Subscription {
            id: id.clone(),
            pattern: pattern.to_string(),
            handler: handler.clone(),
            paused: paused.clone(),
            in_flight: in_flight.clone(),
            stats: stats.clone(),
            exactly_once: options.exactly_once,
            max_retries: options.max_retries,
            retry_strategy: options.retry_strategy.clone(),
            retry_delay_ms: options.retry_delay_ms,
            retry_delay_fn: options.retry_delay_fn.clone(),
            dedup_ttl_secs: options.deduplication_ttl_secs,
        };

        self.attach_to_loop(&stream, &group, &conn, build_subscription()).await;
        self.attach_to_loop(&retry_stream, &group, &conn, build_subscription()).await;

        self.patterns
            .subscribe_pattern(&mut conn, &self.update_channel, pattern)
            .await?;

        Ok(SubscriptionHandle {
            id,
            pattern: pattern.to_string(),
            group,
            paused,
            in_flight,
            stats,
            manager: self.clone(),
        })
    }

    /// Adds `subscription` to the shared loop for `(stream, group)`,
    /// spawning it if none exists yet (or the previous one has since
    /// stopped). Used for both the main stream and its retry stream, per
    /// spec.md §4.10.
    async fn attach_to_loop(
        &self,
        stream: &str,
        group: &str,
        conn: &ConnectionWrapper,
        subscription: Subscription,
    ) {
        let key = (stream.to_string(), group.to_string());
        let mut loops = self.loops.lock().await;
        let leftover = match loops.get(&key) {
            Some(existing) => match existing.command_tx.send(LoopCommand::Add(subscription)) {
                Ok(()) => None,
                Err(mpsc_err) => Some(match mpsc_err.0 {
                    LoopCommand::Add(sub) => sub,
                    LoopCommand::Remove { .. } => unreachable!("only Add is ever sent here"),
                }),
            },
            None => Some(subscription),
        };

        if let Some(subscription) = leftover {
            if loops.contains_key(&key) {
                warn!("consumer loop for {stream}/{group} was gone, respawning");
                loops.remove(&key);
            }
            debug!("spawning consumer loop for {stream}/{group}");
            let handle = consumer_loop::spawn(
                stream.to_string(),
                group.to_string(),
                self.config.dispatch_mode(),
                conn.clone(),
                self.scripts.clone(),
                self.clock.clone(),
                self.config.clone(),
                subscription,
                self.shutdown_tx.subscribe(),
            );
            loops.insert(key, handle);
        }
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle, remove_pattern: bool) -> RotifResult<()> {
        handle.paused.store(true, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handle.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let stream = stream_key(&handle.pattern);
        let retry_stream = retry_stream_key(&handle.pattern);
        for stream in [stream, retry_stream] {
            self.detach_from_loop(&stream, &handle.group, &handle.id).await;
        }

        if remove_pattern {
            let mut conn = self.conn.clone();
            self.patterns
                .unsubscribe_pattern(&mut conn, &self.scripts, &self.update_channel, &handle.pattern)
                .await?;
        }

        Ok(())
    }

    async fn detach_from_loop(&self, stream: &str, group: &str, subscription_id: &str) {
        let key = (stream.to_string(), group.to_string());
        let mut loops = self.loops.lock().await;
        if let Some(loop_handle) = loops.get(&key) {
            let (done_tx, done_rx) = oneshot::channel();
            let _ = loop_handle.command_tx.send(LoopCommand::Remove {
                subscription_id: subscription_id.to_string(),
                done: done_tx,
            });
            let _ = done_rx.await;
            if loop_handle.join_handle.is_finished() {
                loops.remove(&key);
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut loops = self.loops.lock().await;
        for ((stream, group), handle) in loops.iter_mut() {
            debug!("waiting on consumer loop for {stream}/{group} to stop");
            if tokio::time::timeout(Duration::from_secs(3), &mut handle.join_handle)
                .await
                .is_err()
            {
                warn!("consumer loop for {stream}/{group} did not stop within the shutdown timeout");
            }
        }
        loops.clear();
    }
}
