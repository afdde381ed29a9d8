//! Top-level orchestrator: wires together the script runner, pattern
//! registry, subscription manager, scheduler and DLQ manager into the
//! public `Broker` surface, and owns graceful shutdown (spec.md §4.12).
//! Mirrors how the teacher's `RedisMessageConsumer` owns and tears down its
//! worker tasks, generalized here to a handful of cooperating subsystems
//! instead of one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rotif_helpers::redis::get_redis_connection;
use rotif_helpers::time::{Clock, DefaultClock};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::{DlqCleanupConfig, RotifConfig, RotifFinalisedConfig};
use crate::dlq::{DlqManager, DlqStats};
use crate::errors::RotifResult;
use crate::handler::MessageHandler;
use crate::keys::SUBSCRIPTION_UPDATES_CHANNEL;
use crate::middleware::{Middleware, MiddlewareHandler, MiddlewarePipeline};
use crate::patterns::PatternRegistry;
use crate::publish::PublishPipeline;
use crate::scheduler;
use crate::scripts::ScriptRunner;
use crate::subscription::{SubscribeOptions, SubscriptionHandle, SubscriptionManager};
use crate::types::{DlqEntry, PublishOptions, PublishOutcome};

/// The entry point of the crate: a running Rotif broker bound to one Redis
/// deployment. Cheap to clone-share via `Arc`; every subsystem it wires
/// together is itself `Arc`-backed or cheaply cloneable.
pub struct Broker {
    config: Arc<RotifFinalisedConfig>,
    middleware: Arc<MiddlewarePipeline>,
    subscriptions: SubscriptionManager,
    publish_pipeline: PublishPipeline,
    dlq: Arc<DlqManager>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl Broker {
    pub async fn new(config: RotifConfig) -> RotifResult<Arc<Self>> {
        let finalised = Arc::new(RotifFinalisedConfig::from(&config));
        let clock: Arc<dyn Clock> = Arc::new(DefaultClock::new());
        let mut conn = get_redis_connection(&config.redis, None).await?;
        let scripts = Arc::new(ScriptRunner::new());

        let patterns = PatternRegistry::new();
        patterns
            .start(&config.redis, &mut conn, SUBSCRIPTION_UPDATES_CHANNEL)
            .await?;

        let middleware = Arc::new(MiddlewarePipeline::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let subscriptions = SubscriptionManager::new(
            conn.clone(),
            scripts.clone(),
            clock.clone(),
            finalised.clone(),
            patterns.clone(),
            SUBSCRIPTION_UPDATES_CHANNEL.to_string(),
            shutdown_tx.clone(),
        );

        let publish_pipeline = PublishPipeline::new(
            conn.clone(),
            scripts.clone(),
            patterns.clone(),
            middleware.clone(),
            clock.clone(),
            finalised.clone(),
        );

        let dlq = Arc::new(DlqManager::new(
            conn.clone(),
            scripts.clone(),
            clock.clone(),
            finalised.dlq_cleanup.clone(),
            shutdown_tx.clone(),
        ));

        let scheduler_handle = if finalised.disable_delayed {
            None
        } else {
            Some(scheduler::spawn(
                conn.clone(),
                scripts.clone(),
                clock.clone(),
                finalised.check_delay_interval_ms,
                finalised.scheduled_batch_size,
                shutdown_tx.subscribe(),
            ))
        };

        let broker = Arc::new(Self {
            config: finalised.clone(),
            middleware,
            subscriptions,
            publish_pipeline,
            dlq,
            scheduler_handle: Mutex::new(scheduler_handle),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        });

        if finalised.dlq_cleanup.enabled {
            broker.dlq.start_auto_cleanup().await;
        }

        Ok(broker)
    }

    pub async fn publish(
        &self,
        channel: &str,
        payload: &str,
        options: PublishOptions,
    ) -> RotifResult<PublishOutcome> {
        self.publish_pipeline.publish(channel, payload, options).await
    }

    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> RotifResult<SubscriptionHandle> {
        let wrapped = Arc::new(MiddlewareHandler {
            inner: handler,
            pipeline: self.middleware.clone(),
        });
        self.subscriptions.subscribe(pattern, wrapped, options).await
    }

    pub async fn use_middleware(&self, hook: Arc<dyn Middleware>) {
        self.middleware.register(hook).await;
    }

    pub fn config(&self) -> &RotifFinalisedConfig {
        &self.config
    }

    pub async fn dlq_stats(&self) -> RotifResult<DlqStats> {
        self.dlq.get_stats().await
    }

    pub async fn dlq_messages(&self, limit: usize) -> RotifResult<Vec<DlqEntry>> {
        self.dlq.get_messages(limit).await
    }

    pub async fn dlq_cleanup(&self) -> RotifResult<u64> {
        self.dlq.cleanup().await
    }

    pub async fn dlq_clear(&self) -> RotifResult<()> {
        self.dlq.clear().await
    }

    pub async fn update_dlq_config(&self, config: DlqCleanupConfig) {
        self.dlq.update_config(config).await;
    }

    pub async fn start_dlq_auto_cleanup(&self) {
        self.dlq.start_auto_cleanup().await;
    }

    pub async fn stop_dlq_auto_cleanup(&self) {
        self.dlq.stop_auto_cleanup().await;
    }

    pub async fn subscribe_to_dlq(&self, handler: Arc<dyn MessageHandler>) -> RotifResult<()> {
        self.dlq.subscribe_to_dlq(handler).await
    }

    pub async fn requeue_from_dlq(&self, count: usize) -> RotifResult<i64> {
        self.dlq.requeue_from_dlq(count).await
    }

    /// Stops every running task — consumer loops, the scheduler, DLQ
    /// delivery and auto-cleanup — in that order, each bounded by its own
    /// timeout. Idempotent: a second call is a no-op.
    pub async fn stop_all(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(());

        self.subscriptions.shutdown().await;
        self.dlq.stop_delivery().await;
        self.dlq.stop_auto_cleanup().await;

        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(3), handle).await.is_err() {
                warn!("scheduler task did not stop within the shutdown timeout");
            }
        }
    }
}
