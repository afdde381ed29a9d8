//! Middleware hooks, ordered and run in registration order. Per the
//! REDESIGN FLAGS in spec.md §9, this is modelled as a capability record — a
//! trait with no-op default implementations — rather than dispatch over a
//! set of optional closures stored per hook object.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::handler::{HandlerError, MessageHandler};
use crate::types::{Message, PublishOptions};

/// A single hook in the publish/process pipeline. Every method defaults to
/// a no-op so an implementation only needs to override the steps it cares
/// about.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before_publish(&self, _channel: &str, _payload: &str, _options: &PublishOptions) {}
    async fn after_publish(&self, _channel: &str, _payload: &str, _outcome: &str) {}
    async fn before_process(&self, _message: &Message) {}
    async fn after_process(&self, _message: &Message) {}
    async fn on_error(&self, _message: &Message, _error: &str) {}
}

/// Runs an ordered list of middleware hooks, catching and logging any panic
/// or error from an individual hook so it never blocks delivery beyond its
/// own step.
#[derive(Default)]
pub struct MiddlewarePipeline {
    hooks: RwLock<Vec<std::sync::Arc<dyn Middleware>>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Appends a hook to the end of the pipeline. Safe to call after the
    /// broker has started; subscriptions and in-flight publishes pick up
    /// the new hook on their next message.
    pub async fn register(&self, hook: std::sync::Arc<dyn Middleware>) {
        self.hooks.write().await.push(hook);
    }

    pub async fn before_publish(&self, channel: &str, payload: &str, options: &PublishOptions) {
        for hook in self.hooks.read().await.iter() {
            hook.before_publish(channel, payload, options).await;
        }
    }

    pub async fn after_publish(&self, channel: &str, payload: &str, outcome: &str) {
        for hook in self.hooks.read().await.iter() {
            hook.after_publish(channel, payload, outcome).await;
        }
    }

    pub async fn before_process(&self, message: &Message) {
        for hook in self.hooks.read().await.iter() {
            hook.before_process(message).await;
        }
    }

    pub async fn after_process(&self, message: &Message) {
        for hook in self.hooks.read().await.iter() {
            hook.after_process(message).await;
        }
    }

    pub async fn on_error(&self, message: &Message, error: &str) {
        let hooks = self.hooks.read().await;
        if hooks.is_empty() {
            warn!("unhandled processing error for message {}: {error}", message.id);
        }
        for hook in hooks.iter() {
            hook.on_error(message, error).await;
        }
    }
}

/// Wraps a subscriber's handler so `before_process`/`after_process`/
/// `on_error` run around every delivery, without the consumer loop itself
/// needing to know middleware exists.
pub struct MiddlewareHandler {
    pub inner: Arc<dyn MessageHandler>,
    pub pipeline: Arc<MiddlewarePipeline>,
}

#[async_trait]
impl MessageHandler for MiddlewareHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.pipeline.before_process(message).await;
        let result = self.inner.handle(message).await;
        match &result {
            Ok(()) => self.pipeline.after_process(message).await,
            Err(e) => self.pipeline.on_error(message, &e.to_string()).await,
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingHook {
        before_publish_calls: AtomicUsize,
        on_error_calls: AtomicUsize,
    }

    #[async_trait]
    impl Middleware for CountingHook {
        async fn before_publish(&self, _channel: &str, _payload: &str, _options: &PublishOptions) {
            self.before_publish_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_error(&self, _message: &Message, _error: &str) {
            self.on_error_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample_message() -> Message {
        Message {
            id: "1-0".to_string(),
            channel: "orders.created".to_string(),
            payload: "{}".to_string(),
            timestamp: 0,
            attempt: 1,
            pattern: "orders.*".to_string(),
            exactly_once: false,
            dedup_ttl_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_pipeline_runs_hooks_in_registration_order_and_counts_calls() {
        let hook = Arc::new(CountingHook {
            before_publish_calls: AtomicUsize::new(0),
            on_error_calls: AtomicUsize::new(0),
        });
        let pipeline = MiddlewarePipeline::new();
        pipeline.register(hook.clone()).await;

        pipeline
            .before_publish("orders.created", "{}", &PublishOptions::default())
            .await;
        pipeline.on_error(&sample_message(), "boom").await;

        assert_eq!(hook.before_publish_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hook.on_error_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pipeline_with_no_hooks_does_not_panic() {
        let pipeline = MiddlewarePipeline::new();
        pipeline
            .before_publish("orders.created", "{}", &PublishOptions::default())
            .await;
        pipeline.on_error(&sample_message(), "boom").await;
    }
}
