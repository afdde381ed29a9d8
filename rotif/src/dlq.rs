//! Dead-letter queue manager (spec.md §4.8): periodic age/size-based
//! cleanup with optional archival, statistics, manual requeue, and a
//! dedicated delivery loop for `subscribe_to_dlq`. Batched pipeline
//! `RPUSH`+`EXPIRE` archival is grounded on the teacher's pipelined stream
//! maintenance in `message_consumer.rs::trim_stream` / `ConnectionWrapper::xtrim`,
//! extended here from trimming to archive-then-delete.

use std::sync::Arc;
use std::time::Duration;

use rotif_helpers::redis::{ConnectionWrapper, StreamTrimStrategy};
use rotif_helpers::time::Clock;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DlqCleanupConfig;
use crate::errors::RotifResult;
use crate::handler::MessageHandler;
use crate::keys::{dlq_archive_key, DLQ_STREAM_KEY};
use crate::scripts::ScriptRunner;
use crate::types::{DlqEntry, Message};

const DLQ_CONSUMER_GROUP: &str = "dlq-group";
const DLQ_CONSUMER_NAME: &str = "dlq-worker";
const ARCHIVE_TTL_SECS: i64 = 30 * 24 * 3600;

/// A point-in-time view of the dead-letter stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlqStats {
    pub length: usize,
    pub oldest_age_secs: Option<u64>,
}

pub struct DlqManager {
    conn: ConnectionWrapper,
    scripts: Arc<ScriptRunner>,
    clock: Arc<dyn Clock>,
    config: Arc<Mutex<DlqCleanupConfig>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    delivery_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DlqManager {
    pub fn new(
        conn: ConnectionWrapper,
        scripts: Arc<ScriptRunner>,
        clock: Arc<dyn Clock>,
        config: DlqCleanupConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            conn,
            scripts,
            clock,
            config: Arc::new(Mutex::new(config)),
            cleanup_task: Mutex::new(None),
            delivery_task: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub async fn get_stats(&self) -> RotifResult<DlqStats> {
        let mut conn = self.conn.clone();
        let length = conn.xlen(DLQ_STREAM_KEY).await?;
        let oldest = conn.xrange_count(DLQ_STREAM_KEY, 1).await?;
        let oldest_age_secs = oldest
            .ids
            .first()
            .and_then(DlqEntry::from_stream_id)
            .map(|entry| (self.clock.now_ms() / 1000).saturating_sub(entry.timestamp / 1000));
        Ok(DlqStats {
            length,
            oldest_age_secs,
        })
    }

    pub async fn get_messages(&self, limit: usize) -> RotifResult<Vec<DlqEntry>> {
        let mut conn = self.conn.clone();
        let reply = conn.xrange_count(DLQ_STREAM_KEY, limit).await?;
        Ok(reply.ids.iter().filter_map(DlqEntry::from_stream_id).collect())
    }

    pub async fn update_config(&self, config: DlqCleanupConfig) {
        *self.config.lock().await = config;
    }

    /// Runs one pass of the age/size cleanup algorithm from spec.md §4.8.
    pub async fn cleanup(&self) -> RotifResult<u64> {
        let config = self.config.lock().await.clone();
        let mut conn = self.conn.clone();
        let now_ms = self.clock.now_ms();
        let mut deleted = 0u64;

        loop {
            let batch = conn.xrange_count(DLQ_STREAM_KEY, config.batch_size).await?;
            if batch.ids.is_empty() {
                break;
            }

            let mut to_delete = Vec::new();
            for stream_id in &batch.ids {
                let Some(entry) = DlqEntry::from_stream_id(stream_id) else {
                    continue;
                };
                let age_ms = now_ms.saturating_sub(entry.timestamp);
                if age_ms > config.max_age_secs * 1000 {
                    to_delete.push((stream_id.id.clone(), entry));
                }
            }

            if to_delete.is_empty() {
                break;
            }

            if config.archive_before_delete {
                self.archive(&mut conn, &config, &to_delete).await?;
            }

            let ids: Vec<&str> = to_delete.iter().map(|(id, _)| id.as_str()).collect();
            deleted += conn.xdel(DLQ_STREAM_KEY, &ids).await? as u64;

            if to_delete.len() < config.batch_size {
                break;
            }
        }

        let length = conn.xlen(DLQ_STREAM_KEY).await?;
        if length as u64 > config.max_size {
            let overflow = length as u64 - config.max_size;
            let batch = conn.xrange_count(DLQ_STREAM_KEY, overflow as usize).await?;
            let entries: Vec<(String, DlqEntry)> = batch
                .ids
                .iter()
                .filter_map(|s| DlqEntry::from_stream_id(s).map(|e| (s.id.clone(), e)))
                .collect();
            if config.archive_before_delete {
                self.archive(&mut conn, &config, &entries).await?;
            }
            let ids: Vec<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
            if !ids.is_empty() {
                deleted += conn.xdel(DLQ_STREAM_KEY, &ids).await? as u64;
            }
        }

        if deleted > 0 {
            info!("DLQ cleanup removed {deleted} message(s)");
        }
        Ok(deleted)
    }

    async fn archive(
        &self,
        conn: &mut ConnectionWrapper,
        config: &DlqCleanupConfig,
        entries: &[(String, DlqEntry)],
    ) -> RotifResult<()> {
        let date = chrono::DateTime::from_timestamp_millis(self.clock.now_ms() as i64)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let archive_key = if config.archive_prefix == "rotif:dlq:archive" {
            dlq_archive_key(&date)
        } else {
            format!("{}:{date}", config.archive_prefix)
        };

        let records: Vec<String> = entries
            .iter()
            .filter_map(|(_, entry)| serde_json::to_string(entry).ok())
            .collect();
        if records.is_empty() {
            return Ok(());
        }

        conn.rpush(&archive_key, &records).await?;
        conn.expire(&archive_key, ARCHIVE_TTL_SECS).await?;
        Ok(())
    }

    /// Deletes every entry from the dead-letter stream.
    pub async fn clear(&self) -> RotifResult<()> {
        let mut conn = self.conn.clone();
        conn.xtrim(DLQ_STREAM_KEY, StreamTrimStrategy::MaxLen(0)).await?;
        Ok(())
    }

    /// Moves up to `count` dead-lettered messages back onto their original
    /// streams for reprocessing.
    pub async fn requeue_from_dlq(&self, count: usize) -> RotifResult<i64> {
        let mut conn = self.conn.clone();
        Ok(self.scripts.requeue_from_dlq(&mut conn, DLQ_STREAM_KEY, count).await?)
    }

    pub async fn start_auto_cleanup(self: &Arc<Self>) {
        let mut task_slot = self.cleanup_task.lock().await;
        if task_slot.is_some() {
            return;
        }
        let manager = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *task_slot = Some(tokio::spawn(async move {
            loop {
                let interval_secs = manager.config.lock().await.cleanup_interval_secs.max(1);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {
                        if !manager.config.lock().await.enabled {
                            continue;
                        }
                        if let Err(e) = manager.cleanup().await {
                            error!("DLQ auto-cleanup failed: {e}");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }));
    }

    pub async fn stop_auto_cleanup(&self) {
        if let Some(handle) = self.cleanup_task.lock().await.take() {
            handle.abort();
        }
    }

    /// Starts the dedicated DLQ-delivery loop: short-blocking reads against
    /// `rotif:dlq` under `dlq-group`/`dlq-worker`, acking on success and
    /// logging (never retrying or re-dead-lettering) on failure.
    pub async fn subscribe_to_dlq(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) -> RotifResult<()> {
        let mut task_slot = self.delivery_task.lock().await;
        if task_slot.is_some() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        conn.xgroup_create_mkstream(DLQ_STREAM_KEY, DLQ_CONSUMER_GROUP).await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *task_slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("DLQ delivery loop shutting down");
                        break;
                    }
                    read_result = conn.xreadgroup(DLQ_CONSUMER_GROUP, DLQ_CONSUMER_NAME, DLQ_STREAM_KEY, 100, 1000) => {
                        match read_result {
                            Ok(reply) => {
                                for key in reply.keys {
                                    for stream_id in key.ids {
                                        let Some(entry) = DlqEntry::from_stream_id(&stream_id) else {
                                            continue;
                                        };
                                        let message = Message {
                                            id: stream_id.id.clone(),
                                            channel: entry.channel.clone(),
                                            payload: entry.payload.clone(),
                                            timestamp: entry.timestamp,
                                            attempt: entry.attempt,
                                            pattern: entry.channel.clone(),
                                            exactly_once: false,
                                            dedup_ttl_secs: 0,
                                        };
                                        match handler.handle(&message).await {
                                            Ok(()) => {
                                                if let Err(e) = conn.xack(DLQ_STREAM_KEY, DLQ_CONSUMER_GROUP, &[&stream_id.id]).await {
                                                    error!("failed to ack DLQ delivery {}: {e}", stream_id.id);
                                                }
                                            }
                                            Err(e) => warn!("DLQ handler failed for {}: {e}", stream_id.id),
                                        }
                                    }
                                }
                            }
                            Err(e) => error!("DLQ delivery read failed: {e}"),
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    pub async fn stop_delivery(&self) {
        if let Some(handle) = self.delivery_task.lock().await.take() {
            handle.abort();
        }
    }
}
