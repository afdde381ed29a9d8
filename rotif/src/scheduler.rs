//! Delayed-message scheduler (spec.md §4.5): a single periodic task per
//! process promoting due entries from `rotif:scheduled` into their target
//! streams. The `tokio::select!`-over-interval-and-shutdown shape is lifted
//! from the teacher's `RedisMessageConsumer::start_stream_trimming_worker`.

use std::sync::Arc;
use std::time::Duration;

use rotif_helpers::redis::ConnectionWrapper;
use rotif_helpers::time::Clock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::keys::SCHEDULED_SET_KEY;
use crate::scripts::ScriptRunner;

/// Spawns the scheduler task. Returns a handle the broker can `.await` on
/// shutdown.
pub fn spawn(
    mut conn: ConnectionWrapper,
    scripts: Arc<ScriptRunner>,
    clock: Arc<dyn Clock>,
    interval_ms: u64,
    batch_size: isize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now_ms = clock.now_ms();
                    match scripts
                        .move_scheduled_messages(&mut conn, SCHEDULED_SET_KEY, now_ms, batch_size)
                        .await
                    {
                        Ok(promoted) if promoted > 0 => {
                            debug!("scheduler promoted {promoted} message(s) at {now_ms}");
                        }
                        Ok(_) => {}
                        Err(e) => error!("scheduler failed to promote due messages: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("scheduler shutting down");
                    break;
                }
            }
        }
    })
}
