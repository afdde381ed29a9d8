//! End-to-end scenarios from spec.md §8, run against a live Redis at
//! `127.0.0.1:6379`. Style mirrors the teacher's own
//! `consumers/consumer-redis/tests/integration_test.rs`: `test-log` +
//! `tokio::test`, an mpsc channel collecting handler invocations, and a
//! small per-test pattern suffix so streams from different tests never
//! collide on the same Redis instance.
//!
//! These require a reachable Redis and are `#[ignore]`d by default; run
//! with `cargo test --test integration_test -- --ignored`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rotif::{
    Broker, ConnectionConfig, HandlerError, Message, PublishOptions, RotifConfig, SubscribeOptions,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn test_suffix() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

async fn test_broker() -> Arc<Broker> {
    let config = RotifConfig {
        redis: ConnectionConfig::default(),
        block_interval_ms: Some(200),
        check_delay_interval_ms: Some(100),
        pending_check_interval_ms: Some(60_000),
        ..Default::default()
    };
    Broker::new(config).await.expect("broker should connect to Redis")
}

async fn recv_within(rx: &mut mpsc::Receiver<Message>, millis: u64) -> Option<Message> {
    timeout(Duration::from_millis(millis), rx.recv()).await.ok().flatten()
}

#[test_log::test(tokio::test)]
#[ignore]
async fn test_scenario_1_fan_out_to_two_groups() {
    let broker = test_broker().await;
    let suffix = test_suffix();
    let exact_pattern = format!("orders.created.{suffix}");
    let glob_pattern = format!("orders.*.{suffix}");

    let (tx1, mut rx1) = mpsc::channel(4);
    let (tx2, mut rx2) = mpsc::channel(4);

    broker
        .subscribe(
            &exact_pattern,
            Arc::new(move |m: Message| {
                let tx1 = tx1.clone();
                async move {
                    let _ = tx1.send(m).await;
                    Ok(())
                }
            }),
            SubscribeOptions {
                group: Some("g1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    broker
        .subscribe(
            &glob_pattern,
            Arc::new(move |m: Message| {
                let tx2 = tx2.clone();
                async move {
                    let _ = tx2.send(m).await;
                    Ok(())
                }
            }),
            SubscribeOptions {
                group: Some("g2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Let both subscriptions register in the pattern registry before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let channel = format!("orders.created.{suffix}");
    let outcome = broker
        .publish(&channel, "{\"id\":1}", PublishOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, rotif::PublishOutcome::Ids(_)));

    let m1 = recv_within(&mut rx1, 5000).await.expect("group g1 should receive the message");
    let m2 = recv_within(&mut rx2, 5000).await.expect("group g2 should receive the message");
    assert_eq!(m1.channel, channel);
    assert_eq!(m2.channel, channel);

    let stats = broker.dlq_stats().await.unwrap();
    assert_eq!(stats.length, 0);

    broker.stop_all().await;
}

#[test_log::test(tokio::test)]
#[ignore]
async fn test_scenario_2_retry_to_success() {
    let broker = test_broker().await;
    let pattern = format!("retry.success.{}", test_suffix());

    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::channel(4);

    let handle = broker
        .subscribe(
            &pattern,
            Arc::new({
                let attempts = attempts.clone();
                move |m: Message| {
                    let attempts = attempts.clone();
                    let tx = tx.clone();
                    async move {
                        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        if attempt == 1 {
                            return Err::<(), HandlerError>("transient failure".into());
                        }
                        let _ = tx.send(m).await;
                        Ok(())
                    }
                }
            }),
            SubscribeOptions {
                max_retries: Some(2),
                retry_delay_ms: Some(300),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    broker
        .publish(&pattern, "{\"id\":1}", PublishOptions::default())
        .await
        .unwrap();

    let message = recv_within(&mut rx, 5000).await.expect("handler should eventually succeed");
    assert_eq!(message.attempt, 2);

    let stats = handle.stats();
    assert_eq!(stats.messages, 1);
    assert_eq!(stats.retries, 1);

    let dlq = broker.dlq_stats().await.unwrap();
    assert_eq!(dlq.length, 0);

    broker.stop_all().await;
}

#[test_log::test(tokio::test)]
#[ignore]
async fn test_scenario_3_poison_message_to_dlq() {
    let broker = test_broker().await;
    let pattern = format!("poison.{}", test_suffix());

    let handle = broker
        .subscribe(
            &pattern,
            Arc::new(|_m: Message| async move { Err::<(), HandlerError>("always fails".into()) }),
            SubscribeOptions {
                max_retries: Some(1),
                retry_delay_ms: Some(50),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    broker
        .publish(&pattern, "{\"poison\":true}", PublishOptions::default())
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut found = None;
    while tokio::time::Instant::now() < deadline {
        let messages = broker.dlq_messages(50).await.unwrap();
        if let Some(entry) = messages.into_iter().find(|e| e.channel == pattern) {
            found = Some(entry);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let entry = found.expect("poison message should land in the DLQ");
    assert_eq!(entry.payload, "{\"poison\":true}");
    assert_eq!(handle.stats().failures, 1);

    broker.stop_all().await;
}

#[test_log::test(tokio::test)]
#[ignore]
async fn test_scenario_4_exactly_once_dedup() {
    let broker = test_broker().await;
    let pattern = format!("dedup.{}", test_suffix());

    let (tx, mut rx) = mpsc::channel(4);
    broker
        .subscribe(
            &pattern,
            Arc::new(move |m: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m).await;
                    Ok(())
                }
            }),
            SubscribeOptions {
                exactly_once: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let options = PublishOptions {
        exactly_once: true,
        ..Default::default()
    };
    let first = broker.publish(&pattern, "{\"n\":7}", options.clone()).await.unwrap();
    let second = broker.publish(&pattern, "{\"n\":7}", options).await.unwrap();

    assert!(matches!(first, rotif::PublishOutcome::Ids(_)));
    assert_eq!(second, rotif::PublishOutcome::Duplicate);

    let delivered = recv_within(&mut rx, 3000).await.expect("the single publish should be delivered");
    assert_eq!(delivered.channel, pattern);
    assert!(recv_within(&mut rx, 500).await.is_none(), "no second delivery should occur");

    broker.stop_all().await;
}

#[test_log::test(tokio::test)]
#[ignore]
async fn test_scenario_5_delayed_delivery() {
    let broker = test_broker().await;
    let pattern = format!("delayed.{}", test_suffix());

    let (tx, mut rx) = mpsc::channel(4);
    broker
        .subscribe(
            &pattern,
            Arc::new(move |m: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m).await;
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let options = PublishOptions {
        delay_ms: Some(500),
        ..Default::default()
    };
    broker.publish(&pattern, "{\"id\":1}", options).await.unwrap();

    assert!(
        recv_within(&mut rx, 300).await.is_none(),
        "delayed message must not arrive before its due time"
    );
    let delivered = recv_within(&mut rx, 3000).await.expect("delayed message should eventually arrive");
    assert_eq!(delivered.channel, pattern);

    broker.stop_all().await;
}

#[test_log::test(tokio::test)]
#[ignore]
async fn test_scenario_6_dynamic_pattern_discovery() {
    let broker = test_broker().await;
    let pattern = format!("metrics.*.{}", test_suffix());
    let channel = format!("metrics.cpu.{}", test_suffix());

    let before = broker
        .publish(&channel, "{\"cpu\":0.5}", PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(before, rotif::PublishOutcome::NoMatch);

    let (tx, mut rx) = mpsc::channel(4);
    broker
        .subscribe(
            &pattern,
            Arc::new(move |m: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m).await;
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = broker
        .publish(&channel, "{\"cpu\":0.5}", PublishOptions::default())
        .await
        .unwrap();
    assert!(matches!(after, rotif::PublishOutcome::Ids(_)));

    let delivered = recv_within(&mut rx, 3000).await.expect("subscribed pattern should receive the message");
    assert_eq!(delivered.channel, channel);

    broker.stop_all().await;
}
