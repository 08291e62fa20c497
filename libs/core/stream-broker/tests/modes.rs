mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{CountingHandler, Harness, fast_config, shared, stream_len};
use std::sync::atomic::Ordering;
use std::time::Duration;
use stream_broker::{
    Broker, BrokerError, DeliveryBroker, LogType, Message, Mode, PromoteOutcome, Status,
    Supervisor,
};
use test_utils::assertions::eventually;

#[tokio::test]
async fn test_normal_stream_is_capped_at_max_len() {
    let harness = Harness::with_config("test_normal_stream_is_capped_at_max_len", |prefix| {
        fast_config(prefix).with_max_len(5)
    })
    .await;
    let broker = Broker::new(harness.ctx.clone());

    for n in 0..12 {
        broker
            .enqueue(harness.message(&n.to_string()))
            .await
            .unwrap();
    }

    let key = harness
        .ctx
        .keys()
        .stream(Mode::Normal, &harness.channel, &harness.topic);
    assert_eq!(stream_len(&harness, &key).await, 5);
}

#[tokio::test]
async fn test_per_message_max_len_overrides_config() {
    let harness = Harness::new("test_per_message_max_len_overrides_config").await;
    let broker = Broker::new(harness.ctx.clone());

    for n in 0..4 {
        broker
            .enqueue(harness.message(&n.to_string()).with_max_len(2))
            .await
            .unwrap();
    }

    let key = harness
        .ctx
        .keys()
        .stream(Mode::Normal, &harness.channel, &harness.topic);
    assert_eq!(stream_len(&harness, &key).await, 2);
}

#[tokio::test]
async fn test_sequential_rejects_duplicate_ids() {
    let harness = Harness::new("test_sequential_rejects_duplicate_ids").await;
    let broker = Broker::new(harness.ctx.clone());
    let sequential = broker.sequential();

    let message = harness.message("{}").with_id("order-1");
    sequential.enqueue(message.clone()).await.unwrap();

    let err = sequential.enqueue(message).await.unwrap_err();
    assert!(matches!(err, BrokerError::IdempotentDuplicate { ref id } if id == "order-1"));

    let key = harness
        .ctx
        .keys()
        .stream(Mode::Sequential, &harness.channel, &harness.topic);
    assert_eq!(stream_len(&harness, &key).await, 1);

    let status = broker
        .status_reader()
        .status(&harness.channel, &harness.topic, "order-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, Status::Published);
    assert_eq!(status.duplicates, 1);
}

#[tokio::test]
async fn test_sequential_status_reaches_success() {
    let harness = Harness::new("test_sequential_status_reaches_success").await;
    let broker = Broker::new(harness.ctx.clone());
    let handler = shared(CountingHandler::default());

    let mut supervisor = Supervisor::new();
    supervisor.register(
        broker.sequential().as_ref(),
        &harness.channel,
        &harness.topic,
        handler.clone(),
    );

    broker
        .sequential()
        .enqueue(harness.message("{}").with_id("order-2"))
        .await
        .unwrap();

    let status = broker
        .status_reader()
        .wait_for_terminal(
            &harness.channel,
            &harness.topic,
            "order-2",
            Duration::from_secs(10),
            Duration::from_millis(50),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.status, Status::Success);
    assert_eq!(status.retry, Some(0));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    // Still deduplicated after settling
    let err = broker
        .sequential()
        .enqueue(harness.message("{}").with_id("order-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::IdempotentDuplicate { .. }));

    supervisor.shutdown();
    supervisor.join().await.unwrap();
}

#[tokio::test]
async fn test_sequential_lock_blocks_same_order_key() {
    let harness = Harness::new("test_sequential_lock_blocks_same_order_key").await;
    let broker = Broker::new(harness.ctx.clone());
    let locked = broker.sequential_lock();

    let first = harness.message("1").with_order_key("customer-9");
    locked.enqueue(first.clone()).await.unwrap();

    let err = locked
        .enqueue(harness.message("2").with_order_key("customer-9"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::SequentialLockBusy { ref order_key } if order_key == "customer-9"
    ));

    // Other order keys are independent
    locked
        .enqueue(harness.message("3").with_order_key("customer-10"))
        .await
        .unwrap();

    let info = locked
        .lock_info(&harness.channel, &harness.topic, "customer-9")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.message_id, first.id);
    assert!(info.ttl.is_some());

    assert!(locked
        .force_unlock(&harness.channel, &harness.topic, "customer-9")
        .await
        .unwrap());
    assert!(!locked
        .force_unlock(&harness.channel, &harness.topic, "customer-9")
        .await
        .unwrap());

    locked
        .enqueue(harness.message("4").with_order_key("customer-9"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sequential_lock_requires_order_key() {
    let harness = Harness::new("test_sequential_lock_requires_order_key").await;
    let broker = Broker::new(harness.ctx.clone());

    let err = broker
        .sequential_lock()
        .enqueue(harness.message("1"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidMessage(_)));
}

#[tokio::test]
async fn test_sequential_lock_released_after_ack() {
    let harness = Harness::new("test_sequential_lock_released_after_ack").await;
    let broker = Broker::new(harness.ctx.clone());
    let locked = broker.sequential_lock();

    let mut supervisor = Supervisor::new();
    supervisor.register(
        locked.as_ref(),
        &harness.channel,
        &harness.topic,
        shared(CountingHandler::default()),
    );

    locked
        .enqueue(harness.message("1").with_order_key("k"))
        .await
        .unwrap();

    eventually(Duration::from_secs(10), "lock released", || {
        let locked = locked.clone();
        let (channel, topic) = (harness.channel.clone(), harness.topic.clone());
        async move {
            locked
                .lock_info(&channel, &topic, "k")
                .await
                .unwrap()
                .is_none()
        }
    })
    .await;

    locked
        .enqueue(harness.message("2").with_order_key("k"))
        .await
        .unwrap();

    supervisor.shutdown();
    supervisor.join().await.unwrap();
}

#[tokio::test]
async fn test_scheduled_message_waits_until_due() {
    let harness = Harness::new("test_scheduled_message_waits_until_due").await;
    let broker = Broker::new(harness.ctx.clone());
    let scheduled = broker.scheduled();
    let scheduler = scheduled.scheduler(&harness.channel, &harness.topic);
    let stream = harness
        .ctx
        .keys()
        .stream(Mode::Scheduled, &harness.channel, &harness.topic);

    scheduled
        .enqueue(harness.message("later").with_delay(Duration::from_millis(500)))
        .await
        .unwrap();

    let outcome = scheduler.tick().await.unwrap();
    assert_eq!(
        outcome,
        PromoteOutcome::Promoted {
            promoted: 0,
            dropped: 0
        }
    );
    assert_eq!(stream_len(&harness, &stream).await, 0);
    assert_eq!(
        scheduled
            .waiting(&harness.channel, &harness.topic)
            .await
            .unwrap(),
        1
    );

    tokio::time::sleep(Duration::from_millis(600)).await;

    let outcome = scheduler.tick().await.unwrap();
    assert_eq!(
        outcome,
        PromoteOutcome::Promoted {
            promoted: 1,
            dropped: 0
        }
    );
    assert_eq!(stream_len(&harness, &stream).await, 1);
    assert_eq!(
        scheduled
            .waiting(&harness.channel, &harness.topic)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_scheduled_promotes_earliest_first() {
    let harness = Harness::new("test_scheduled_promotes_earliest_first").await;
    let broker = Broker::new(harness.ctx.clone());
    let scheduled = broker.scheduled();
    let now = Utc::now();

    for (id, offset_ms) in [("late", 1_000), ("early", 3_000), ("middle", 2_000)] {
        scheduled
            .enqueue(
                harness
                    .message(id)
                    .with_id(id)
                    .with_execute_time(now - ChronoDuration::milliseconds(offset_ms)),
            )
            .await
            .unwrap();
    }

    scheduled
        .scheduler(&harness.channel, &harness.topic)
        .tick()
        .await
        .unwrap();

    let stream = harness
        .ctx
        .keys()
        .stream(Mode::Scheduled, &harness.channel, &harness.topic);
    let mut conn = harness.redis.connection();
    let entries: Vec<(String, Vec<(String, String)>)> = redis::cmd("XRANGE")
        .arg(&stream)
        .arg("-")
        .arg("+")
        .query_async(&mut conn)
        .await
        .unwrap();

    let ids: Vec<String> = entries
        .iter()
        .map(|(entry_id, fields)| Message::from_fields(entry_id, fields).unwrap().id)
        .collect();
    assert_eq!(ids, vec!["early", "middle", "late"]);
}

#[tokio::test]
async fn test_scheduler_drops_undecodable_member() {
    let harness = Harness::new("test_scheduler_drops_undecodable_member").await;
    let scheduled = Broker::new(harness.ctx.clone()).scheduled();
    let zset = harness.ctx.keys().zset(&harness.channel, &harness.topic);

    let mut conn = harness.redis.connection();
    let _: i64 = redis::cmd("ZADD")
        .arg(&zset)
        .arg(Utc::now().timestamp_millis() - 1_000)
        .arg("{broken")
        .query_async(&mut conn)
        .await
        .unwrap();

    let outcome = scheduled
        .scheduler(&harness.channel, &harness.topic)
        .tick()
        .await
        .unwrap();
    assert_eq!(
        outcome,
        PromoteOutcome::Promoted {
            promoted: 0,
            dropped: 1
        }
    );
    assert_eq!(
        scheduled
            .waiting(&harness.channel, &harness.topic)
            .await
            .unwrap(),
        0
    );

    let records = harness.log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].log_type, LogType::DecodeError);
    assert_eq!(records[0].payload, "{broken");
}

#[tokio::test]
async fn test_normal_max_len_zero_keeps_published_message() {
    let harness = Harness::new("test_normal_max_len_zero_keeps_published_message").await;
    let broker = Broker::new(harness.ctx.clone());

    broker
        .enqueue(harness.message("{}").with_max_len(0))
        .await
        .unwrap();

    let stream = harness
        .ctx
        .keys()
        .stream(Mode::Normal, &harness.channel, &harness.topic);
    assert_eq!(stream_len(&harness, &stream).await, 1);
}

#[tokio::test]
async fn test_scheduler_lock_excludes_second_runner() {
    let harness = Harness::new("test_scheduler_lock_excludes_second_runner").await;
    let broker = Broker::new(harness.ctx.clone());
    let lock_key = harness.ctx.keys().schedule_lock(&harness.channel, &harness.topic);

    let mut conn = harness.ctx.conn();
    assert!(
        stream_broker::scripts::acquire_advisory_lock(
            &mut conn,
            &lock_key,
            "other-runner",
            Duration::from_secs(10),
        )
        .await
        .unwrap()
    );

    let outcome = broker
        .scheduled()
        .scheduler(&harness.channel, &harness.topic)
        .tick()
        .await
        .unwrap();
    assert_eq!(outcome, PromoteOutcome::LockBusy);
}
