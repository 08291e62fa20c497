mod common;

use common::{
    CountingHandler, FailingHandler, Harness, PanickingHandler, pending_count, shared, stream_len,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use stream_broker::{
    BatchReport, BrokerConfig, DeliveryBroker, DispatchEngine, LogType, Message, Mode,
    NormalBroker, PlainPolicy, Status,
};

fn engine(harness: &Harness, handler: Arc<dyn stream_broker::Handler>) -> DispatchEngine {
    DispatchEngine::new(
        harness.ctx.clone(),
        Arc::new(PlainPolicy(Mode::Normal)),
        &harness.channel,
        &harness.topic,
        handler,
    )
}

#[tokio::test]
async fn test_successful_batch_is_logged_and_removed() {
    let harness = Harness::new("test_successful_batch_is_logged_and_removed").await;
    let broker = NormalBroker::new(harness.ctx.clone());
    let handler = shared(CountingHandler::default());
    let engine = engine(&harness, handler.clone());
    engine.stream().ensure_group().await.unwrap();

    for n in 0..3 {
        broker
            .enqueue(harness.message(&format!("{{\"n\":{}}}", n)))
            .await
            .unwrap();
    }

    let report = engine.poll_batch().await.unwrap();

    assert_eq!(report.received, 3);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.acked, 3);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    let records = harness.log.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == Status::Success && r.retry == 0));
    assert!(records.iter().all(|r| r.log_type == LogType::Process));

    let stream = engine.stream().stream().to_string();
    assert_eq!(stream_len(&harness, &stream).await, 0);
    assert_eq!(pending_count(&harness, &stream, engine.stream().group()).await, 0);
}

#[tokio::test]
async fn test_retry_budget_is_reported_on_failure() {
    let harness = Harness::new("test_retry_budget_is_reported_on_failure").await;
    let broker = NormalBroker::new(harness.ctx.clone());
    let handler = shared(FailingHandler::default());
    let engine = engine(&harness, handler.clone());
    engine.stream().ensure_group().await.unwrap();

    broker
        .enqueue(harness.message("{}").with_retry(2))
        .await
        .unwrap();

    let report = engine.poll_batch().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(handler.error_hooks.load(Ordering::SeqCst), 1);

    let records = harness.log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].retry, 2);
    assert_eq!(records[0].status, Status::Failed);
    assert!(records[0].info.as_deref().unwrap().contains("downstream unavailable"));

    let stream = engine.stream().stream().to_string();
    assert_eq!(pending_count(&harness, &stream, engine.stream().group()).await, 0);
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let harness = Harness::new("test_handler_panic_is_contained").await;
    let broker = NormalBroker::new(harness.ctx.clone());
    let engine = engine(&harness, Arc::new(PanickingHandler));
    engine.stream().ensure_group().await.unwrap();

    broker
        .enqueue(harness.message("boom").with_retry(0))
        .await
        .unwrap();
    broker.enqueue(harness.message("fine")).await.unwrap();

    let report = engine.poll_batch().await.unwrap();
    assert_eq!(report.received, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.acked, 2);

    let failed = harness
        .log
        .records()
        .into_iter()
        .find(|r| r.status == Status::Failed)
        .unwrap();
    assert!(failed.info.unwrap().contains("boom"));

    // The engine keeps serving after a panic
    broker.enqueue(harness.message("after")).await.unwrap();
    let report = engine.poll_batch().await.unwrap();
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn test_failed_log_write_leaves_entry_pending() {
    let harness = Harness::new("test_failed_log_write_leaves_entry_pending").await;
    let broker = NormalBroker::new(harness.ctx.clone());
    let engine = engine(&harness, shared(CountingHandler::default()));
    engine.stream().ensure_group().await.unwrap();

    harness.log.set_failing(true);
    broker.enqueue(harness.message("{}")).await.unwrap();

    let report = engine.poll_batch().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.log_failures, 1);
    assert_eq!(report.acked, 0);

    let stream = engine.stream().stream().to_string();
    assert_eq!(stream_len(&harness, &stream).await, 1);
    assert_eq!(pending_count(&harness, &stream, engine.stream().group()).await, 1);
    assert!(engine.stream().is_received(&first_pending(&engine).await).await.unwrap());
}

#[tokio::test]
async fn test_undecodable_entry_is_logged_and_dropped() {
    let harness = Harness::new("test_undecodable_entry_is_logged_and_dropped").await;
    let engine = engine(&harness, shared(CountingHandler::default()));
    engine.stream().ensure_group().await.unwrap();

    engine.stream().add("{not json").await.unwrap();

    let report = engine.poll_batch().await.unwrap();
    assert_eq!(report.decode_errors, 1);
    assert_eq!(report.acked, 1);

    let records = harness.log.records();
    assert_eq!(records[0].log_type, LogType::DecodeError);
    assert_eq!(records[0].payload, "{not json");
}

#[tokio::test]
async fn test_idle_read_waits_out_default_block() {
    let harness = Harness::with_config("test_idle_read_waits_out_default_block", |prefix| {
        BrokerConfig::new(prefix)
    })
    .await;
    let engine = engine(&harness, shared(CountingHandler::default()));
    engine.stream().ensure_group().await.unwrap();

    let started = Instant::now();
    let report = engine.poll_batch().await.unwrap();

    assert_eq!(report, BatchReport::default());
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_blocking_read_does_not_stall_producers() {
    let harness = Harness::with_config("test_blocking_read_does_not_stall_producers", |prefix| {
        BrokerConfig::new(prefix)
    })
    .await;
    let broker = NormalBroker::new(harness.ctx.clone());
    let engine = engine(&harness, shared(CountingHandler::default()));
    engine.stream().ensure_group().await.unwrap();

    let produce = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        broker
            .enqueue(Message::new(harness.channel.as_str(), "elsewhere", "{}"))
            .await
            .unwrap();
        started.elapsed()
    };

    let (report, enqueue_took) = tokio::join!(engine.poll_batch(), produce);

    assert_eq!(report.unwrap(), BatchReport::default());
    assert!(
        enqueue_took < Duration::from_millis(500),
        "enqueue waited {:?} behind the blocking read",
        enqueue_took
    );
}

async fn first_pending(engine: &DispatchEngine) -> String {
    engine.stream().pending(10).await.unwrap().remove(0).id
}
