use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use herd_store::Store;
use herd_sync::{
    ApiTransport, ConnState, ConnectivityMonitor, Method, SyncConfig, SyncEngine, SyncError,
    SyncEvent,
};
use herd_test_utils::{harness, DropConnectivityTransport};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("herd_sync=debug,herd_store=debug")
        .try_init();
}

/// Enqueue with a short pause so each operation gets a distinct
/// `enqueued_at` millisecond.
async fn enqueue_spaced(engine: &SyncEngine, method: Method, endpoint: &str) {
    engine.submit(method, endpoint, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(3)).await;
}

async fn wait_for_pass(events: &mut UnboundedReceiver<SyncEvent>) -> herd_sync::DrainSummary {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for sync events")
            .expect("event channel closed");
        if let SyncEvent::PassCompleted { summary } = event {
            return summary;
        }
    }
}

#[tokio::test]
async fn replays_in_enqueue_order() {
    init_logging();
    let h = harness(ConnState::Online).await;

    enqueue_spaced(&h.engine, Method::Post, "/sessions").await;
    enqueue_spaced(&h.engine, Method::Put, "/buyers/1").await;
    enqueue_spaced(&h.engine, Method::Delete, "/sales/2").await;

    let summary = h.engine.force_sync().await.unwrap();
    assert_eq!(summary.succeeded, 3);

    let endpoints: Vec<String> = h
        .transport
        .calls()
        .into_iter()
        .map(|c| c.endpoint)
        .collect();
    assert_eq!(endpoints, vec!["/sessions", "/buyers/1", "/sales/2"]);
}

#[tokio::test]
async fn transient_failure_delivers_at_least_once() {
    let h = harness(ConnState::Online).await;

    // Fails the first two attempts, succeeds on the third; the default
    // retry ceiling (3) is never reached.
    h.transport.fail_times("/sessions", 2);
    h.engine
        .submit(Method::Post, "/sessions", Some(json!({"milk": 5})))
        .await
        .unwrap();

    let first = h.engine.force_sync().await.unwrap();
    assert_eq!((first.succeeded, first.retried, first.dropped), (0, 1, 0));

    let second = h.engine.force_sync().await.unwrap();
    assert_eq!((second.succeeded, second.retried, second.dropped), (0, 1, 0));

    let third = h.engine.force_sync().await.unwrap();
    assert_eq!((third.succeeded, third.retried, third.dropped), (1, 0, 0));

    // Observed exactly K+1 = 3 times, then confirmed and removed.
    assert_eq!(h.transport.calls_to("/sessions").len(), 3);
    assert_eq!(h.engine.queue().len().await.unwrap(), 0);
}

#[tokio::test]
async fn retries_are_bounded() {
    let h = harness(ConnState::Online).await;
    h.transport.fail_always("/sessions");

    h.engine
        .submit(Method::Post, "/sessions", None)
        .await
        .unwrap();

    let mut events = h.engine.events().unwrap();

    h.engine.force_sync().await.unwrap();
    h.engine.force_sync().await.unwrap();
    let third = h.engine.force_sync().await.unwrap();
    assert_eq!(third.dropped, 1);

    // Exactly max_retries attempts, never a fourth.
    assert_eq!(h.transport.calls_to("/sessions").len(), 3);
    assert_eq!(h.engine.queue().len().await.unwrap(), 0);

    let fourth = h.engine.force_sync().await.unwrap();
    assert_eq!(fourth, herd_sync::DrainSummary::default());
    assert_eq!(h.transport.calls_to("/sessions").len(), 3);

    // The drop was reported, with the final retry count on the record.
    let mut exhausted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::RetryExhausted { operation } = event {
            exhausted.push(operation);
        }
    }
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].endpoint, "/sessions");
    assert_eq!(exhausted[0].retry_count, 3);
}

#[tokio::test]
async fn draining_empty_queue_still_stamps_completion() {
    let h = harness(ConnState::Online).await;
    assert_eq!(h.engine.status().last_sync_time, None);

    let summary = h.engine.force_sync().await.unwrap();
    assert_eq!(summary, herd_sync::DrainSummary::default());

    let status = h.engine.status();
    assert!(status.last_sync_time.is_some());
    assert_eq!(status.pending_count, 0);
}

#[tokio::test]
async fn concurrent_triggers_run_one_pass() {
    let h = harness(ConnState::Online).await;

    h.engine
        .submit(Method::Post, "/sessions", Some(json!({"milk": 5})))
        .await
        .unwrap();
    h.transport.set_latency(Duration::from_millis(100));

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.force_sync().await });

    // Let the first pass take the guard and go in-flight.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = h.engine.force_sync().await.unwrap();
    assert_eq!(second, herd_sync::DrainSummary::default());

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.succeeded, 1);

    // The operation was replayed exactly once.
    assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test]
async fn fresh_subscriber_sees_live_pending_count() {
    let h = harness(ConnState::Offline).await;

    for endpoint in ["/sessions", "/sales", "/buyers"] {
        h.engine.submit(Method::Post, endpoint, None).await.unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = seen.clone();
        let sub = h.engine.broadcaster().subscribe(move |status| {
            sink.lock().get_or_insert(status.clone());
        });

        let immediate = seen.lock().clone().unwrap();
        assert_eq!(immediate.pending_count, h.engine.queue().len().await.unwrap());
        h.engine.broadcaster().unsubscribe(sub);
    }

    assert_eq!(h.engine.status().pending_count, 3);
}

#[tokio::test]
async fn queued_mutation_replays_on_reconnect() {
    // The end-to-end offline story: record a milking session while
    // offline, come back online, watch it reach the backend.
    let h = harness(ConnState::Offline).await;
    h.engine.start();

    h.engine
        .submit(Method::Post, "/sessions", Some(json!({"milk": 5})))
        .await
        .unwrap();
    assert_eq!(h.engine.status().pending_count, 1);
    assert!(!h.engine.status().is_online);

    let mut events = h.engine.events().unwrap();
    h.monitor.signal_online();

    let summary = wait_for_pass(&mut events).await;
    assert_eq!(summary.succeeded, 1);

    let status = h.engine.status();
    assert!(status.is_online);
    assert_eq!(status.pending_count, 0);
    assert!(status.last_sync_time.is_some());

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, Method::Post);
    assert_eq!(calls[0].endpoint, "/sessions");
    assert_eq!(calls[0].payload, Some(json!({"milk": 5})));

    h.engine.stop().await;
}

#[tokio::test]
async fn failing_item_never_blocks_the_rest() {
    let h = harness(ConnState::Online).await;
    h.transport.fail_always("/b");

    enqueue_spaced(&h.engine, Method::Post, "/a").await;
    enqueue_spaced(&h.engine, Method::Post, "/b").await;
    enqueue_spaced(&h.engine, Method::Post, "/c").await;

    let mut events = h.engine.events().unwrap();

    // First pass: A and C confirmed on their single attempt, B retried.
    let first = h.engine.force_sync().await.unwrap();
    assert_eq!((first.succeeded, first.retried, first.dropped), (2, 1, 0));
    let endpoints: Vec<String> = h
        .transport
        .calls()
        .into_iter()
        .map(|c| c.endpoint)
        .collect();
    assert_eq!(endpoints, vec!["/a", "/b", "/c"]);

    // Two more passes exhaust B's budget.
    let second = h.engine.force_sync().await.unwrap();
    assert_eq!((second.succeeded, second.retried, second.dropped), (0, 1, 0));
    let third = h.engine.force_sync().await.unwrap();
    assert_eq!((third.succeeded, third.retried, third.dropped), (0, 0, 1));

    assert_eq!(h.transport.calls_to("/a").len(), 1);
    assert_eq!(h.transport.calls_to("/b").len(), 3);
    assert_eq!(h.transport.calls_to("/c").len(), 1);
    assert_eq!(h.engine.queue().len().await.unwrap(), 0);

    let mut exhausted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::RetryExhausted { operation } = event {
            exhausted.push(operation.endpoint);
        }
    }
    assert_eq!(exhausted, vec!["/b"]);
}

#[tokio::test]
async fn connectivity_loss_mid_pass_leaves_remainder_queued() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path()).await.unwrap();
    let monitor = Arc::new(ConnectivityMonitor::new(ConnState::Online));
    let transport = Arc::new(DropConnectivityTransport::new(monitor.clone(), 1));

    let engine = SyncEngine::new(
        store,
        monitor.clone(),
        transport.clone() as Arc<dyn ApiTransport>,
        SyncConfig::default(),
    )
    .await
    .unwrap();

    enqueue_spaced(&engine, Method::Post, "/a").await;
    enqueue_spaced(&engine, Method::Post, "/b").await;
    enqueue_spaced(&engine, Method::Post, "/c").await;

    let summary = engine.force_sync().await.unwrap();
    assert!(summary.aborted);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(transport.call_count(), 1);

    // The remainder stays queued, unattempted.
    let pending = engine.queue().list_pending().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|op| op.retry_count == 0));

    // Next trigger is refused until connectivity returns.
    assert!(matches!(
        engine.force_sync().await.unwrap_err(),
        SyncError::Offline
    ));
}
