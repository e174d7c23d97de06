//! Task queue ordering, cache invalidation and connection registry tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use state_service::cache::chat_history_key;
use state_service::connections::ConnectionRegistry;
use state_service::task_queue::{TaskPriority, TaskType};
use state_test_utils::{media_payload, TestHarness};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Task queue
// ============================================================================

#[tokio::test]
async fn test_dequeue_order_is_priority_then_fifo() {
    let harness = TestHarness::new();
    let queue = harness.state.tasks();

    let low = queue
        .enqueue(TaskType::MediaAnalysis, &media_payload("f1"), TaskPriority::Low)
        .await
        .unwrap();
    let high_first = queue
        .enqueue(TaskType::MediaProcessing, &media_payload("f2"), TaskPriority::High)
        .await
        .unwrap();
    let medium = queue
        .enqueue(TaskType::MediaAnalysis, &media_payload("f3"), TaskPriority::Medium)
        .await
        .unwrap();
    let high_second = queue
        .enqueue(TaskType::MediaProcessing, &media_payload("f4"), TaskPriority::High)
        .await
        .unwrap();

    assert_eq!(queue.pending().await.unwrap(), 4);

    let mut order = Vec::new();
    while let Some(task) = queue.dequeue().await.unwrap() {
        order.push(task.id);
    }
    assert_eq!(order, vec![high_first, high_second, medium, low]);
    assert_eq!(queue.pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_peek_does_not_consume() {
    let harness = TestHarness::new();
    let queue = harness.state.tasks();
    queue
        .enqueue_default(TaskType::MediaProcessing, &media_payload("f1"))
        .await
        .unwrap();

    let peeked = queue.peek(10).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked.first().unwrap().payload["file_id"], "f1");
    assert_eq!(queue.pending().await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_consumers_each_get_distinct_tasks() {
    let harness = TestHarness::new();
    let queue = harness.state.tasks().clone();
    for i in 0..20 {
        queue
            .enqueue(
                TaskType::MediaAnalysis,
                &media_payload(&format!("f{i}")),
                TaskPriority::Medium,
            )
            .await
            .unwrap();
    }

    let taken = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        let taken = taken.clone();
        workers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(task) = queue.dequeue().await.unwrap() {
                taken.fetch_add(1, Ordering::SeqCst);
                ids.push(task.id);
            }
            ids
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 20);
    assert_eq!(taken.load(Ordering::SeqCst), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_get_distinct_ids_and_sequences() {
    let harness = TestHarness::new();
    let queue = harness.state.tasks().clone();

    let producers: Vec<_> = (0..50)
        .map(|i| {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        TaskType::MediaAnalysis,
                        &media_payload(&format!("f{i}")),
                        TaskPriority::Medium,
                    )
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for producer in producers {
        ids.insert(producer.await.unwrap());
    }
    assert_eq!(ids.len(), 50);

    let tasks = queue.dequeue_batch(100).await.unwrap();
    assert_eq!(tasks.len(), 50);
    let sequences: HashSet<u64> = tasks.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, (1..=50).collect::<HashSet<u64>>());
    assert!(tasks.iter().all(|t| ids.contains(&t.id)));
    // Retrieval order follows the sequence numbers
    assert!(tasks.windows(2).all(|pair| match pair {
        [a, b] => a.sequence < b.sequence,
        _ => true,
    }));
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_invalidate_then_get_misses() {
    let harness = TestHarness::new();
    let cache = harness.state.cache();
    let key = chat_history_key("alice");

    assert!(cache.set(&key, &vec!["hello", "world"], None).await);
    assert_eq!(
        cache.get::<Vec<String>>(&key).await,
        Some(vec!["hello".to_string(), "world".to_string()])
    );

    harness.state.record_chat_mutation("alice").await.unwrap();
    assert_eq!(cache.get::<Vec<String>>(&key).await, None);
}

#[tokio::test]
async fn test_get_or_compute_reads_through_once() {
    let harness = TestHarness::new();
    let cache = harness.state.cache();
    let counter = AtomicUsize::new(0);
    let computed = &counter;

    for _ in 0..3 {
        let value: u32 = cache
            .get_or_compute("answer", None, move || async move {
                computed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
    assert_eq!(computed.load(Ordering::SeqCst), 1);

    // Default TTL is 300s
    harness.advance(Duration::from_secs(300));
    let _: u32 = cache
        .get_or_compute("answer", None, move || async move {
            computed.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>(42)
        })
        .await
        .unwrap();
    assert_eq!(computed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_prefix_clears_matching_entries() {
    let harness = TestHarness::new();
    let cache = harness.state.cache();
    cache.set("chat_history:alice", &1, None).await;
    cache.set("chat_history:bob", &2, None).await;
    cache.set("media_history:alice", &3, None).await;

    assert_eq!(cache.invalidate_prefix("chat_history:").await.unwrap(), 2);
    assert_eq!(cache.get::<u32>("chat_history:bob").await, None);
    assert_eq!(cache.get::<u32>("media_history:alice").await, Some(3));
}

// ============================================================================
// Connection registry
// ============================================================================

#[tokio::test]
async fn test_reconnect_replaces_previous_handle() {
    let harness = TestHarness::new();
    let registry = harness.state.connections();

    let (first, mut first_rx) = registry.open(4);
    let (second, mut second_rx) = registry.open(4);
    let first_id = first.connection_id();

    assert!(registry.register("alice", first).is_none());
    let replaced = registry.register("alice", second).unwrap();
    assert_eq!(replaced.connection_id(), first_id);
    replaced.close();
    assert_eq!(registry.len(), 1);

    assert!(registry.send("alice", serde_json::json!({"type": "ping"})));
    assert_eq!(second_rx.recv().await.unwrap()["type"], "ping");
    assert!(first_rx.try_recv().is_err());

    // The old connection's disconnect must not evict the new one
    assert!(!registry.unregister_connection("alice", first_id));
    assert!(registry.is_connected("alice"));
}

#[tokio::test]
async fn test_connected_at_follows_harness_clock() {
    let harness = TestHarness::new();
    harness.advance_secs(42);

    let (handle, _rx) = harness.state.connections().open(1);
    assert_eq!(handle.connected_at(), harness.now());
}

#[tokio::test]
async fn test_send_to_dropped_receiver_prunes_entry() {
    let harness = TestHarness::new();
    let registry = harness.state.connections();

    let (handle, rx) = registry.open(1);
    registry.register("bob", handle);
    drop(rx);

    assert!(!registry.send("bob", serde_json::json!("hi")));
    assert!(!registry.is_connected("bob"));
    assert_eq!(harness.state.health().await.connections_active, 0);
}

#[tokio::test]
async fn test_send_to_full_channel_returns_promptly() {
    let harness = TestHarness::new();
    let registry = harness.state.connections();

    let (handle, mut rx) = registry.open(1);
    registry.register("carol", handle);
    assert!(registry.send("carol", serde_json::json!(1)));

    let second = tokio::time::timeout(Duration::from_secs(2), async {
        registry.send("carol", serde_json::json!(2))
    })
    .await
    .expect("send must not wait on a full channel");
    assert!(!second);
    assert!(registry.is_connected("carol"));
    assert_eq!(rx.recv().await.unwrap(), 1);
}

#[tokio::test]
async fn test_broadcast_reaches_live_clients() {
    let harness = TestHarness::new();
    let registry = harness.state.connections();

    let (a, mut a_rx) = registry.open(1);
    let (b, mut b_rx) = registry.open(1);
    let (c, c_rx) = registry.open(1);
    registry.register("a", a);
    registry.register("b", b);
    registry.register("c", c);
    drop(c_rx);

    let delivered = registry.broadcast(serde_json::json!("notice"));
    assert_eq!(delivered, 2);
    assert_eq!(a_rx.recv().await.unwrap(), "notice");
    assert_eq!(b_rx.recv().await.unwrap(), "notice");
    assert_eq!(registry.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_and_unregister_keep_map_intact() {
    let harness = TestHarness::new();
    let registry = Arc::new(ConnectionRegistry::<serde_json::Value>::with_clock(
        harness.clock.clone(),
    ));

    let workers: Vec<_> = (0..64)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                let client_id = format!("client-{i}");
                let (handle, rx) = registry.open(4);
                let connection_id = handle.connection_id();
                registry.register(client_id.clone(), handle);
                tokio::task::yield_now().await;
                // Odd clients disconnect again
                if i % 2 == 1 {
                    assert!(registry.unregister_connection(&client_id, connection_id));
                }
                rx
            })
        })
        .collect();

    let mut receivers = Vec::new();
    for worker in workers {
        receivers.push(worker.await.unwrap());
    }

    assert_eq!(registry.len(), 32);
    let mut ids = registry.client_ids();
    ids.sort();
    let mut expected: Vec<String> = (0..64)
        .filter(|i| i % 2 == 0)
        .map(|i| format!("client-{i}"))
        .collect();
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(registry.broadcast(serde_json::json!("hello")), 32);
}
