//! End-to-end consumer and producer scenarios against the in-memory transport.
//!
//! All tests run on a paused clock so long polls, timeouts and visibility
//! expiry advance instantly.

mod common;

use common::{engine_config, fast_options, queue_name, transport_with, EventLog};
use queue_dispatch::{
    ConfigurationError, ConsumerOptions, Engine, EventKind, Handler, HandlerError,
    HandlerRegistry, OutboundMessage, QueueDescriptor, QueueError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn counting_handler(invocations: Arc<AtomicUsize>) -> Handler {
    Handler::single(move |_| {
        let invocations = invocations.clone();
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_mode_processes_every_message_exactly_once() {
    let transport = transport_with(&["jobs"]);
    let invocations = Arc::new(AtomicUsize::new(0));
    let log = EventLog::new();

    let mut registry = HandlerRegistry::new();
    let registration = registry
        .register(queue_name("jobs"), counting_handler(invocations.clone()))
        .unwrap();
    log.attach(registration);

    let options = ConsumerOptions {
        batch_size: 10,
        concurrency_limit: 5,
        ..fast_options()
    };
    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::new(queue_name("jobs")).with_consumer_options(options)]),
        Arc::new(transport.clone()),
        registry,
    )
    .unwrap();

    let messages = (0..25).map(|i| OutboundMessage::new(i.to_string(), format!("job {}", i)));
    engine.send("jobs", messages).await.unwrap();

    engine.start().unwrap();
    log.wait_for(EventKind::MessageProcessed, 25).await;
    engine.stop().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 25);
    assert_eq!(transport.counts("jobs").unwrap().total(), 0);

    let mut bodies = log.processed_bodies();
    bodies.sort();
    let mut expected: Vec<String> = (0..25).map(|i| format!("job {}", i)).collect();
    expected.sort();
    assert_eq!(bodies, expected);
}

#[tokio::test(start_paused = true)]
async fn test_batch_mode_covers_every_message_within_batch_size() {
    let transport = transport_with(&["jobs"]);
    let batches: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let log = EventLog::new();

    let mut registry = HandlerRegistry::new();
    let sizes = batches.clone();
    let registration = registry
        .register(
            queue_name("jobs"),
            Handler::batch(move |messages| {
                let sizes = sizes.clone();
                async move {
                    sizes.lock().unwrap().push(messages.len());
                    Ok(())
                }
            }),
        )
        .unwrap();
    log.attach(registration);

    let options = ConsumerOptions {
        batch_size: 4,
        batch: Some(true),
        ..fast_options()
    };
    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::new(queue_name("jobs")).with_consumer_options(options)]),
        Arc::new(transport.clone()),
        registry,
    )
    .unwrap();

    engine
        .send("jobs", (0..18).map(|i| OutboundMessage::new(i.to_string(), "x")))
        .await
        .unwrap();
    engine.start().unwrap();
    log.wait_for(EventKind::MessageProcessed, 18).await;
    engine.stop().await;

    let batches = batches.lock().unwrap();
    assert_eq!(batches.iter().sum::<usize>(), 18);
    assert!(batches.iter().all(|size| (1..=4).contains(size)));
    assert_eq!(transport.counts("jobs").unwrap().total(), 0);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failing_message_is_never_deleted() {
    let transport = transport_with(&["jobs"]);
    let log = EventLog::new();

    let mut registry = HandlerRegistry::new();
    let registration = registry
        .register(
            queue_name("jobs"),
            Handler::single(|message| async move {
                if message.body == "poison" {
                    Err(HandlerError::new("cannot process poison"))
                } else {
                    Ok(())
                }
            }),
        )
        .unwrap();
    log.attach(registration);

    // Long visibility so the poison message is not redelivered during the test.
    let options = ConsumerOptions {
        visibility_timeout_seconds: 600,
        batch_size: 10,
        ..fast_options()
    };
    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::new(queue_name("jobs")).with_consumer_options(options)]),
        Arc::new(transport.clone()),
        registry,
    )
    .unwrap();

    engine
        .send(
            "jobs",
            [
                OutboundMessage::new("1", "fine"),
                OutboundMessage::new("2", "poison"),
                OutboundMessage::new("3", "also fine"),
            ],
        )
        .await
        .unwrap();
    engine.start().unwrap();
    log.wait_for(EventKind::MessageProcessed, 2).await;
    log.wait_for(EventKind::ProcessingError, 1).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    engine.stop().await;

    assert_eq!(log.count(EventKind::ProcessingError), 1);
    assert!(!log.processed_bodies().contains(&"poison".to_string()));
    assert_eq!(transport.bodies("jobs"), vec!["poison".to_string()]);
    assert_eq!(transport.counts("jobs").unwrap().in_flight, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_message_is_redelivered_after_visibility_expires() {
    let transport = transport_with(&["jobs"]);
    let attempts = Arc::new(AtomicUsize::new(0));
    let log = EventLog::new();

    let mut registry = HandlerRegistry::new();
    let counter = attempts.clone();
    let registration = registry
        .register(
            queue_name("jobs"),
            Handler::single(move |message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if message.receive_count() < 3 {
                        Err(HandlerError::from(anyhow::anyhow!("transient failure")))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .unwrap();
    log.attach(registration);

    let options = ConsumerOptions {
        visibility_timeout_seconds: 5,
        ..fast_options()
    };
    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::new(queue_name("jobs")).with_consumer_options(options)]),
        Arc::new(transport.clone()),
        registry,
    )
    .unwrap();

    engine.send("jobs", [OutboundMessage::new("1", "retry me")]).await.unwrap();
    engine.start().unwrap();
    log.wait_for(EventKind::MessageProcessed, 1).await;
    engine.stop().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(log.count(EventKind::ProcessingError), 2);
    assert_eq!(transport.counts("jobs").unwrap().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout_is_reported_and_message_kept() {
    let transport = transport_with(&["jobs"]);
    let log = EventLog::new();

    let mut registry = HandlerRegistry::new();
    let registration = registry
        .register(
            queue_name("jobs"),
            Handler::single(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
        )
        .unwrap();
    log.attach(registration);

    let options = ConsumerOptions {
        handle_message_timeout_ms: Some(2_000),
        visibility_timeout_seconds: 600,
        ..fast_options()
    };
    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::new(queue_name("jobs")).with_consumer_options(options)]),
        Arc::new(transport.clone()),
        registry,
    )
    .unwrap();

    engine.send("jobs", [OutboundMessage::new("1", "slow")]).await.unwrap();
    engine.start().unwrap();
    log.wait_for(EventKind::TimeoutError, 1).await;
    engine.stop().await;

    assert_eq!(log.count(EventKind::MessageProcessed), 0);
    assert_eq!(transport.counts("jobs").unwrap().in_flight, 1);
}

// ============================================================================
// Concurrency and visibility
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_in_flight_units_never_exceed_concurrency_limit() {
    let transport = transport_with(&["jobs"]);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let log = EventLog::new();

    let mut registry = HandlerRegistry::new();
    let (c, p) = (current.clone(), peak.clone());
    let registration = registry
        .register(
            queue_name("jobs"),
            Handler::single(move |_| {
                let (current, peak) = (c.clone(), p.clone());
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();
    log.attach(registration);

    let options = ConsumerOptions {
        batch_size: 10,
        concurrency_limit: 4,
        ..fast_options()
    };
    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::new(queue_name("jobs")).with_consumer_options(options)]),
        Arc::new(transport.clone()),
        registry,
    )
    .unwrap();

    engine
        .send("jobs", (0..40).map(|i| OutboundMessage::new(i.to_string(), "work")))
        .await
        .unwrap();
    engine.start().unwrap();
    log.wait_for(EventKind::MessageProcessed, 40).await;
    engine.stop().await;

    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert!(peak.load(Ordering::SeqCst) >= 2);
}

/// Run a 35 second handler against a 10 second visibility timeout for one
/// minute, returning the invocation count and messages left on the queue
async fn run_long_handler(heartbeat: Option<u32>) -> (usize, usize) {
    let transport = transport_with(&["jobs"]);
    let invocations = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    let counter = invocations.clone();
    registry
        .register(
            queue_name("jobs"),
            Handler::single(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(35)).await;
                    Ok(())
                }
            }),
        )
        .unwrap();

    let options = ConsumerOptions {
        visibility_timeout_seconds: 10,
        heartbeat_interval_seconds: heartbeat,
        concurrency_limit: 2,
        ..fast_options()
    };
    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::new(queue_name("jobs")).with_consumer_options(options)]),
        Arc::new(transport.clone()),
        registry,
    )
    .unwrap();

    engine.send("jobs", [OutboundMessage::new("1", "long")]).await.unwrap();
    engine.start().unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    engine.stop().await;

    (
        invocations.load(Ordering::SeqCst),
        transport.counts("jobs").unwrap().total(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_visibility_extension_prevents_redelivery_during_processing() {
    let (invocations, remaining) = run_long_handler(Some(4)).await;
    assert_eq!(invocations, 1);
    assert_eq!(remaining, 0);
}

#[tokio::test(start_paused = true)]
async fn test_without_extension_a_long_handler_sees_redelivery() {
    let (invocations, _) = run_long_handler(None).await;
    assert!(invocations >= 2);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_emits_stopped_once() {
    let transport = transport_with(&["jobs"]);
    let log = EventLog::new();

    let mut registry = HandlerRegistry::new();
    let registration = registry
        .register(queue_name("jobs"), Handler::single(|_| async { Ok(()) }))
        .unwrap();
    log.attach(registration);

    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::new(queue_name("jobs")).with_consumer_options(fast_options())]),
        Arc::new(transport),
        registry,
    )
    .unwrap();

    engine.start().unwrap();
    log.wait_for(EventKind::Empty, 2).await;

    engine.stop().await;
    engine.stop().await;
    engine.stop().await;

    assert_eq!(log.count(EventKind::Stopped), 1);
    let events = log.events();
    assert_eq!(events.last().map(|e| e.kind()), Some(EventKind::Stopped));
}

// ============================================================================
// Orders scenario
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    order_id: u32,
    customer: String,
    total_cents: u64,
}

#[tokio::test(start_paused = true)]
async fn test_orders_batches_of_three_round_trip_json() {
    let transport = transport_with(&["orders"]);
    let received: Arc<Mutex<Vec<Order>>> = Arc::new(Mutex::new(Vec::new()));
    let batch_sizes: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let log = EventLog::new();

    let mut registry = HandlerRegistry::new();
    let (orders, sizes) = (received.clone(), batch_sizes.clone());
    let registration = registry
        .register(
            queue_name("orders"),
            Handler::batch(move |messages| {
                let (orders, sizes) = (orders.clone(), sizes.clone());
                async move {
                    sizes.lock().unwrap().push(messages.len());
                    for message in &messages {
                        let order: Order = message.json().map_err(HandlerError::from_source)?;
                        orders.lock().unwrap().push(order);
                    }
                    Ok::<(), HandlerError>(())
                }
            }),
        )
        .unwrap();
    log.attach(registration);

    let options = ConsumerOptions {
        batch_size: 3,
        batch: Some(true),
        ..fast_options()
    };
    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::new(queue_name("orders")).with_consumer_options(options)]),
        Arc::new(transport.clone()),
        registry,
    )
    .unwrap();

    let sent_orders: Vec<Order> = (1..=7)
        .map(|i| Order {
            order_id: i,
            customer: format!("customer-{}", i),
            total_cents: u64::from(i) * 1_250,
        })
        .collect();
    let messages = sent_orders
        .iter()
        .map(|order| OutboundMessage::json(order.order_id.to_string(), order).unwrap());
    let sent = engine.send("orders", messages).await.unwrap();
    assert_eq!(sent.len(), 7);

    engine.start().unwrap();
    log.wait_for(EventKind::MessageProcessed, 7).await;
    engine.stop().await;

    let mut received = received.lock().unwrap().clone();
    received.sort_by_key(|o| o.order_id);
    assert_eq!(received, sent_orders);
    assert!(batch_sizes.lock().unwrap().iter().all(|size| *size <= 3));
    assert_eq!(log.count(EventKind::ProcessingError), 0);
    assert_eq!(engine.producer_queue_size("orders").await.unwrap(), 0);
}

#[tokio::test]
async fn test_send_to_unregistered_queue_fails_without_transport_call() {
    let transport = transport_with(&["orders"]);
    let engine = Engine::new(
        engine_config(vec![QueueDescriptor::producer(queue_name("orders"))]),
        Arc::new(transport.clone()),
        HandlerRegistry::new(),
    )
    .unwrap();

    let error = engine
        .send("ghost", [OutboundMessage::new("1", "boo")])
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        QueueError::ConfigurationError(ConfigurationError::ProducerNotFound { .. })
    ));
    assert_eq!(transport.calls().total(), 0);
    assert_eq!(transport.counts("orders").unwrap().total(), 0);
}
