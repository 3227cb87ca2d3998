//! Tests for engine wiring and lifecycle.

use super::*;
use crate::config::{ConsumerOptions, QueueDescriptor, QueueMode};
use crate::events::{ConsumerEvent, EventKind};
use crate::message::QueueName;
use crate::providers::InMemoryTransport;
use crate::registry::Handler;
use std::sync::atomic::{AtomicUsize, Ordering};

fn name(s: &str) -> QueueName {
    QueueName::new(s.to_string()).unwrap()
}

fn config(queues: Vec<QueueDescriptor>) -> EngineConfig {
    let mut config = EngineConfig::new("memory://local", "000000000000")
        .with_shutdown_timeout(Duration::from_secs(5));
    config.queues = queues;
    config
}

fn fast_consumer(queue: &str) -> QueueDescriptor {
    QueueDescriptor::new(name(queue)).with_consumer_options(ConsumerOptions {
        wait_time_seconds: 1,
        ..Default::default()
    })
}

fn ok_registry(queues: &[&str]) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for queue in queues {
        registry
            .register(name(queue), Handler::single(|_| async { Ok(()) }))
            .unwrap();
    }
    registry
}

fn transport_with(queues: &[&str]) -> InMemoryTransport {
    let transport = InMemoryTransport::new();
    for queue in queues {
        transport.create_queue(&name(queue));
    }
    transport
}

mod validation {
    use super::*;

    fn build(config: EngineConfig, registry: HandlerRegistry) -> Result<Engine, ConfigurationError> {
        Engine::new(config, Arc::new(InMemoryTransport::new()), registry)
    }

    #[test]
    fn test_consumer_queue_without_handler_is_rejected() {
        let result = build(config(vec![QueueDescriptor::consumer(name("orders"))]), ok_registry(&[]));
        assert!(matches!(result, Err(ConfigurationError::MissingHandler { .. })));
    }

    #[test]
    fn test_handler_for_unknown_queue_is_rejected() {
        let result = build(config(vec![]), ok_registry(&["ghost"]));
        assert!(matches!(result, Err(ConfigurationError::UnknownQueue { .. })));
    }

    #[test]
    fn test_handler_for_producer_queue_is_rejected() {
        let result = build(
            config(vec![QueueDescriptor::producer(name("outbox"))]),
            ok_registry(&["outbox"]),
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::HandlerWithoutConsumer { .. })
        ));
    }

    #[test]
    fn test_batch_option_must_match_handler_shape() {
        let descriptor = QueueDescriptor::new(name("orders")).with_consumer_options(ConsumerOptions {
            batch: Some(true),
            batch_size: 5,
            ..Default::default()
        });

        let result = build(config(vec![descriptor.clone()]), ok_registry(&["orders"]));
        match result {
            Err(ConfigurationError::HandlerModeMismatch { expected, .. }) => assert_eq!(expected, "batch"),
            other => panic!("expected HandlerModeMismatch, got {:?}", other.err()),
        }

        let mut registry = HandlerRegistry::new();
        registry
            .register(name("orders"), Handler::batch(|_| async { Ok(()) }))
            .unwrap();
        assert!(build(config(vec![descriptor]), registry).is_ok());
    }

    #[test]
    fn test_duplicate_descriptors_are_rejected() {
        let result = build(
            config(vec![
                QueueDescriptor::producer(name("outbox")),
                QueueDescriptor::producer(name("outbox")),
            ]),
            ok_registry(&[]),
        );
        assert!(matches!(result, Err(ConfigurationError::DuplicateQueue { .. })));
    }

    #[test]
    fn test_producer_only_configuration_needs_no_handlers() {
        let result = build(config(vec![QueueDescriptor::producer(name("outbox"))]), ok_registry(&[]));
        assert!(result.is_ok());
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_consumes_until_stopped() {
        let transport = transport_with(&["orders"]);
        let processed = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        let counter = processed.clone();
        let stops = stopped.clone();
        registry
            .register(
                name("orders"),
                Handler::single(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap()
            .on(EventKind::Stopped, move |_| {
                stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let engine = Engine::new(
            config(vec![fast_consumer("orders")]),
            Arc::new(transport.clone()),
            registry,
        )
        .unwrap();

        engine
            .send("orders", (0..4).map(|i| OutboundMessage::new(i.to_string(), "work")))
            .await
            .unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());

        for _ in 0..1_000 {
            if processed.load(Ordering::SeqCst) == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        engine.stop().await;
        assert!(!engine.is_running());
        assert_eq!(processed.load(Ordering::SeqCst), 4);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(transport.counts("orders").unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_is_final() {
        let transport = transport_with(&["orders"]);
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let stops = stopped.clone();
        registry
            .register(name("orders"), Handler::single(|_| async { Ok(()) }))
            .unwrap()
            .on(EventKind::Stopped, move |event| {
                assert!(matches!(event, ConsumerEvent::Stopped { .. }));
                stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let engine = Engine::new(
            config(vec![fast_consumer("orders")]),
            Arc::new(transport),
            registry,
        )
        .unwrap();

        engine.start().unwrap();
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        engine.stop().await;
        engine.stop().await;

        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(matches!(engine.start(), Err(ConfigurationError::Invalid { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stops_all_wait_for_drain() {
        let transport = transport_with(&["orders"]);
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = finished.clone();
        registry
            .register(
                name("orders"),
                Handler::single(move |_| {
                    let counter = counter.clone();
                    async move {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let engine = Arc::new(
            Engine::new(
                config(vec![fast_consumer("orders")]),
                Arc::new(transport.clone()),
                registry,
            )
            .unwrap(),
        );
        engine
            .send("orders", [OutboundMessage::new("1", "slow")])
            .await
            .unwrap();
        engine.start().unwrap();

        while transport.counts("orders").unwrap().in_flight == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let other = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.stop().await })
        };
        engine.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        other.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_harmless() {
        let engine = Engine::new(
            config(vec![fast_consumer("orders")]),
            Arc::new(transport_with(&["orders"])),
            ok_registry(&["orders"]),
        )
        .unwrap();

        engine.stop().await;
        assert!(!engine.is_running());
    }
}

mod operations {
    use super::*;

    fn engine(transport: &InMemoryTransport) -> Engine {
        Engine::new(
            config(vec![
                QueueDescriptor::producer(name("outbox")),
                fast_consumer("orders").with_mode(QueueMode::Consumer),
            ]),
            Arc::new(transport.clone()),
            ok_registry(&["orders"]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_to_unknown_queue_makes_no_transport_call() {
        let transport = transport_with(&["outbox", "orders"]);
        let engine = engine(&transport);

        let error = engine
            .send("ghost", [OutboundMessage::new("1", "boo")])
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            QueueError::ConfigurationError(ConfigurationError::ProducerNotFound { .. })
        ));
        assert_eq!(error.to_string(), "Configuration error: Producer does not exist: ghost");
        assert_eq!(transport.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_send_to_consumer_only_queue_is_rejected() {
        let transport = transport_with(&["outbox", "orders"]);
        let engine = engine(&transport);

        let error = engine
            .send("orders", [OutboundMessage::new("1", "x")])
            .await
            .unwrap_err();

        assert!(error.is_configuration_error());
        assert!(matches!(
            engine.producer_queue_size("orders").await,
            Err(QueueError::ConfigurationError(ConfigurationError::ProducerNotFound { .. }))
        ));
        assert_eq!(transport.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_queue_administration() {
        let transport = transport_with(&["outbox", "orders"]);
        let engine = engine(&transport);

        engine
            .send("outbox", [OutboundMessage::new("1", "a"), OutboundMessage::new("2", "b")])
            .await
            .unwrap();
        assert_eq!(engine.producer_queue_size("outbox").await.unwrap(), 2);

        let attributes = engine.get_queue_attributes("outbox").await.unwrap();
        assert_eq!(attributes["ApproximateNumberOfMessages"], "2");

        engine.purge_queue("outbox").await.unwrap();
        assert_eq!(engine.producer_queue_size("outbox").await.unwrap(), 0);

        // Consumer queues are administrable too.
        engine.purge_queue("orders").await.unwrap();
    }

    #[test]
    fn test_queue_url_is_built_from_endpoint_and_account() {
        let transport = InMemoryTransport::new();
        let engine = engine(&transport);

        assert_eq!(
            engine.queue_url("outbox").unwrap(),
            "memory://local/000000000000/outbox"
        );
        assert!(matches!(
            engine.queue_url("ghost"),
            Err(ConfigurationError::UnknownQueue { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_queue_administration_is_rejected() {
        let transport = InMemoryTransport::new();
        let engine = engine(&transport);

        assert!(matches!(
            engine.purge_queue("ghost").await,
            Err(QueueError::ConfigurationError(ConfigurationError::UnknownQueue { .. }))
        ));
        assert!(engine.get_queue_attributes("ghost").await.is_err());
        assert_eq!(transport.calls().total(), 0);
    }
}
