//! Tests for message types.

use super::*;
use serde_json::json;

#[test]
fn test_queue_name_validation() {
    // Valid names
    assert!(QueueName::new("orders".to_string()).is_ok());
    assert!(QueueName::new("queue_123".to_string()).is_ok());
    assert!(QueueName::new("-leading-hyphen".to_string()).is_ok());
    assert!(QueueName::new("events.fifo".to_string()).is_ok());
    assert!(QueueName::new("a".repeat(80)).is_ok());

    // Invalid names
    assert!(QueueName::new("".to_string()).is_err());
    assert!(QueueName::new("a".repeat(81)).is_err());
    assert!(QueueName::new(".fifo".to_string()).is_err());
    assert!(QueueName::new("special@chars".to_string()).is_err());
    assert!(QueueName::new("dots.in.name".to_string()).is_err());
}

#[test]
fn test_queue_name_fifo_detection() {
    assert!(QueueName::new("events.fifo".to_string()).unwrap().is_fifo());
    assert!(!QueueName::new("events".to_string()).unwrap().is_fifo());
}

#[test]
fn test_queue_name_deserialization_validates() {
    let name: QueueName = serde_json::from_str("\"orders\"").unwrap();
    assert_eq!(name.as_str(), "orders");

    let bad: Result<QueueName, _> = serde_json::from_str("\"not valid!\"");
    assert!(bad.is_err());
}

#[test]
fn test_message_id_generation() {
    let id1 = MessageId::new();
    let id2 = MessageId::new();
    assert_ne!(id1, id2);
    assert!(!id1.as_str().is_empty());
    assert!("".parse::<MessageId>().is_err());
}

#[test]
fn test_text_body_is_sent_verbatim() {
    let message = OutboundMessage::new("1", "{\"not\": \"reformatted\"}");
    let prepared = message.prepare().unwrap();
    assert_eq!(prepared.body, "{\"not\": \"reformatted\"}");
}

#[test]
fn test_json_body_uses_canonical_serialization() {
    let message = OutboundMessage::new("1", json!({"i": 0}));
    let prepared = message.prepare().unwrap();
    assert_eq!(prepared.body, "{\"i\":0}");
}

#[test]
fn test_outbound_builder() {
    #[derive(Serialize)]
    struct Order {
        id: u32,
    }

    let message = OutboundMessage::json("order-1", &Order { id: 7 })
        .unwrap()
        .with_group_id("customers")
        .with_deduplication_id("order-1")
        .with_delay_seconds(5)
        .with_attribute("source", "web");

    assert_eq!(message.group_id.as_deref(), Some("customers"));
    assert_eq!(message.deduplication_id.as_deref(), Some("order-1"));
    assert_eq!(message.delay_seconds, Some(5));
    assert_eq!(
        message.message_attributes.get("source"),
        Some(&"web".to_string())
    );

    let prepared = message.prepare().unwrap();
    assert_eq!(prepared.body, "{\"id\":7}");
    assert_eq!(prepared.id, "order-1");
}

#[test]
fn test_inbound_json_round_trip() {
    let outbound = OutboundMessage::new("1", json!({"i": 2})).prepare().unwrap();
    let inbound = InboundMessage {
        message_id: MessageId::new(),
        receipt_handle: ReceiptHandle::new("r".to_string()),
        body: outbound.body,
        attributes: HashMap::new(),
        message_attributes: HashMap::new(),
        received_at: Timestamp::now(),
    };

    let value: serde_json::Value = inbound.json().unwrap();
    assert_eq!(value, json!({"i": 2}));
}

#[test]
fn test_inbound_receive_count_and_group() {
    let mut attributes = HashMap::new();
    attributes.insert("ApproximateReceiveCount".to_string(), "3".to_string());
    attributes.insert("MessageGroupId".to_string(), "g1".to_string());

    let inbound = InboundMessage {
        message_id: MessageId::new(),
        receipt_handle: ReceiptHandle::new("r".to_string()),
        body: "x".to_string(),
        attributes,
        message_attributes: HashMap::new(),
        received_at: Timestamp::now(),
    };

    assert_eq!(inbound.receive_count(), 3);
    assert_eq!(inbound.group_id(), Some("g1"));
}

#[test]
fn test_receive_request_builder() {
    let request = ReceiveRequest::new()
        .with_max_messages(10)
        .with_wait_time_seconds(20)
        .with_visibility_timeout_seconds(60)
        .with_message_attribute_name("All");

    assert_eq!(request.max_messages, 10);
    assert_eq!(request.wait_time_seconds, 20);
    assert_eq!(request.visibility_timeout_seconds, Some(60));
    assert_eq!(request.message_attribute_names, vec!["All".to_string()]);
}
