use futures::StreamExt;
use mqkit_adapter_memory::MemoryBroker;
use mqkit_client::{Connection, ConsumerConfig, PublisherConfig};
use mqkit_core::{
    DeliveryMode, ExchangeKind, ExchangeSpec, MqError, Publishing, QueueSpec, Topology,
    CONTENT_JSON,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

#[tokio::test]
async fn send_fails_fast_on_closed_channel() {
    let broker = MemoryBroker::new();
    let connection = Connection::new(broker.connect());
    let publisher = connection.publisher(PublisherConfig::new("")).await.unwrap();

    publisher.channel().close().await.unwrap();
    let err = publisher.send_text("anywhere", "hello").await.unwrap_err();

    match err {
        MqError::Publish {
            exchange,
            routing_key,
            reason,
        } => {
            assert_eq!(exchange, "");
            assert_eq!(routing_key, "anywhere");
            assert!(reason.contains("closed"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.stats().published, 0);
}

#[tokio::test]
async fn send_fails_fast_after_disconnect() {
    let broker = MemoryBroker::new();
    let connection = Connection::new(broker.connect());
    let publisher = connection.publisher(PublisherConfig::new("")).await.unwrap();

    broker.disconnect();

    assert!(!publisher.channel().is_open());
    let err = publisher.send_text("anywhere", "hello").await.unwrap_err();
    assert!(matches!(err, MqError::Publish { .. }));
}

#[tokio::test]
async fn topic_routing_delivers_json_with_defaults() {
    let broker = MemoryBroker::new();
    let connection = Connection::new(broker.connect());
    connection
        .reconcile(
            &Topology::new()
                .with_exchange("orders", ExchangeSpec::new(ExchangeKind::Topic))
                .with_queue("eu", QueueSpec::new().bind("orders", "order.eu.*"))
                .with_queue("all", QueueSpec::new().bind("orders", "order.#")),
        )
        .await
        .unwrap();
    let publisher = connection
        .publisher(PublisherConfig::new("orders"))
        .await
        .unwrap();
    let mut eu = connection
        .consumer(ConsumerConfig::new("eu"))
        .await
        .unwrap()
        .subscribe()
        .await
        .unwrap();

    let order = Order {
        id: 7,
        item: "widget".to_string(),
    };
    publisher.send_json("order.eu.new", &order).await.unwrap();
    publisher.send_json("order.us.new", &order).await.unwrap();

    let message = timeout(Duration::from_secs(2), eu.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message.json::<Order>().unwrap(), order);
    assert_eq!(message.exchange(), "orders");
    assert_eq!(
        message.properties().content_type.as_deref(),
        Some(CONTENT_JSON)
    );
    assert_eq!(
        message.properties().delivery_mode,
        Some(DeliveryMode::Persistent)
    );
    assert_eq!(broker.queue_depth("all"), 2);
    assert_eq!(broker.queue_depth("eu"), 0);
}

#[tokio::test]
async fn gzip_body_is_decoded_on_receipt() {
    let broker = MemoryBroker::new();
    let connection = Connection::new(broker.connect());
    connection
        .reconcile(&Topology::new().with_queue("inbox", QueueSpec::new()))
        .await
        .unwrap();
    let publisher = connection.publisher(PublisherConfig::new("")).await.unwrap();
    let mut inbox = connection
        .consumer(ConsumerConfig::new("inbox"))
        .await
        .unwrap()
        .subscribe()
        .await
        .unwrap();

    let order = Order {
        id: 1,
        item: "crate".to_string(),
    };
    publisher
        .send("inbox", &Publishing::json_gzip(&order).unwrap())
        .await
        .unwrap();

    let message = timeout(Duration::from_secs(2), inbox.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_ne!(message.body(), serde_json::to_vec(&order).unwrap().as_slice());
    assert_eq!(message.json::<Order>().unwrap(), order);
}
