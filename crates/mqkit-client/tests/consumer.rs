use futures::StreamExt;
use mqkit_adapter_memory::MemoryBroker;
use mqkit_client::{Connection, ConsumerConfig, ConsumerState, PublisherConfig};
use mqkit_core::{MqError, QueueSpec, Topology};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn setup(queue: &str) -> (MemoryBroker, Connection) {
    let broker = MemoryBroker::new();
    let connection = Connection::new(broker.connect());
    connection
        .reconcile(&Topology::new().with_queue(queue, QueueSpec::new()))
        .await
        .unwrap();
    (broker, connection)
}

#[tokio::test]
async fn consumer_stops_after_close() {
    let (broker, connection) = setup("work").await;
    let publisher = connection.publisher(PublisherConfig::new("")).await.unwrap();
    let consumer = connection.consumer(ConsumerConfig::new("work")).await.unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let handle = consumer
        .run(move |message| {
            let seen = seen_tx.clone();
            async move {
                let _ = seen.send(message.text().into_owned());
            }
        })
        .await
        .unwrap();

    for body in ["one", "two", "three"] {
        publisher.send_text("work", body).await.unwrap();
    }
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(received, vec!["one", "two", "three"]);

    handle.close().await.unwrap();
    timeout(WAIT, handle.closed()).await.unwrap();
    assert_eq!(handle.state(), ConsumerState::Closed);

    publisher.send_text("work", "four").await.unwrap();
    publisher.send_text("work", "five").await.unwrap();

    handle.join().await.unwrap();
    assert!(seen_rx.try_recv().is_err());
    assert_eq!(broker.queue_depth("work"), 2);
    assert_eq!(broker.consumer_count("work"), 0);
}

#[tokio::test]
async fn run_reports_states() {
    let (_broker, connection) = setup("work").await;
    let consumer = connection.consumer(ConsumerConfig::new("work")).await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Created);

    let handle = consumer.run(|_| async {}).await.unwrap();
    assert_ne!(handle.state(), ConsumerState::Created);

    handle.close().await.unwrap();
    timeout(WAIT, handle.closed()).await.unwrap();
    assert_eq!(handle.state(), ConsumerState::Closed);
}

#[tokio::test]
async fn handler_panic_does_not_stop_the_loop() {
    let (_broker, connection) = setup("work").await;
    let publisher = connection.publisher(PublisherConfig::new("")).await.unwrap();
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let consumer = connection
        .consumer(ConsumerConfig::new("work").error_channel(errors_tx))
        .await
        .unwrap();

    let handled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&handled);
    let handle = consumer
        .run(move |message| {
            let sink = Arc::clone(&sink);
            async move {
                let text = message.text().into_owned();
                assert!(text != "poison", "poisoned message");
                sink.lock().unwrap().push(text);
            }
        })
        .await
        .unwrap();

    publisher.send_text("work", "before").await.unwrap();
    publisher.send_text("work", "poison").await.unwrap();
    publisher.send_text("work", "after").await.unwrap();

    let err = timeout(WAIT, errors_rx.recv()).await.unwrap().unwrap();
    match err {
        MqError::Handler(reason) => assert!(reason.contains("poisoned message")),
        other => panic!("unexpected error: {other}"),
    }

    timeout(WAIT, async {
        while handled.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*handled.lock().unwrap(), vec!["before", "after"]);
    assert_eq!(handle.state(), ConsumerState::Dispatching);

    handle.close().await.unwrap();
}

#[tokio::test]
async fn disconnect_is_reported_and_closes_consumer() {
    let (broker, connection) = setup("work").await;
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let consumer = connection
        .consumer(ConsumerConfig::new("work").error_channel(errors_tx))
        .await
        .unwrap();
    let handle = consumer.run(|_| async {}).await.unwrap();

    broker.disconnect();

    let err = timeout(WAIT, errors_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(err, MqError::Connectivity { .. }));
    timeout(WAIT, handle.closed()).await.unwrap();
    assert_eq!(handle.state(), ConsumerState::Closed);
}

#[tokio::test]
async fn rejected_subscription_is_returned_to_caller() {
    let broker = MemoryBroker::new();
    let connection = Connection::new(broker.connect());
    let consumer = connection
        .consumer(ConsumerConfig::new("missing"))
        .await
        .unwrap();

    let err = consumer.run(|_| async {}).await.unwrap_err();

    match err {
        MqError::Subscription { queue, .. } => assert_eq!(queue, "missing"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn subscribe_yields_messages_in_order() {
    let (_broker, connection) = setup("work").await;
    let publisher = connection.publisher(PublisherConfig::new("")).await.unwrap();
    let consumer = connection.consumer(ConsumerConfig::new("work")).await.unwrap();

    let mut stream = consumer.subscribe().await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Subscribed);
    assert!(consumer.subscribe().await.is_err());

    publisher.send_json("work", &serde_json::json!({"n": 1})).await.unwrap();
    publisher.send_json("work", &serde_json::json!({"n": 2})).await.unwrap();

    for expected in [1, 2] {
        let message = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
        let value: serde_json::Value = message.json().unwrap();
        assert_eq!(value["n"], expected);
        assert_eq!(message.routing_key(), "work");
    }
}

#[tokio::test]
async fn manual_ack_settles_deliveries() {
    let (_broker, connection) = setup("work").await;
    let publisher = connection.publisher(PublisherConfig::new("")).await.unwrap();
    let consumer = connection
        .consumer(ConsumerConfig::new("work").auto_ack(false))
        .await
        .unwrap();
    let mut stream = consumer.subscribe().await.unwrap();

    publisher.send_text("work", "job").await.unwrap();
    let message = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();

    message.ack().await.unwrap();
    assert!(message.ack().await.is_err());
}
