use mqkit_adapter_memory::MemoryBroker;
use mqkit_client::Connection;
use mqkit_core::{
    BrokerConnection, BrokerError, Entity, ExchangeKind, ExchangeSpec, MqError, QueueSpec,
    Topology,
};
use std::sync::Arc;

fn connect(broker: &MemoryBroker) -> Connection {
    Connection::new(broker.connect())
}

fn jobs_topology() -> Topology {
    Topology::new()
        .with_exchange("events", ExchangeSpec::new(ExchangeKind::Topic).durable(true))
        .with_queue("jobs", QueueSpec::new().durable(true).bind("events", "job.*"))
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let topology = jobs_topology();

    let first = connection.reconcile(&topology).await.unwrap();
    assert_eq!(first.exchanges_declared, 1);
    assert_eq!(first.queues_declared, 1);
    assert_eq!(first.bindings_applied, 1);

    let second = connection.reconcile(&topology).await.unwrap();
    assert!(second.is_unchanged());
    assert_eq!(second.exchanges_existing, 1);
    assert_eq!(second.queues_existing, 1);

    let stats = broker.stats();
    assert_eq!(stats.exchanges_created, 1);
    assert_eq!(stats.queues_created, 1);
    assert_eq!(stats.bindings_created, 1);
    assert_eq!(broker.bindings("events"), vec![("jobs".to_string(), "job.*".to_string())]);
}

#[tokio::test]
async fn bindings_do_not_depend_on_declaration_order() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);

    // Sorted iteration visits every binding owner before its source.
    let topology = Topology::new()
        .with_exchange(
            "alpha",
            ExchangeSpec::new(ExchangeKind::Fanout).bind("zulu", "orders.#"),
        )
        .with_exchange("zulu", ExchangeSpec::new(ExchangeKind::Topic))
        .with_queue("audit", QueueSpec::new().bind("alpha", ""))
        .with_queue("billing", QueueSpec::new().bind("zulu", "orders.paid"));

    let report = connection.reconcile(&topology).await.unwrap();
    assert_eq!(report.bindings_applied, 3);

    let mut from_zulu = broker.bindings("zulu");
    from_zulu.sort();
    assert_eq!(
        from_zulu,
        vec![
            ("alpha".to_string(), "orders.#".to_string()),
            ("billing".to_string(), "orders.paid".to_string()),
        ]
    );
    assert_eq!(broker.bindings("alpha"), vec![("audit".to_string(), String::new())]);
}

#[tokio::test]
async fn kind_conflict_names_the_exchange() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    connection
        .reconcile(&Topology::new().with_exchange("ex", ExchangeSpec::new(ExchangeKind::Topic)))
        .await
        .unwrap();

    let err = connection
        .reconcile(&Topology::new().with_exchange("ex", ExchangeSpec::new(ExchangeKind::Direct)))
        .await
        .unwrap_err();

    assert_eq!(err.entity(), Some(&Entity::Exchange("ex".to_string())));
    assert!(err.to_string().contains("'ex'"));
    assert_eq!(
        broker.exchange_spec("ex").map(|spec| spec.kind),
        Some(ExchangeKind::Topic)
    );
}

#[tokio::test]
async fn conflict_aborts_before_bindings() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    connection
        .reconcile(&Topology::new().with_queue("jobs", QueueSpec::new().durable(true)))
        .await
        .unwrap();

    let topology = Topology::new()
        .with_exchange("events", ExchangeSpec::new(ExchangeKind::Direct))
        .with_queue("jobs", QueueSpec::new().durable(false).bind("events", "job"));
    let err = connection.reconcile(&topology).await.unwrap_err();

    assert_eq!(err.entity(), Some(&Entity::Queue("jobs".to_string())));
    assert!(broker.has_exchange("events"));
    assert!(broker.bindings("events").is_empty());
}

#[tokio::test]
async fn binding_to_missing_exchange_names_the_binding() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let topology = Topology::new().with_queue("jobs", QueueSpec::new().bind("missing", "k"));

    let err = connection.reconcile(&topology).await.unwrap_err();

    let MqError::TopologyConflict { entity, source } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(
        entity,
        &Entity::Binding {
            source: "missing".to_string(),
            destination: "jobs".to_string(),
            routing_key: "k".to_string(),
        }
    );
    assert!(matches!(source, BrokerError::NotFound(_)));
    assert!(broker.has_queue("jobs"));
}

#[tokio::test]
async fn deleting_missing_topology_reports_every_entity() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let topology = Topology::new()
        .with_exchange("ghost", ExchangeSpec::new(ExchangeKind::Fanout))
        .with_queue("phantom", QueueSpec::new());

    let err = connection.delete_topology(&topology).await.unwrap_err();

    let MqError::Teardown { failures } = &err else {
        panic!("unexpected error: {err}");
    };
    let entities: Vec<&Entity> = failures.iter().map(|f| &f.entity).collect();
    assert_eq!(
        entities,
        vec![
            &Entity::Exchange("ghost".to_string()),
            &Entity::Queue("phantom".to_string()),
        ]
    );
    assert!(failures
        .iter()
        .all(|f| matches!(f.cause, BrokerError::NotFound(_))));
    assert!(err.to_string().contains("exchange 'ghost'"));
}

#[tokio::test]
async fn delete_removes_reconciled_entities() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let topology = jobs_topology();
    connection.reconcile(&topology).await.unwrap();

    connection.delete_topology(&topology).await.unwrap();

    assert!(!broker.has_exchange("events"));
    assert!(!broker.has_queue("jobs"));
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn apply_yaml_declares_topology() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let yaml = r"
exchanges:
  events:
    type: topic
    durable: true
queues:
  jobs:
    durable: true
    bindings:
      - exchange: events
        key: job.#
  scratch:
";

    let report = connection.apply_yaml(yaml).await.unwrap();

    assert_eq!(report.exchanges_declared, 1);
    assert_eq!(report.queues_declared, 2);
    assert_eq!(report.bindings_applied, 1);
    assert!(broker.has_queue("scratch"));
}

#[tokio::test]
async fn apply_yaml_reports_offending_key() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);

    let err = connection
        .apply_yaml("exchanges:\n  events:\n    type: sideways\n")
        .await
        .unwrap_err();

    match err {
        MqError::Configuration { key, .. } => assert_eq!(key, "exchanges.events"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.stats().exchanges_created, 0);
}

#[tokio::test]
async fn lost_connection_is_a_connectivity_error() {
    let broker = MemoryBroker::new();
    let raw = broker.connect();
    let connection = Connection::new(Arc::clone(&raw) as Arc<dyn BrokerConnection>);
    broker.disconnect();

    let err = connection.reconcile(&jobs_topology()).await.unwrap_err();

    assert!(matches!(err, MqError::Connectivity { .. }));
    assert!(!raw.is_open());
}
