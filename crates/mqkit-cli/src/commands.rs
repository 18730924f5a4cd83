//! Command implementations, independent of argument parsing.

use anyhow::{Context, Result};
use mqkit_client::{
    CancellationToken, Connection, ConsumerConfig, Message, PublisherConfig, ReconcileReport,
    RpcConfig,
};
use mqkit_core::{Publishing, Topology};
use std::path::Path;
use std::time::Duration;

/// Load and validate a topology file.
pub fn load_topology(path: &Path) -> Result<Topology> {
    let topology = Topology::from_yaml_file(path)
        .with_context(|| format!("Failed to load topology from {}", path.display()))?;
    topology
        .validate()
        .with_context(|| format!("Invalid topology in {}", path.display()))?;
    Ok(topology)
}

/// One-line summary of a topology.
pub fn describe(topology: &Topology) -> String {
    format!(
        "{} exchange(s), {} queue(s), {} binding(s)",
        topology.exchanges.len(),
        topology.queues.len(),
        topology.binding_count()
    )
}

/// One-line summary of a reconciliation.
pub fn describe_report(report: &ReconcileReport) -> String {
    if report.is_unchanged() {
        return format!(
            "unchanged: {} exchange(s), {} queue(s) already declared, {} binding(s) applied",
            report.exchanges_existing, report.queues_existing, report.bindings_applied
        );
    }
    format!(
        "declared {} exchange(s) and {} queue(s), {} exchange(s) and {} queue(s) already present, {} binding(s) applied",
        report.exchanges_declared,
        report.queues_declared,
        report.exchanges_existing,
        report.queues_existing,
        report.bindings_applied
    )
}

/// Reconcile the topology in `path` against the broker.
pub async fn apply(connection: &Connection, path: &Path) -> Result<ReconcileReport> {
    let topology = load_topology(path)?;
    connection
        .reconcile(&topology)
        .await
        .context("Failed to reconcile topology")
}

/// Delete every entity named in `path`.
pub async fn delete(connection: &Connection, path: &Path) -> Result<()> {
    let topology = load_topology(path)?;
    connection
        .delete_topology(&topology)
        .await
        .context("Failed to delete topology")
}

/// Publish `text` as a persistent `text/plain` message.
pub async fn publish(
    connection: &Connection,
    exchange: &str,
    routing_key: &str,
    text: &str,
) -> Result<()> {
    let publisher = connection
        .publisher(PublisherConfig::new(exchange).mandatory(true))
        .await
        .context("Failed to open publisher")?;
    let result = publisher
        .send_text(routing_key, text)
        .await
        .context("Failed to publish");
    if let Err(e) = publisher.channel().close().await {
        tracing::warn!(error = %e, "Failed to close publisher channel");
    }
    result
}

/// Send `text` as a request and return the reply body.
pub async fn call(
    connection: &Connection,
    exchange: &str,
    routing_key: &str,
    text: &str,
    timeout: Duration,
) -> Result<String> {
    let client = connection
        .rpc_client(RpcConfig::new(exchange).mandatory(true))
        .await
        .context("Failed to open RPC client")?;
    let result = client
        .call_timeout(routing_key, &Publishing::text(text), timeout)
        .await
        .map(|reply| reply.text().into_owned())
        .with_context(|| format!("No reply for '{routing_key}' within {timeout:?}"));
    if let Err(e) = client.close().await {
        tracing::warn!(error = %e, "Failed to close RPC client");
    }
    result
}

/// Reply to every request on `queue` with its own body until `shutdown`
/// fires.
pub async fn echo(
    connection: &Connection,
    queue: &str,
    consumer_tag: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let handle = connection
        .consumer(ConsumerConfig::new(queue).consumer_tag(consumer_tag))
        .await
        .context("Failed to open consumer")?
        .run(|request: Message| async move {
            if let Err(e) = request.reply(&echo_reply(&request)).await {
                tracing::warn!(error = %e, "Failed to send echo reply");
            }
        })
        .await
        .with_context(|| format!("Failed to consume from '{queue}'"))?;
    tracing::info!(queue, "Echo responder running");

    tokio::select! {
        () = shutdown.cancelled() => {
            handle.close().await.context("Failed to stop consumer")?;
        }
        () = handle.closed() => {
            tracing::warn!(queue, "Consumer stopped by broker");
        }
    }
    handle.join().await.context("Consumer loop failed")
}

fn echo_reply(request: &Message) -> Publishing {
    let properties = request.properties();
    let mut builder = Publishing::builder(request.body().to_vec());
    if let Some(content_type) = &properties.content_type {
        builder = builder.content_type(content_type.clone());
    }
    if let Some(encoding) = &properties.content_encoding {
        builder = builder.content_encoding(encoding.clone());
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqkit_adapter_memory::MemoryBroker;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TOPOLOGY: &str = r#"
exchanges:
  orders:
    type: topic
queues:
  orders.created:
    durable: true
    bindings:
      - exchange: orders
        key: "order.created.#"
"#;

    fn topology_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn validate_summarises_file() {
        let file = topology_file(TOPOLOGY);
        let topology = load_topology(file.path()).unwrap();
        assert_eq!(describe(&topology), "1 exchange(s), 1 queue(s), 1 binding(s)");
    }

    #[test]
    fn validate_rejects_unknown_exchange_type() {
        let file = topology_file("exchanges:\n  orders:\n    type: sideways\n");
        let err = load_topology(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to load topology"));
    }

    #[test]
    fn validate_reports_missing_file() {
        assert!(load_topology(Path::new("/nonexistent/topology.yaml")).is_err());
    }

    #[tokio::test]
    async fn apply_then_delete() {
        let broker = MemoryBroker::new();
        let connection = Connection::new(broker.connect());
        let file = topology_file(TOPOLOGY);

        let report = apply(&connection, file.path()).await.unwrap();
        assert_eq!(report.exchanges_declared, 1);
        assert_eq!(report.queues_declared, 1);
        assert!(broker.has_queue("orders.created"));

        let report = apply(&connection, file.path()).await.unwrap();
        assert!(report.is_unchanged());
        assert!(describe_report(&report).starts_with("unchanged"));

        delete(&connection, file.path()).await.unwrap();
        assert!(!broker.has_exchange("orders"));
        assert!(!broker.has_queue("orders.created"));
    }

    #[tokio::test]
    async fn publish_routes_through_exchange() {
        let broker = MemoryBroker::new();
        let connection = Connection::new(broker.connect());
        let file = topology_file(TOPOLOGY);
        apply(&connection, file.path()).await.unwrap();

        publish(&connection, "orders", "order.created.eu", "hello")
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("orders.created"), 1);

        let err = publish(&connection, "orders", "order.cancelled", "lost")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to publish"));
    }

    #[tokio::test]
    async fn call_gets_echoed_body() {
        let broker = MemoryBroker::new();
        let connection = Connection::new(broker.connect());
        let file = topology_file("queues:\n  echo: {}\n");
        apply(&connection, file.path()).await.unwrap();

        let shutdown = CancellationToken::new();
        let responder = tokio::spawn({
            let connection = connection.clone();
            let shutdown = shutdown.clone();
            async move { echo(&connection, "echo", "", shutdown).await }
        });
        while broker.consumer_count("echo") == 0 {
            tokio::task::yield_now().await;
        }

        let reply = call(&connection, "", "echo", "ping", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, "ping");

        shutdown.cancel();
        responder.await.unwrap().unwrap();
    }
}
