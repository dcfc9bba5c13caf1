//! End-to-end provisioning scenarios against a scripted machine backend.

use morpheus_machine::MachineProvider;
use morpheus_proto::{ForestStatus, LABEL_FOREST_ID};
use morpheus_provision::{ProvisionError, ProvisionRequest, Provisioner, ProvisionerConfig};
use morpheus_registry::{ForestRegistry, RegistryError};
use morpheus_tests::{closed_port, open_port, StubProvider};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Opt-in log output for debugging: `RUST_LOG=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn request(forest_id: &str, size: &str) -> ProvisionRequest {
    ProvisionRequest {
        forest_id: forest_id.to_string(),
        size: size.to_string(),
        location: None,
        role: "worker".to_string(),
        server_type: Some("cx22".to_string()),
        image: None,
    }
}

fn config(ssh_port: u16, timeout: Duration, interval: Duration) -> ProvisionerConfig {
    ProvisionerConfig {
        ssh_port,
        readiness_timeout: timeout,
        readiness_interval: interval,
        connect_timeout: Duration::from_millis(500),
        ..ProvisionerConfig::default()
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn small_forest_on_stub_backend() {
    init_tracing();
    let (_listener, port) = open_port().await;
    let provider = Arc::new(StubProvider::new("127.0.0.1".parse().unwrap()));
    let registry = Arc::new(ForestRegistry::in_memory());
    let provisioner = Provisioner::new(
        provider.clone(),
        registry.clone(),
        config(port, Duration::from_secs(2), Duration::from_millis(50)),
    );

    let forest = provisioner
        .provision(&CancellationToken::new(), &request("f1", "small"))
        .await
        .expect("provision");
    assert_eq!(forest.status, ForestStatus::Active);

    let stored = registry.get_forest("f1").expect("forest");
    assert_eq!(stored.status, ForestStatus::Active);
    // Location is the one observed on the backend, not the requested one.
    assert_eq!(stored.location, "stub-dc");

    let nodes = registry.get_nodes("f1").expect("nodes");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].forest_id, "f1");
    assert!(nodes[0].created_at >= stored.created_at);
}

#[tokio::test]
async fn rollback_on_second_node_failure() {
    let (_listener, port) = open_port().await;
    let provider = Arc::new(StubProvider::failing_on("127.0.0.1".parse().unwrap(), 2));
    let registry = Arc::new(ForestRegistry::in_memory());
    let provisioner = Provisioner::new(
        provider.clone(),
        registry.clone(),
        config(port, Duration::from_secs(2), Duration::from_millis(50)),
    );

    let err = provisioner
        .provision(&CancellationToken::new(), &request("f1", "medium"))
        .await
        .unwrap_err();

    // The caller receives the original failure cause.
    assert!(err.to_string().contains("scripted create failure on call 2"), "{err}");

    // Node 1 was deleted during rollback and the registry holds no trace.
    assert_eq!(provider.deleted.lock().as_slice(), ["srv-1"]);
    assert!(matches!(
        registry.get_forest("f1"),
        Err(RegistryError::ForestNotFound(_))
    ));

    // Rollback completeness: no server labelled with the forest id survives.
    let mut filter = HashMap::new();
    filter.insert(LABEL_FOREST_ID.to_string(), "f1".to_string());
    assert!(provider.list_servers(&filter).await.expect("list").is_empty());
}

#[tokio::test]
async fn readiness_timeout_bounds() {
    let port = closed_port().await;
    let provider = Arc::new(StubProvider::new("::1".parse().unwrap()));
    let registry = Arc::new(ForestRegistry::in_memory());
    let provisioner = Provisioner::new(
        provider.clone(),
        registry.clone(),
        config(port, Duration::from_millis(500), Duration::from_millis(100)),
    );

    let started = std::time::Instant::now();
    let err = provisioner
        .provision(&CancellationToken::new(), &request("f1", "small"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ProvisionError::ReadinessTimeout { .. }), "{err}");
    assert!(elapsed >= Duration::from_millis(400), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1200), "too slow: {elapsed:?}");

    // The unreachable server was rolled back.
    assert_eq!(provider.deleted.lock().as_slice(), ["srv-1"]);
    assert!(registry.get_forest("f1").is_err());
}

#[tokio::test]
async fn cancellation_during_readiness_rolls_back() {
    let port = closed_port().await;
    let provider = Arc::new(StubProvider::new("::1".parse().unwrap()));
    let registry = Arc::new(ForestRegistry::in_memory());
    let provisioner = Provisioner::new(
        provider.clone(),
        registry.clone(),
        config(port, Duration::from_secs(30), Duration::from_millis(100)),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = provisioner
        .provision(&cancel, &request("f1", "small"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Cancelled), "{err}");
    assert_eq!(provider.deleted.lock().as_slice(), ["srv-1"]);
    assert!(registry.get_forest("f1").is_err());
}

#[tokio::test]
async fn teardown_removes_nodes_and_forest() {
    let (_listener, port) = open_port().await;
    let provider = Arc::new(StubProvider::new("127.0.0.1".parse().unwrap()));
    let registry = Arc::new(ForestRegistry::in_memory());
    let provisioner = Provisioner::new(
        provider.clone(),
        registry.clone(),
        config(port, Duration::from_secs(2), Duration::from_millis(50)),
    );

    provisioner
        .provision(&CancellationToken::new(), &request("f1", "medium"))
        .await
        .expect("provision");
    assert_eq!(registry.get_nodes("f1").expect("nodes").len(), 3);

    provisioner.teardown("f1").await.expect("teardown");
    assert!(registry.get_forest("f1").is_err());
    assert_eq!(provider.deleted.lock().len(), 3);

    // Idempotent at the forest level.
    provisioner.teardown("f1").await.expect("second teardown");
}

#[tokio::test]
async fn duplicate_forest_id_rejected_without_side_effects() {
    let (_listener, port) = open_port().await;
    let provider = Arc::new(StubProvider::new("127.0.0.1".parse().unwrap()));
    let registry = Arc::new(ForestRegistry::in_memory());
    let provisioner = Provisioner::new(
        provider.clone(),
        registry.clone(),
        config(port, Duration::from_secs(2), Duration::from_millis(50)),
    );

    provisioner
        .provision(&CancellationToken::new(), &request("f1", "small"))
        .await
        .expect("provision");
    let err = provisioner
        .provision(&CancellationToken::new(), &request("f1", "small"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::Registry(RegistryError::DuplicateForest(_))
    ));
    // The first forest is untouched.
    assert_eq!(registry.get_nodes("f1").expect("nodes").len(), 1);
}
