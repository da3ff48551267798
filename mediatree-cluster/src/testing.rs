//! Fixtures shared by the cluster tests

use std::sync::Arc;

use mediatree_core::models::{MetricKind, NodeInfo, NodeKind, NodeSpec};
use mediatree_core::provisioner::MockProvisioner;
use mediatree_core::store::MemoryStateStore;
use mediatree_core::{MeshState, Provisioner};

pub fn mesh() -> (MeshState, MemoryStateStore) {
    let store = MemoryStateStore::new();
    (MeshState::new(Arc::new(store.clone())), store)
}

/// Persist and pool a node without any topology
pub async fn add_node(mesh: &MeshState, node_id: &str, kind: NodeKind) -> NodeInfo {
    let info = MockProvisioner::new(mesh.clone())
        .create_node(&NodeSpec::new(node_id, kind, 10))
        .await
        .unwrap();
    mesh.register_in_pool(kind, node_id).await.unwrap();
    info
}

/// Persist and pool an injection with its linked relay root
pub async fn add_injection(mesh: &MeshState, injection_id: &str, root_id: &str) -> NodeInfo {
    let info = MockProvisioner::new(mesh.clone())
        .create_node(&NodeSpec::new(injection_id, NodeKind::Injection, 10).with_relay_root(root_id))
        .await
        .unwrap();
    mesh.register_in_pool(NodeKind::Injection, injection_id).await.unwrap();
    mesh.register_in_pool(NodeKind::Relay, root_id).await.unwrap();
    mesh.link(injection_id, root_id).await.unwrap();
    info
}

/// Pool an egress (or relay) and hang it under `parent_id`
pub async fn add_child(mesh: &MeshState, parent_id: &str, node_id: &str, kind: NodeKind) -> NodeInfo {
    let info = add_node(mesh, node_id, kind).await;
    mesh.link(parent_id, node_id).await.unwrap();
    info
}

/// `inj-1 -> relay-root-1 -> eg-1`
pub async fn single_branch(mesh: &MeshState) {
    add_injection(mesh, "inj-1", "relay-root-1").await;
    add_child(mesh, "relay-root-1", "eg-1", NodeKind::Egress).await;
}

pub async fn record(mesh: &MeshState, node_id: &str, kind: MetricKind, fields: &[(&str, f64)]) {
    let fields: Vec<(String, String)> = fields
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.to_string()))
        .collect();
    mesh.record_metrics(node_id, kind, &fields).await.unwrap();
}
