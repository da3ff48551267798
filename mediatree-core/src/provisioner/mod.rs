//! Compute provisioning
//!
//! A [`Provisioner`] turns a [`NodeSpec`] into a running container (or pod)
//! plus a persisted [`NodeInfo`] record. Two adapters ship with the crate:
//! [`DockerProvisioner`] for a single host and [`KubernetesProvisioner`] for a
//! fixed set of cluster agents. [`MockProvisioner`] only touches the store.

pub mod docker;
pub mod k8s;
pub mod mock;
pub mod port_allocator;

use async_trait::async_trait;

use crate::models::{now_millis, NodeInfo, NodeKind, NodeRole, NodeSpec};
use crate::Result;

pub use self::docker::{BollardRuntime, ContainerRuntime, ContainerSpec, DockerProvisioner};
pub use self::k8s::{HttpPodApi, KubernetesProvisioner, PodApi, PodStatus};
pub use self::mock::MockProvisioner;
pub use self::port_allocator::{PortAllocator, PortAllocatorStats};

/// Control API port inside every node container
pub const NODE_API_PORT: u16 = 7070;
/// Control API port of the relay root sharing an injection container
pub const ROOT_API_PORT: u16 = 7071;
/// Media server HTTP port inside its container
pub const MEDIA_HTTP_PORT: u16 = 8088;
/// Media server WebSocket port inside its container
pub const MEDIA_WS_PORT: u16 = 8188;

/// RTP ports a node listens on, by kind
#[must_use]
pub const fn rtp_ports(kind: NodeKind) -> (u16, u16) {
    match kind {
        NodeKind::Injection => (5000, 5002),
        NodeKind::Relay | NodeKind::Egress => (5002, 5004),
    }
}

/// Compute backend for mesh nodes
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start the node's containers and persist its record
    ///
    /// When `spec.relay_root_id` is set on an injection, the paired root's
    /// record is persisted as well.
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeInfo>;

    /// Stop everything the node owns and delete its record
    ///
    /// Idempotent. Every allocated resource is released even when a step
    /// fails along the way.
    async fn destroy_node(&self, info: &NodeInfo) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Record of the relay root living inside an injection's container
#[must_use]
pub fn root_info(injection: &NodeInfo, root_id: &str) -> NodeInfo {
    let (audio, video) = rtp_ports(NodeKind::Relay);
    NodeInfo {
        node_id: root_id.to_string(),
        kind: NodeKind::Relay,
        role: NodeRole::Root,
        max_slots: injection.max_slots,
        container_id: injection.container_id.clone(),
        internal_host: injection.internal_host.clone(),
        internal_api_port: ROOT_API_PORT,
        internal_rtp_audio: audio,
        internal_rtp_video: video,
        external_host: injection.external_host.clone(),
        external_api_port: 0,
        media: None,
        webrtc: None,
        created_at: now_millis(),
    }
}
