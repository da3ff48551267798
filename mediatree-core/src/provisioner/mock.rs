//! Provisioner that starts nothing
//!
//! Persists node records exactly like the real adapters so the cluster
//! services can run end to end against a [`MemoryStateStore`](crate::store::MemoryStateStore).

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{root_info, rtp_ports, Provisioner, MEDIA_HTTP_PORT, MEDIA_WS_PORT, NODE_API_PORT};
use crate::models::{now_millis, MediaServerHandle, NodeInfo, NodeKind, NodeRole, NodeSpec};
use crate::store::MeshState;
use crate::{Error, Result};

const FIRST_EXTERNAL_PORT: u16 = 9000;

#[derive(Debug, Default)]
struct Calls {
    created: Vec<String>,
    destroyed: Vec<String>,
    next_port: u16,
    fail_create: Option<NodeKind>,
    fail_destroy: bool,
}

pub struct MockProvisioner {
    mesh: MeshState,
    calls: Mutex<Calls>,
}

impl MockProvisioner {
    #[must_use]
    pub fn new(mesh: MeshState) -> Self {
        Self {
            mesh,
            calls: Mutex::new(Calls {
                next_port: FIRST_EXTERNAL_PORT,
                ..Calls::default()
            }),
        }
    }

    /// Node ids passed to `create_node`, in call order
    #[must_use]
    pub fn created(&self) -> Vec<String> {
        self.calls.lock().created.clone()
    }

    /// Node ids passed to `destroy_node`, in call order
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        self.calls.lock().destroyed.clone()
    }

    /// Make every `create_node` for `kind` fail with a runtime error
    pub fn fail_create(&self, kind: Option<NodeKind>) {
        self.calls.lock().fail_create = kind;
    }

    /// Make `destroy_node` fail after deleting the record
    pub fn fail_destroy(&self, fail: bool) {
        self.calls.lock().fail_destroy = fail;
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeInfo> {
        let external_api_port = {
            let mut calls = self.calls.lock();
            calls.created.push(spec.node_id.clone());
            if calls.fail_create == Some(spec.node_type) {
                return Err(Error::Runtime(format!(
                    "simulated failure creating {}",
                    spec.node_id
                )));
            }
            let port = calls.next_port;
            calls.next_port += 1;
            port
        };

        let (rtp_audio, rtp_video) = rtp_ports(spec.node_type);
        let media = spec.node_type.needs_media_server().then(|| MediaServerHandle {
            container_id: format!("mock-{}-media", spec.node_id),
            host: format!("{}-media", spec.node_id),
            http_port: MEDIA_HTTP_PORT,
            ws_port: MEDIA_WS_PORT,
        });
        let info = NodeInfo {
            node_id: spec.node_id.clone(),
            kind: spec.node_type,
            role: spec.role,
            max_slots: spec.max_slots,
            container_id: format!("mock-{}", spec.node_id),
            internal_host: spec.node_id.clone(),
            internal_api_port: NODE_API_PORT,
            internal_rtp_audio: rtp_audio,
            internal_rtp_video: rtp_video,
            external_host: "localhost".to_string(),
            external_api_port,
            media,
            webrtc: None,
            created_at: now_millis(),
        };

        self.mesh.save_node(&info).await?;
        if let (NodeKind::Injection, Some(root_id)) = (spec.node_type, &spec.relay_root_id) {
            self.mesh.save_node(&root_info(&info, root_id)).await?;
        }
        Ok(info)
    }

    async fn destroy_node(&self, info: &NodeInfo) -> Result<()> {
        let fail = {
            let mut calls = self.calls.lock();
            calls.destroyed.push(info.node_id.clone());
            calls.fail_destroy && info.role != NodeRole::Root
        };

        self.mesh.delete_node(&info.node_id).await?;
        if fail {
            return Err(Error::Runtime(format!(
                "simulated failure destroying {}",
                info.node_id
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
