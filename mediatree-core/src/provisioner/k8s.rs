//! Cluster provisioner backed by the Kubernetes pod API
//!
//! The cluster has a fixed set of agents. Injection and egress pods use host
//! networking, so each agent runs at most one of them and exposes it on the
//! agent's pre-assigned API port and WebRTC block. Relay pods float freely and
//! are reached on their pod IP.

use async_trait::async_trait;
use handlebars::Handlebars;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{root_info, rtp_ports, Provisioner, MEDIA_HTTP_PORT, MEDIA_WS_PORT, NODE_API_PORT, ROOT_API_PORT};
use crate::config::{AgentConfig, ImagesConfig, KubernetesConfig};
use crate::models::{now_millis, MediaServerHandle, NodeInfo, NodeKind, NodeRole, NodeSpec, PortRange};
use crate::store::MeshState;
use crate::{Error, Result};

/// Label selector matching pods that pin an agent
const HOST_BOUND_SELECTOR: &str = "app in (injection-pod,egress-pod)";

const INJECTION_POD_TEMPLATE: &str = r#"{
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "name": "{{node_id}}",
    "labels": { "app": "injection-pod", "mediatree/node-id": "{{node_id}}", "mediatree/relay-root-id": "{{relay_root_id}}" }
  },
  "spec": {
    "hostNetwork": true,
    "restartPolicy": "Never",
    "nodeSelector": { "kubernetes.io/hostname": "{{agent}}" },
    "containers": [
      {
        "name": "janus-videoroom",
        "image": "{{media_image}}",
        "env": [
          { "name": "JANUS_RTP_PORT_RANGE", "value": "{{webrtc_range}}" },
          { "name": "JANUS_LOG_LEVEL", "value": "4" }
        ]
      },
      {
        "name": "injection",
        "image": "{{node_image}}",
        "env": [
          { "name": "NODE_ID", "value": "{{node_id}}" },
          { "name": "RELAY_ROOT_ID", "value": "{{relay_root_id}}" },
          { "name": "API_PORT", "value": "{{api_port}}" },
          { "name": "ROOT_API_PORT", "value": "{{root_api_port}}" },
          { "name": "RTP_AUDIO_PORT", "value": "{{rtp_audio}}" },
          { "name": "RTP_VIDEO_PORT", "value": "{{rtp_video}}" },
          { "name": "JANUS_VIDEOROOM_WS_URL", "value": "ws://localhost:{{media_ws_port}}" },
          { "name": "WHIP_BASE_PATH", "value": "/whip" }
        ]
      }
    ]
  }
}"#;

const EGRESS_POD_TEMPLATE: &str = r#"{
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "name": "{{node_id}}",
    "labels": { "app": "egress-pod", "mediatree/node-id": "{{node_id}}" }
  },
  "spec": {
    "hostNetwork": true,
    "restartPolicy": "Never",
    "nodeSelector": { "kubernetes.io/hostname": "{{agent}}" },
    "containers": [
      {
        "name": "janus-streaming",
        "image": "{{media_image}}",
        "env": [
          { "name": "JANUS_RTP_PORT_RANGE", "value": "{{webrtc_range}}" },
          { "name": "JANUS_LOG_LEVEL", "value": "4" }
        ]
      },
      {
        "name": "egress",
        "image": "{{node_image}}",
        "env": [
          { "name": "NODE_ID", "value": "{{node_id}}" },
          { "name": "API_PORT", "value": "{{api_port}}" },
          { "name": "RTP_AUDIO_PORT", "value": "{{rtp_audio}}" },
          { "name": "RTP_VIDEO_PORT", "value": "{{rtp_video}}" },
          { "name": "JANUS_STREAMING_WS_URL", "value": "ws://localhost:{{media_ws_port}}" },
          { "name": "WHEP_BASE_PATH", "value": "/whep" }
        ]
      }
    ]
  }
}"#;

const RELAY_POD_TEMPLATE: &str = r#"{
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "name": "{{node_id}}",
    "labels": { "app": "relay-pod", "mediatree/node-id": "{{node_id}}" }
  },
  "spec": {
    "restartPolicy": "Never",
    "containers": [
      {
        "name": "relay",
        "image": "{{node_image}}",
        "ports": [
          { "containerPort": {{api_port}}, "protocol": "TCP" },
          { "containerPort": {{rtp_audio}}, "protocol": "UDP" },
          { "containerPort": {{rtp_video}}, "protocol": "UDP" }
        ],
        "env": [
          { "name": "NODE_ID", "value": "{{node_id}}" },
          { "name": "API_PORT", "value": "{{api_port}}" },
          { "name": "RTP_AUDIO_PORT", "value": "{{rtp_audio}}" },
          { "name": "RTP_VIDEO_PORT", "value": "{{rtp_video}}" }
        ]
      }
    ]
  }
}"#;

/// The parts of a pod's status the provisioner cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodStatus {
    pub phase: String,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
    pub node_name: Option<String>,
}

impl PodStatus {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase == "Running" && self.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty())
    }
}

/// Pod operations the provisioner depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Agents currently hosting a pod matching `label_selector`
    async fn list_pod_hosts(&self, label_selector: &str) -> Result<Vec<String>>;

    async fn create_pod(&self, manifest: serde_json::Value) -> Result<()>;

    /// `None` when the pod does not exist
    async fn get_pod(&self, name: &str) -> Result<Option<PodStatus>>;

    /// Deleting a missing pod succeeds
    async fn delete_pod(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Default, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodObject>,
}

#[derive(Debug, Default, Deserialize)]
struct PodObject {
    #[serde(default)]
    spec: PodObjectSpec,
    #[serde(default)]
    status: PodObjectStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodObjectSpec {
    node_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodObjectStatus {
    #[serde(default)]
    phase: String,
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(rename = "hostIP")]
    host_ip: Option<String>,
}

/// [`PodApi`] over the Kubernetes REST API
pub struct HttpPodApi {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    token: Option<String>,
}

impl HttpPodApi {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, namespace: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            token,
        }
    }

    /// Build a client from the service account mounted into the controller pod
    pub async fn from_config(config: &KubernetesConfig) -> Result<Self> {
        let token = tokio::fs::read_to_string(&config.token_path)
            .await
            .map_err(|e| Error::Runtime(format!("Failed to read service account token: {e}")))?;

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(ca_path) = &config.ca_cert_path {
            let pem = tokio::fs::read(ca_path)
                .await
                .map_err(|e| Error::Runtime(format!("Failed to read cluster CA: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Runtime(format!("Invalid cluster CA: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Runtime(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self::new(
            client,
            config.api_url.clone(),
            config.namespace.clone(),
            Some(token.trim().to_string()),
        ))
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, self.namespace)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Runtime(format!("{action} failed with {status}: {body}")))
    }
}

#[async_trait]
impl PodApi for HttpPodApi {
    async fn list_pod_hosts(&self, label_selector: &str) -> Result<Vec<String>> {
        let response = self
            .authorize(self.client.get(self.pods_url()))
            .query(&[("labelSelector", label_selector)])
            .send()
            .await?;
        let list: PodList = Self::check(response, "list pods").await?.json().await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| pod.spec.node_name)
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn create_pod(&self, manifest: serde_json::Value) -> Result<()> {
        let response = self
            .authorize(self.client.post(self.pods_url()))
            .json(&manifest)
            .send()
            .await?;
        Self::check(response, "create pod").await?;
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<PodStatus>> {
        let response = self
            .authorize(self.client.get(format!("{}/{name}", self.pods_url())))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let pod: PodObject = Self::check(response, "get pod").await?.json().await?;
        Ok(Some(PodStatus {
            phase: pod.status.phase,
            pod_ip: pod.status.pod_ip,
            host_ip: pod.status.host_ip,
            node_name: pod.spec.node_name,
        }))
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        let response = self
            .authorize(self.client.delete(format!("{}/{name}", self.pods_url())))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, "delete pod").await?;
        Ok(())
    }
}

/// Agent held for the duration of one `create_node` call
struct AgentReservation<'a> {
    reserved: &'a Mutex<HashSet<String>>,
    agent: AgentConfig,
}

impl Drop for AgentReservation<'_> {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.agent.name);
    }
}

pub struct KubernetesProvisioner<P = HttpPodApi> {
    api: P,
    mesh: MeshState,
    config: KubernetesConfig,
    reserved: Mutex<HashSet<String>>,
    templates: Handlebars<'static>,
}

impl<P: PodApi> KubernetesProvisioner<P> {
    pub fn new(api: P, config: KubernetesConfig, mesh: MeshState) -> Result<Self> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        templates.register_escape_fn(handlebars::no_escape);
        for (kind, source) in [
            (NodeKind::Injection, INJECTION_POD_TEMPLATE),
            (NodeKind::Relay, RELAY_POD_TEMPLATE),
            (NodeKind::Egress, EGRESS_POD_TEMPLATE),
        ] {
            templates
                .register_template_string(kind.as_str(), source)
                .map_err(|e| Error::Runtime(format!("Failed to register {kind} pod template: {e}")))?;
        }

        Ok(Self {
            api,
            mesh,
            config,
            reserved: Mutex::new(HashSet::new()),
            templates,
        })
    }

    /// Pick an agent with no host-bound pod and no in-flight reservation
    async fn reserve_agent(&self) -> Result<AgentReservation<'_>> {
        let occupied: HashSet<String> = self
            .api
            .list_pod_hosts(HOST_BOUND_SELECTOR)
            .await?
            .into_iter()
            .collect();

        let mut reserved = self.reserved.lock();
        let agent = self
            .config
            .agents
            .iter()
            .find(|agent| !occupied.contains(&agent.name) && !reserved.contains(&agent.name))
            .cloned()
            .ok_or_else(|| Error::NoCapacity("no physical agents available".to_string()))?;
        reserved.insert(agent.name.clone());
        drop(reserved);

        debug!(agent = %agent.name, "Reserved agent");
        Ok(AgentReservation {
            reserved: &self.reserved,
            agent,
        })
    }

    fn render(&self, spec: &NodeSpec, agent: Option<&AgentConfig>) -> Result<serde_json::Value> {
        let (rtp_audio, rtp_video) = rtp_ports(spec.node_type);
        let ImagesConfig {
            injection,
            relay,
            egress,
            videoroom,
            streaming,
        } = &self.config.images;
        let (node_image, media_image) = match spec.node_type {
            NodeKind::Injection => (injection, videoroom.as_str()),
            NodeKind::Relay => (relay, ""),
            NodeKind::Egress => (egress, streaming.as_str()),
        };

        let data = json!({
            "node_id": spec.node_id,
            "relay_root_id": spec.relay_root_id.clone().unwrap_or_default(),
            "agent": agent.map(|a| a.name.clone()).unwrap_or_default(),
            "api_port": agent.map_or(NODE_API_PORT, |a| a.external_api_port),
            "root_api_port": ROOT_API_PORT,
            "rtp_audio": rtp_audio,
            "rtp_video": rtp_video,
            "media_ws_port": MEDIA_WS_PORT,
            "webrtc_range": agent
                .map(|a| format!("{}-{}", a.webrtc_ports.start, a.webrtc_ports.end))
                .unwrap_or_default(),
            "node_image": node_image,
            "media_image": media_image,
        });

        let rendered = self
            .templates
            .render(spec.node_type.as_str(), &data)
            .map_err(|e| Error::Runtime(format!("Failed to render pod manifest: {e}")))?;
        Ok(serde_json::from_str(&rendered)?)
    }

    /// Poll until the pod is running with an IP or the deadline passes
    async fn wait_ready(&self, name: &str) -> Result<PodStatus> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.ready_timeout_seconds);
        let interval = Duration::from_millis(self.config.ready_poll_interval_ms.max(1));

        loop {
            match self.api.get_pod(name).await {
                Ok(Some(status)) if status.is_ready() => return Ok(status),
                Ok(_) => {}
                Err(e) => debug!(pod = %name, error = %e, "Pod status probe failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "pod {name} failed to become ready within {}s",
                    self.config.ready_timeout_seconds
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn node_info(&self, spec: &NodeSpec, agent: Option<&AgentConfig>, pod: &PodStatus) -> NodeInfo {
        let (rtp_audio, rtp_video) = rtp_ports(spec.node_type);
        let base = NodeInfo {
            node_id: spec.node_id.clone(),
            kind: spec.node_type,
            role: spec.role,
            max_slots: spec.max_slots,
            container_id: spec.node_id.clone(),
            internal_host: pod.pod_ip.clone().unwrap_or_default(),
            internal_api_port: NODE_API_PORT,
            internal_rtp_audio: rtp_audio,
            internal_rtp_video: rtp_video,
            external_host: self.config.public_ip.clone(),
            external_api_port: 0,
            media: None,
            webrtc: None,
            created_at: now_millis(),
        };

        match agent {
            // Host-bound pods are reached through the agent so other agents can route to them
            Some(agent) => NodeInfo {
                internal_host: pod.host_ip.clone().unwrap_or_default(),
                internal_api_port: agent.external_api_port,
                external_api_port: agent.external_api_port,
                media: Some(MediaServerHandle {
                    container_id: spec.node_id.clone(),
                    host: "localhost".to_string(),
                    http_port: MEDIA_HTTP_PORT,
                    ws_port: MEDIA_WS_PORT,
                }),
                webrtc: Some(PortRange {
                    start: agent.webrtc_ports.start,
                    end: agent.webrtc_ports.end,
                }),
                ..base
            },
            None => base,
        }
    }

    async fn persist(&self, spec: &NodeSpec, info: &NodeInfo) -> Result<()> {
        self.mesh.save_node(info).await?;
        if let (NodeKind::Injection, Some(root_id)) = (spec.node_type, &spec.relay_root_id) {
            self.mesh.save_node(&root_info(info, root_id)).await?;
            info!(injection = %info.node_id, root = %root_id, "Persisted injection pair");
        }
        Ok(())
    }

    async fn discard_pod(&self, name: &str) {
        if let Err(e) = self.api.delete_pod(name).await {
            warn!(pod = %name, error = %e, "Failed to delete pod during rollback");
        }
    }
}

#[async_trait]
impl<P: PodApi> Provisioner for KubernetesProvisioner<P> {
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeInfo> {
        info!(node_id = %spec.node_id, kind = %spec.node_type, "Provisioning pod");

        let reservation = if spec.node_type.needs_media_server() {
            Some(self.reserve_agent().await?)
        } else {
            None
        };
        let agent = reservation.as_ref().map(|r| &r.agent);

        let manifest = self.render(spec, agent)?;
        self.api.create_pod(manifest).await?;

        let pod = match self.wait_ready(&spec.node_id).await {
            Ok(pod) => pod,
            Err(e) => {
                self.discard_pod(&spec.node_id).await;
                return Err(e);
            }
        };

        let info = self.node_info(spec, agent, &pod);
        if let Err(e) = self.persist(spec, &info).await {
            self.discard_pod(&spec.node_id).await;
            if let Err(cleanup) = self.mesh.delete_node(&info.node_id).await {
                warn!(node_id = %info.node_id, error = %cleanup, "Failed to delete partial node record");
            }
            return Err(e);
        }

        info!(
            node_id = %info.node_id,
            agent = pod.node_name.as_deref().unwrap_or("-"),
            external_api_port = info.external_api_port,
            "Provisioned pod"
        );
        Ok(info)
    }

    async fn destroy_node(&self, info: &NodeInfo) -> Result<()> {
        if info.role == NodeRole::Root {
            info!(node_id = %info.node_id, "Relay root is virtual, deleting record only");
            return self.mesh.delete_node(&info.node_id).await;
        }

        let pod_result = self.api.delete_pod(&info.node_id).await;
        if let Err(e) = &pod_result {
            warn!(node_id = %info.node_id, error = %e, "Failed to delete pod");
        }
        let record_result = self.mesh.delete_node(&info.node_id).await;

        pod_result.and(record_result)?;
        info!(node_id = %info.node_id, "Pod destroyed");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
