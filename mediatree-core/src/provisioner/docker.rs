//! Single-host provisioner backed by the Docker daemon
//!
//! Injection and egress nodes run as two containers (the media server and the
//! node itself) on a shared bridge network. Relay nodes are a single container.
//! Host ports come from a [`PortAllocator`]; every failure path gives back the
//! containers and leases acquired so far, in reverse order.

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::port_allocator::{PortAllocator, PortAllocatorStats};
use super::{
    root_info, rtp_ports, Provisioner, MEDIA_HTTP_PORT, MEDIA_WS_PORT, NODE_API_PORT,
};
use crate::config::DockerConfig;
use crate::models::{now_millis, MediaServerHandle, NodeInfo, NodeKind, NodeRole, NodeSpec, PortRange};
use crate::store::MeshState;
use crate::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Everything needed to start one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name, also used as its hostname on the network
    pub name: String,
    pub image: String,
    pub network: String,
    pub env: Vec<(String, String)>,
    pub cpus: f64,
    pub memory_mb: u64,
    /// `(host, container)` TCP port mappings
    pub tcp_ports: Vec<(u16, u16)>,
    /// UDP block published one-to-one on the host
    pub udp_range: Option<PortRange>,
}

impl ContainerSpec {
    #[must_use]
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn port_bindings(&self) -> HashMap<String, Option<Vec<PortBinding>>> {
        let binding = |host: u16| {
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host.to_string()),
            }])
        };

        let mut bindings: HashMap<_, _> = self
            .tcp_ports
            .iter()
            .map(|(host, container)| (format!("{container}/tcp"), binding(*host)))
            .collect();
        if let Some(range) = self.udp_range {
            for port in range.start..=range.end {
                bindings.insert(format!("{port}/udp"), binding(port));
            }
        }
        bindings
    }
}

/// Minimal container runtime the docker provisioner depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning its id
    async fn run(&self, spec: ContainerSpec) -> Result<String>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    /// Stop with a grace period. Stopping a missing container succeeds.
    async fn stop(&self, name: &str, grace: Duration) -> Result<()>;

    /// Force-remove. Removing a missing container succeeds.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// [`ContainerRuntime`] over the local Docker daemon
pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Runtime(format!("Failed to connect to Docker daemon: {e}")))?;
        Ok(Self { docker })
    }

    #[must_use]
    pub const fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn is_missing(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 304,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn run(&self, spec: ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            memory: i64::try_from(spec.memory_mb * 1_048_576).ok(),
            nano_cpus: Some((spec.cpus * 1_000_000_000.0) as i64),
            network_mode: Some(spec.network.clone()),
            port_bindings: Some(spec.port_bindings()),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(spec.name.clone()),
                    platform: String::new(),
                }),
                body,
            )
            .await
            .map_err(|e| Error::Runtime(format!("Failed to create container '{}': {e}", spec.name)))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| Error::Runtime(format!("Failed to start container '{}': {e}", spec.name)))?;

        debug!(container = %spec.name, id = %created.id, "Container started");
        Ok(created.id)
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        Ok(inspect
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: i32::try_from(grace.as_secs()).ok(),
            ..Default::default()
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Host ports leased for a node with a media server
#[derive(Debug, Clone, Copy)]
struct MediaLeases {
    api: u16,
    http: u16,
    ws: u16,
    webrtc: PortRange,
}

impl MediaLeases {
    fn release(self, ports: &PortAllocator) {
        ports.release(self.api);
        ports.release(self.http);
        ports.release(self.ws);
        ports.release_range(self.webrtc);
    }
}

/// Flavour of media server paired with a node
#[derive(Debug, Clone, Copy)]
enum MediaFlavor {
    Videoroom,
    Streaming,
}

impl MediaFlavor {
    const fn for_kind(kind: NodeKind) -> Option<Self> {
        match kind {
            NodeKind::Injection => Some(Self::Videoroom),
            NodeKind::Egress => Some(Self::Streaming),
            NodeKind::Relay => None,
        }
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::Videoroom => "janus-vr",
            Self::Streaming => "janus-streaming",
        }
    }
}

pub struct DockerProvisioner<R = BollardRuntime> {
    runtime: R,
    ports: PortAllocator,
    mesh: MeshState,
    config: DockerConfig,
}

impl DockerProvisioner<BollardRuntime> {
    pub fn connect(config: DockerConfig, mesh: MeshState) -> Result<Self> {
        Ok(Self::new(BollardRuntime::connect()?, config, mesh))
    }
}

impl<R: ContainerRuntime> DockerProvisioner<R> {
    #[must_use]
    pub fn new(runtime: R, config: DockerConfig, mesh: MeshState) -> Self {
        Self {
            runtime,
            ports: PortAllocator::from_config(&config),
            mesh,
            config,
        }
    }

    #[must_use]
    pub fn port_stats(&self) -> PortAllocatorStats {
        self.ports.stats()
    }

    fn container(&self, name: &str, image: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            network: self.config.network.clone(),
            env: Vec::new(),
            cpus: self.config.cpus,
            memory_mb: self.config.memory_mb,
            tcp_ports: Vec::new(),
            udp_range: None,
        }
    }

    fn redis_env(&self) -> [(String, String); 2] {
        [
            ("REDIS_HOST".to_string(), self.config.node_redis_host.clone()),
            ("REDIS_PORT".to_string(), self.config.node_redis_port.to_string()),
        ]
    }

    /// Start a container and wait until the daemon reports it running
    async fn start(&self, spec: ContainerSpec) -> Result<String> {
        let name = spec.name.clone();
        let id = self.runtime.run(spec).await?;

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.startup_timeout_seconds);
        loop {
            match tokio::time::timeout(PROBE_TIMEOUT, self.runtime.is_running(&name)).await {
                Ok(Ok(true)) => return Ok(id),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => debug!(container = %name, error = %e, "Readiness probe failed"),
                Err(_) => debug!(container = %name, "Readiness probe timed out"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Runtime(format!(
                    "container '{name}' not running after {}s",
                    self.config.startup_timeout_seconds
                )));
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Stop and remove, logging instead of failing
    async fn teardown(&self, name: &str) -> Result<()> {
        if let Err(e) = self.runtime.stop(name, STOP_GRACE).await {
            warn!(container = %name, error = %e, "Failed to stop container");
        }
        self.runtime.remove(name).await.inspect_err(|e| {
            warn!(container = %name, error = %e, "Failed to remove container");
        })
    }

    fn lease_media_ports(&self) -> Result<MediaLeases> {
        let api = self.ports.allocate_api()?;
        let (http, ws) = match self.ports.allocate_media_pair() {
            Ok(pair) => pair,
            Err(e) => {
                self.ports.release(api);
                return Err(e);
            }
        };
        match self.ports.allocate_block() {
            Ok(webrtc) => Ok(MediaLeases { api, http, ws, webrtc }),
            Err(e) => {
                self.ports.release(api);
                self.ports.release(http);
                self.ports.release(ws);
                Err(e)
            }
        }
    }

    async fn create_media_node(&self, spec: &NodeSpec, flavor: MediaFlavor) -> Result<NodeInfo> {
        let leases = self.lease_media_ports()?;
        let MediaLeases {
            api: api_port,
            http: http_port,
            ws: ws_port,
            webrtc,
        } = leases;

        let media_name = format!("{}-{}", spec.node_id, flavor.suffix());
        let images = &self.config.images;
        let media_image = match flavor {
            MediaFlavor::Videoroom => &images.videoroom,
            MediaFlavor::Streaming => &images.streaming,
        };

        let mut media = self.container(&media_name, media_image);
        media.env = vec![
            ("JANUS_RTP_PORT_RANGE".to_string(), webrtc.to_string()),
            ("JANUS_LOG_LEVEL".to_string(), "4".to_string()),
        ];
        media.tcp_ports = vec![(http_port, MEDIA_HTTP_PORT), (ws_port, MEDIA_WS_PORT)];
        media.udp_range = Some(webrtc);

        let media_id = match self.start(media).await {
            Ok(id) => id,
            Err(e) => {
                error!(node_id = %spec.node_id, error = %e, "Media server failed to start");
                let _ = self.teardown(&media_name).await;
                leases.release(&self.ports);
                return Err(e);
            }
        };

        let (rtp_audio, rtp_video) = rtp_ports(spec.node_type);
        let ws_url = format!("ws://{media_name}:{MEDIA_WS_PORT}");
        let (app_image, ws_var, base_var, base_path) = match flavor {
            MediaFlavor::Videoroom => (&images.injection, "JANUS_VIDEOROOM_WS_URL", "WHIP_BASE_PATH", "/whip"),
            MediaFlavor::Streaming => (&images.egress, "JANUS_STREAMING_WS_URL", "WHEP_BASE_PATH", "/whep"),
        };

        let mut app = self.container(&spec.node_id, app_image);
        app.env = vec![
            ("NODE_ID".to_string(), spec.node_id.clone()),
            ("NODE_HOST".to_string(), spec.node_id.clone()),
            ("API_PORT".to_string(), NODE_API_PORT.to_string()),
            ("RTP_AUDIO_PORT".to_string(), rtp_audio.to_string()),
            ("RTP_VIDEO_PORT".to_string(), rtp_video.to_string()),
            (ws_var.to_string(), ws_url),
            (base_var.to_string(), base_path.to_string()),
        ];
        app.env.extend(self.redis_env());
        app.tcp_ports = vec![(api_port, NODE_API_PORT)];

        let container_id = match self.start(app).await {
            Ok(id) => id,
            Err(e) => {
                error!(node_id = %spec.node_id, error = %e, "Node container failed to start, rolling back");
                let _ = self.teardown(&spec.node_id).await;
                let _ = self.teardown(&media_name).await;
                leases.release(&self.ports);
                return Err(e);
            }
        };

        let info = NodeInfo {
            node_id: spec.node_id.clone(),
            kind: spec.node_type,
            role: spec.role,
            max_slots: spec.max_slots,
            container_id,
            internal_host: spec.node_id.clone(),
            internal_api_port: NODE_API_PORT,
            internal_rtp_audio: rtp_audio,
            internal_rtp_video: rtp_video,
            external_host: self.config.external_host.clone(),
            external_api_port: api_port,
            media: Some(MediaServerHandle {
                container_id: media_id,
                host: media_name.clone(),
                http_port,
                ws_port,
            }),
            webrtc: Some(webrtc),
            created_at: now_millis(),
        };

        if let Err(e) = self.persist(spec, &info).await {
            warn!(node_id = %spec.node_id, error = %e, "Failed to persist node, rolling back");
            let _ = self.teardown(&spec.node_id).await;
            let _ = self.teardown(&media_name).await;
            leases.release(&self.ports);
            return Err(e);
        }

        info!(
            node_id = %info.node_id,
            kind = %info.kind,
            api_port,
            webrtc = %webrtc,
            "Provisioned node"
        );
        Ok(info)
    }

    async fn create_relay(&self, spec: &NodeSpec) -> Result<NodeInfo> {
        let api_port = self.ports.allocate_api()?;
        let (rtp_audio, rtp_video) = rtp_ports(NodeKind::Relay);

        let mut relay = self.container(&spec.node_id, &self.config.images.relay);
        relay.env = vec![
            ("NODE_ID".to_string(), spec.node_id.clone()),
            ("NODE_HOST".to_string(), spec.node_id.clone()),
            ("API_PORT".to_string(), api_port.to_string()),
            ("RTP_AUDIO_PORT".to_string(), rtp_audio.to_string()),
            ("RTP_VIDEO_PORT".to_string(), rtp_video.to_string()),
        ];
        relay.env.extend(self.redis_env());
        relay.tcp_ports = vec![(api_port, api_port)];

        let container_id = match self.start(relay).await {
            Ok(id) => id,
            Err(e) => {
                error!(node_id = %spec.node_id, error = %e, "Relay failed to start");
                let _ = self.teardown(&spec.node_id).await;
                self.ports.release(api_port);
                return Err(e);
            }
        };

        let info = NodeInfo {
            node_id: spec.node_id.clone(),
            kind: NodeKind::Relay,
            role: spec.role,
            max_slots: spec.max_slots,
            container_id,
            internal_host: spec.node_id.clone(),
            internal_api_port: api_port,
            internal_rtp_audio: rtp_audio,
            internal_rtp_video: rtp_video,
            external_host: self.config.external_host.clone(),
            external_api_port: api_port,
            media: None,
            webrtc: None,
            created_at: now_millis(),
        };

        if let Err(e) = self.persist(spec, &info).await {
            warn!(node_id = %spec.node_id, error = %e, "Failed to persist relay, rolling back");
            let _ = self.teardown(&spec.node_id).await;
            self.ports.release(api_port);
            return Err(e);
        }

        info!(node_id = %info.node_id, api_port, "Provisioned relay");
        Ok(info)
    }

    /// Save the node record, plus the paired root record for an injection
    async fn persist(&self, spec: &NodeSpec, info: &NodeInfo) -> Result<()> {
        self.mesh.save_node(info).await?;
        if let (NodeKind::Injection, Some(root_id)) = (spec.node_type, &spec.relay_root_id) {
            if let Err(e) = self.mesh.save_node(&root_info(info, root_id)).await {
                if let Err(cleanup) = self.mesh.delete_node(&info.node_id).await {
                    warn!(node_id = %info.node_id, error = %cleanup, "Failed to delete partial node record");
                }
                return Err(e);
            }
            info!(injection = %info.node_id, root = %root_id, "Persisted injection pair");
        }
        Ok(())
    }
}

#[async_trait]
impl<R: ContainerRuntime> Provisioner for DockerProvisioner<R> {
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeInfo> {
        info!(node_id = %spec.node_id, kind = %spec.node_type, "Provisioning node");
        match MediaFlavor::for_kind(spec.node_type) {
            Some(flavor) => self.create_media_node(spec, flavor).await,
            None => self.create_relay(spec).await,
        }
    }

    async fn destroy_node(&self, info: &NodeInfo) -> Result<()> {
        if info.role == NodeRole::Root {
            info!(node_id = %info.node_id, "Relay root shares its injection container, deleting record only");
            return self.mesh.delete_node(&info.node_id).await;
        }

        info!(node_id = %info.node_id, "Destroying node");
        let mut first_error = self.teardown(&info.node_id).await.err();

        if let Some(media) = &info.media {
            if let Err(e) = self.teardown(&media.host).await {
                first_error.get_or_insert(e);
            }
            self.ports.release(media.http_port);
            self.ports.release(media.ws_port);
        }
        if info.external_api_port > 0 {
            self.ports.release(info.external_api_port);
        }
        if let Some(range) = info.webrtc {
            self.ports.release_range(range);
        }

        if let Err(e) = self.mesh.delete_node(&info.node_id).await {
            warn!(node_id = %info.node_id, error = %e, "Failed to delete node record");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(node_id = %info.node_id, "Node destroyed");
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
