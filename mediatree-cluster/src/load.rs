//! Load normalisation
//!
//! Each calculator maps raw container metrics onto 0-100, where 100 is the
//! configured hardware or logical limit, and combines factors with `max` so
//! the worst factor wins. Missing samples read as zero. A store failure reads
//! as full load, which keeps an outage from looking like spare capacity.

use serde::Serialize;
use tracing::warn;

use mediatree_core::config::LoadConfig;
use mediatree_core::models::{MetricKind, NodeKind, NodeStatus};
use mediatree_core::{Error, MeshState, Result};

/// Load reported when the inputs cannot be read
pub const FULL_LOAD: f64 = 100.0;

/// Aggregate view of the injection pool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionPoolReport {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub healthy_nodes: usize,
    /// Free admission slots summed over healthy active nodes
    pub total_available_slots: u64,
    /// Mean of the injection/root worst case over active nodes
    pub avg_hardware_load: f64,
}

/// Aggregate view of the egress pool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressPoolReport {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub saturated_nodes: usize,
    pub total_viewers: u64,
    pub free_viewer_slots: u64,
    pub avg_load: f64,
}

#[derive(Clone)]
pub struct LoadCalculator {
    mesh: MeshState,
    limits: LoadConfig,
}

impl LoadCalculator {
    #[must_use]
    pub const fn new(mesh: MeshState, limits: LoadConfig) -> Self {
        Self { mesh, limits }
    }

    #[must_use]
    pub const fn limits(&self) -> &LoadConfig {
        &self.limits
    }

    fn cpu_load(&self, cpu_percent: f64) -> f64 {
        cpu_percent / self.limits.cpu_limit_percent * 100.0
    }

    /// Load of any node, `FULL_LOAD` when it cannot be computed
    pub async fn load(&self, kind: NodeKind, node_id: &str) -> f64 {
        let result = match kind {
            NodeKind::Injection => self.injection_load(node_id).await,
            NodeKind::Relay => self.relay_load(node_id).await,
            NodeKind::Egress => self.egress_load(node_id).await,
        };

        result.unwrap_or_else(|e| {
            warn!(node_id = %node_id, kind = %kind, error = %e, "Load unavailable, assuming full load");
            FULL_LOAD
        })
    }

    /// Below the health limit
    pub async fn is_healthy(&self, kind: NodeKind, node_id: &str) -> bool {
        self.load(kind, node_id).await < self.limits.health_limit
    }

    /// `max(injection hardware, relay root load)`
    ///
    /// The root is the injection's first child; an injection without one is
    /// a broken topology.
    pub async fn injection_load(&self, node_id: &str) -> Result<f64> {
        let app = self.mesh.metrics(node_id, MetricKind::Nodejs).await?;
        let media = self.mesh.metrics(node_id, MetricKind::JanusVideoroom).await?;
        let hardware = self.cpu_load(app.cpu_percent.max(media.cpu_percent));

        let root = self
            .mesh
            .children(node_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::TopologyBroken(format!("injection {node_id} has no relay root")))?;

        Ok(hardware.max(self.relay_load(&root).await?))
    }

    pub async fn relay_load(&self, node_id: &str) -> Result<f64> {
        let app = self.mesh.metrics(node_id, MetricKind::Nodejs).await?;
        let pipeline = self.mesh.metrics(node_id, MetricKind::Gstreamer).await?;
        let queue_ms = pipeline.max_audio_queue_ms.max(pipeline.max_video_queue_ms);

        Ok(self
            .cpu_load(app.cpu_percent)
            .max(queue_ms / self.limits.queue_limit_ms * 100.0))
    }

    pub async fn egress_load(&self, node_id: &str) -> Result<f64> {
        let app = self.mesh.metrics(node_id, MetricKind::Nodejs).await?;
        let media = self.mesh.metrics(node_id, MetricKind::JanusStreaming).await?;

        let viewers = media.janus_total_viewers / f64::from(self.limits.egress_max_viewers) * 100.0;
        let mountpoints =
            media.janus_mountpoints_active / f64::from(self.limits.egress_max_sessions) * 100.0;

        Ok(self
            .cpu_load(app.cpu_percent)
            .max(self.cpu_load(media.cpu_percent))
            .max(viewers)
            .max(mountpoints))
    }

    /// Viewers currently attached to an egress's streaming server
    pub async fn egress_viewers(&self, node_id: &str) -> Result<u32> {
        let media = self.mesh.metrics(node_id, MetricKind::JanusStreaming).await?;
        Ok(media.janus_total_viewers.max(0.0) as u32)
    }

    pub async fn injection_pool_report(&self) -> Result<InjectionPoolReport> {
        let members = self.mesh.pool_members(NodeKind::Injection).await?;
        let mut report = InjectionPoolReport {
            total_nodes: members.len(),
            ..InjectionPoolReport::default()
        };
        let mut load_sum = 0.0;

        for node_id in &members {
            if self.mesh.node_status(node_id).await? != Some(NodeStatus::Active) {
                continue;
            }
            report.active_nodes += 1;

            let load = self.load(NodeKind::Injection, node_id).await;
            load_sum += load;
            if load >= self.limits.health_limit {
                continue;
            }
            report.healthy_nodes += 1;

            let max_slots = self
                .mesh
                .find_node(node_id)
                .await?
                .map_or(0.0, |info| f64::from(info.max_slots));
            let used = self.mesh.used_slots(NodeKind::Injection, node_id).await?;
            report.total_available_slots += (max_slots - used).max(0.0) as u64;
        }

        if report.active_nodes > 0 {
            report.avg_hardware_load = load_sum / report.active_nodes as f64;
        }
        Ok(report)
    }

    /// A node counts as saturated once its viewers reach the accept threshold
    /// share of the cap, or its load reaches the health limit
    pub async fn egress_pool_report(&self) -> Result<EgressPoolReport> {
        let members = self.mesh.pool_members(NodeKind::Egress).await?;
        let mut report = EgressPoolReport {
            total_nodes: members.len(),
            ..EgressPoolReport::default()
        };
        let max_viewers = u64::from(self.limits.egress_max_viewers);
        let saturation_viewers =
            f64::from(self.limits.egress_max_viewers) * self.limits.viewer_accept_load / 100.0;
        let mut load_sum = 0.0;

        for node_id in &members {
            if self.mesh.node_status(node_id).await? != Some(NodeStatus::Active) {
                continue;
            }
            report.active_nodes += 1;

            let load = self.load(NodeKind::Egress, node_id).await;
            let viewers = u64::from(self.egress_viewers(node_id).await?);
            load_sum += load;
            report.total_viewers += viewers;
            report.free_viewer_slots += max_viewers.saturating_sub(viewers);

            if viewers as f64 >= saturation_viewers || load >= self.limits.health_limit {
                report.saturated_nodes += 1;
            }
        }

        if report.active_nodes > 0 {
            report.avg_load = load_sum / report.active_nodes as f64;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_injection, add_node, mesh, record};

    fn calculator(mesh: &MeshState) -> LoadCalculator {
        LoadCalculator::new(mesh.clone(), LoadConfig::default())
    }

    fn approx(actual: f64, expected: f64) -> bool {
        (actual - expected).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_relay_takes_worst_factor() {
        let (mesh, _) = mesh();
        let loads = calculator(&mesh);

        assert!(approx(loads.relay_load("relay-1").await.unwrap(), 0.0));

        record(&mesh, "relay-1", MetricKind::Nodejs, &[("cpuPercent", 40.0)]).await;
        record(
            &mesh,
            "relay-1",
            MetricKind::Gstreamer,
            &[("maxAudioQueueMs", 20.0), ("maxVideoQueueMs", 150.0)],
        )
        .await;
        assert!(approx(loads.relay_load("relay-1").await.unwrap(), 75.0));
    }

    #[tokio::test]
    async fn test_injection_includes_relay_root() {
        let (mesh, _) = mesh();
        add_injection(&mesh, "inj-1", "relay-root-1").await;
        let loads = calculator(&mesh);

        record(&mesh, "inj-1", MetricKind::Nodejs, &[("cpuPercent", 20.0)]).await;
        record(&mesh, "inj-1", MetricKind::JanusVideoroom, &[("cpuPercent", 40.0)]).await;
        assert!(approx(loads.injection_load("inj-1").await.unwrap(), 50.0));

        record(&mesh, "relay-root-1", MetricKind::Gstreamer, &[("maxVideoQueueMs", 180.0)]).await;
        assert!(approx(loads.injection_load("inj-1").await.unwrap(), 90.0));
        assert!(loads.is_healthy(NodeKind::Injection, "inj-1").await);
    }

    #[tokio::test]
    async fn test_injection_without_root_is_full() {
        let (mesh, _) = mesh();
        add_node(&mesh, "inj-1", NodeKind::Injection).await;
        let loads = calculator(&mesh);

        assert!(matches!(
            loads.injection_load("inj-1").await,
            Err(Error::TopologyBroken(_))
        ));
        assert!(approx(loads.load(NodeKind::Injection, "inj-1").await, FULL_LOAD));
        assert!(!loads.is_healthy(NodeKind::Injection, "inj-1").await);
    }

    #[tokio::test]
    async fn test_store_failure_reads_as_full_load() {
        let (mesh, store) = mesh();
        let loads = calculator(&mesh);
        store.set_unavailable(true);

        assert!(approx(loads.load(NodeKind::Relay, "relay-1").await, FULL_LOAD));
        assert!(approx(loads.load(NodeKind::Egress, "egress-1").await, FULL_LOAD));
    }

    #[tokio::test]
    async fn test_egress_factors() {
        let (mesh, _) = mesh();
        let loads = calculator(&mesh);

        record(&mesh, "eg-1", MetricKind::Nodejs, &[("cpuPercent", 8.0)]).await;
        record(
            &mesh,
            "eg-1",
            MetricKind::JanusStreaming,
            &[("cpuPercent", 16.0), ("janusTotalViewers", 5.0), ("janusMountpointsActive", 1.0)],
        )
        .await;
        // 5 of 10 viewers dominates 20% cpu and 1 of 5 mountpoints
        assert!(approx(loads.egress_load("eg-1").await.unwrap(), 50.0));
        assert_eq!(loads.egress_viewers("eg-1").await.unwrap(), 5);

        record(&mesh, "eg-1", MetricKind::JanusStreaming, &[("janusMountpointsActive", 5.0)]).await;
        assert!(approx(loads.egress_load("eg-1").await.unwrap(), 100.0));
    }

    #[tokio::test]
    async fn test_injection_pool_report() {
        let (mesh, _) = mesh();
        add_injection(&mesh, "inj-1", "relay-root-1").await;
        add_injection(&mesh, "inj-2", "relay-root-2").await;
        add_injection(&mesh, "inj-3", "relay-root-3").await;
        mesh.set_node_status("inj-3", NodeStatus::Draining).await.unwrap();
        mesh.adjust_used_slots(NodeKind::Injection, "inj-1", 4.0).await.unwrap();
        // inj-2 is over its cpu limit
        record(&mesh, "inj-2", MetricKind::Nodejs, &[("cpuPercent", 80.0)]).await;

        let report = calculator(&mesh).injection_pool_report().await.unwrap();
        assert_eq!(report.total_nodes, 3);
        assert_eq!(report.active_nodes, 2);
        assert_eq!(report.healthy_nodes, 1);
        assert_eq!(report.total_available_slots, 6);
        assert!(approx(report.avg_hardware_load, 50.0));
    }

    #[tokio::test]
    async fn test_egress_pool_report() {
        let (mesh, _) = mesh();
        add_node(&mesh, "eg-1", NodeKind::Egress).await;
        add_node(&mesh, "eg-2", NodeKind::Egress).await;
        record(&mesh, "eg-1", MetricKind::JanusStreaming, &[("janusTotalViewers", 8.0)]).await;
        record(&mesh, "eg-2", MetricKind::JanusStreaming, &[("janusTotalViewers", 2.0)]).await;

        let report = calculator(&mesh).egress_pool_report().await.unwrap();
        assert_eq!(report.active_nodes, 2);
        assert_eq!(report.saturated_nodes, 1);
        assert_eq!(report.total_viewers, 10);
        assert_eq!(report.free_viewer_slots, 10);
        assert!(approx(report.avg_load, 50.0));
    }
}
