//! Load-driven pool scaling
//!
//! Every tick looks at each configured pool. When all active members are
//! saturated the pool grows, preferring to bring a draining node back over
//! provisioning a new one. Decisions are serialised across controller
//! replicas by the per-role scaling lock, which doubles as the cooldown.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use mediatree_core::config::AutoscalerConfig;
use mediatree_core::models::{NodeKind, NodeStatus};
use mediatree_core::store::{LockGuard, ScalingLock};
use mediatree_core::{MeshState, Result};

use crate::load::LoadCalculator;
use crate::tree::TreeManager;

/// What one tick decided for one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleOutcome {
    /// Another replica or a cooldown owns the lock
    LockHeld,
    /// Not every active node is saturated
    Idle,
    /// A draining node was flipped back to active
    Recovered(String),
    /// A new node is being provisioned in the background
    ScalingUp,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub roles: Vec<(NodeKind, RoleOutcome)>,
}

impl TickOutcome {
    #[must_use]
    pub fn for_role(&self, kind: NodeKind) -> Option<&RoleOutcome> {
        self.roles
            .iter()
            .find(|(role, _)| *role == kind)
            .map(|(_, outcome)| outcome)
    }
}

#[derive(Clone)]
pub struct Autoscaler {
    mesh: MeshState,
    loads: LoadCalculator,
    lock: ScalingLock,
    tree: Arc<TreeManager>,
    config: AutoscalerConfig,
    roles: Vec<NodeKind>,
    scale_ups: TaskTracker,
    cancel_token: CancellationToken,
}

impl Autoscaler {
    #[must_use]
    pub fn new(
        mesh: MeshState,
        loads: LoadCalculator,
        tree: Arc<TreeManager>,
        config: AutoscalerConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        let roles = config
            .roles
            .iter()
            .filter_map(|role| match role.parse() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!(role = %role, error = %e, "Ignoring unknown autoscaler role");
                    None
                }
            })
            .collect();

        Self {
            lock: ScalingLock::new(mesh.store().clone()),
            mesh,
            loads,
            tree,
            config,
            roles,
            scale_ups: TaskTracker::new(),
            cancel_token,
        }
    }

    const fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.config.tick_timeout_seconds)
    }

    pub fn start(&self) -> JoinHandle<()> {
        let autoscaler = self.clone();
        let cancel_token = self.cancel_token.clone();
        let tick_timeout = self.tick_timeout();
        let mut timer = interval(Duration::from_secs(self.config.interval_seconds));

        tokio::spawn(async move {
            info!(roles = ?autoscaler.roles, "Autoscaler started");
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!("Autoscaler shutting down");
                        autoscaler.wait_for_scale_ups().await;
                        return;
                    }
                    _ = timer.tick() => {
                        match tokio::time::timeout(tick_timeout, autoscaler.tick()).await {
                            Ok(outcome) => debug!(outcome = ?outcome.roles, "Autoscaler tick finished"),
                            Err(_) => warn!(timeout_secs = tick_timeout.as_secs(), "Autoscaler tick timed out"),
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Wait until every scale-up spawned so far has finished
    pub async fn wait_for_scale_ups(&self) {
        self.scale_ups.close();
        self.scale_ups.wait().await;
        self.scale_ups.reopen();
    }

    /// Evaluate every configured pool once
    pub async fn tick(&self) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        for &kind in &self.roles {
            let role_outcome = match self.evaluate(kind).await {
                Ok(role_outcome) => role_outcome,
                Err(e) => {
                    error!(kind = %kind, error = %e, "Autoscaler evaluation failed");
                    RoleOutcome::Failed(e.to_string())
                }
            };
            outcome.roles.push((kind, role_outcome));
        }
        outcome
    }

    async fn evaluate(&self, kind: NodeKind) -> Result<RoleOutcome> {
        let Some(guard) = self.lock.acquire(kind, self.tick_timeout()).await? else {
            debug!(kind = %kind, "Scaling lock held, skipping pool");
            return Ok(RoleOutcome::LockHeld);
        };

        match self.decide(kind, &guard).await {
            Ok(RoleOutcome::Idle) => {
                self.lock.release(&guard).await?;
                Ok(RoleOutcome::Idle)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release_err) = self.lock.release(&guard).await {
                    warn!(kind = %kind, error = %release_err, "Failed to release scaling lock");
                }
                Err(e)
            }
        }
    }

    async fn decide(&self, kind: NodeKind, guard: &LockGuard) -> Result<RoleOutcome> {
        let mut active = Vec::new();
        let mut draining = Vec::new();
        for node_id in self.mesh.pool_members(kind).await? {
            match self.mesh.node_status(&node_id).await? {
                Some(NodeStatus::Active) => active.push(node_id),
                Some(NodeStatus::Draining) => draining.push(node_id),
                _ => {}
            }
        }

        if active.is_empty() {
            debug!(kind = %kind, "No active nodes in pool");
            return Ok(RoleOutcome::Idle);
        }

        let loads = join_all(active.iter().map(|node_id| self.loads.load(kind, node_id))).await;
        let saturated = loads
            .iter()
            .filter(|load| **load >= self.config.saturation_threshold)
            .count();
        debug!(kind = %kind, active = active.len(), saturated, draining = draining.len(), "Pool sampled");

        if saturated < active.len() {
            return Ok(RoleOutcome::Idle);
        }

        if let Some(node_id) = self.busiest(&draining).await? {
            self.tree.set_status(&node_id, NodeStatus::Active).await?;
            self.lock
                .hold_for(guard, Duration::from_secs(self.config.recover_cooldown_seconds))
                .await?;
            info!(kind = %kind, node_id = %node_id, "Recovered draining node");
            return Ok(RoleOutcome::Recovered(node_id));
        }

        self.lock
            .hold_for(guard, Duration::from_secs(self.config.scale_up_cooldown_seconds))
            .await?;
        info!(kind = %kind, saturated, "Pool saturated, scaling up");

        let tree = self.tree.clone();
        let lock = self.lock.clone();
        let guard = guard.clone();
        self.scale_ups.spawn(async move {
            if let Err(e) = tree.scale_up(kind).await {
                error!(kind = %kind, error = %e, "Scale-up failed, releasing lock for retry");
                if let Err(e) = lock.release(&guard).await {
                    warn!(kind = %kind, error = %e, "Failed to release scaling lock");
                }
            }
        });

        Ok(RoleOutcome::ScalingUp)
    }

    /// Draining node with the most sessions; ties keep the lowest id
    async fn busiest(&self, draining: &[String]) -> Result<Option<String>> {
        let mut best: Option<(usize, &String)> = None;
        for node_id in draining {
            let sessions = self.mesh.node_session_count(node_id).await?;
            if best.map_or(true, |(most, _)| sessions > most) {
                best = Some((sessions, node_id));
            }
        }
        Ok(best.map(|(_, node_id)| node_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_child, add_injection, mesh, record, single_branch};
    use mediatree_core::config::{LoadConfig, MeshConfig};
    use mediatree_core::models::MetricKind;
    use mediatree_core::provisioner::MockProvisioner;

    fn autoscaler(mesh: &MeshState, roles: &[&str]) -> (Autoscaler, Arc<MockProvisioner>) {
        let provisioner = Arc::new(MockProvisioner::new(mesh.clone()));
        let tree = TreeManager::new(mesh.clone(), provisioner.clone(), MeshConfig::default());
        let config = AutoscalerConfig {
            roles: roles.iter().map(ToString::to_string).collect(),
            ..AutoscalerConfig::default()
        };
        let autoscaler = Autoscaler::new(
            mesh.clone(),
            LoadCalculator::new(mesh.clone(), LoadConfig::default()),
            Arc::new(tree),
            config,
            CancellationToken::new(),
        );
        (autoscaler, provisioner)
    }

    fn lock(mesh: &MeshState) -> ScalingLock {
        ScalingLock::new(mesh.store().clone())
    }

    #[tokio::test]
    async fn test_recovers_busiest_draining_injection() {
        let (mesh, _) = mesh();
        add_injection(&mesh, "inj-1", "relay-root-1").await;
        add_injection(&mesh, "inj-2", "relay-root-2").await;
        add_injection(&mesh, "inj-3", "relay-root-3").await;
        // 72% cpu against an 80% limit
        record(&mesh, "inj-1", MetricKind::Nodejs, &[("cpuPercent", 72.0)]).await;

        for node_id in ["inj-2", "inj-3"] {
            mesh.set_node_status(node_id, NodeStatus::Draining).await.unwrap();
        }
        for session_id in ["s1", "s2", "s3"] {
            mesh.add_node_session("inj-2", session_id).await.unwrap();
        }
        mesh.add_node_session("inj-3", "s4").await.unwrap();

        let (autoscaler, provisioner) = autoscaler(&mesh, &["injection"]);
        let outcome = autoscaler.tick().await;

        assert_eq!(
            outcome.for_role(NodeKind::Injection),
            Some(&RoleOutcome::Recovered("inj-2".to_string()))
        );
        assert_eq!(mesh.node_status("inj-2").await.unwrap(), Some(NodeStatus::Active));
        assert_eq!(mesh.node_status("inj-3").await.unwrap(), Some(NodeStatus::Draining));
        assert!(provisioner.created().is_empty());
        assert!(lock(&mesh).is_held(NodeKind::Injection).await.unwrap());

        // The cooldown keeps the next tick out
        assert_eq!(
            autoscaler.tick().await.for_role(NodeKind::Injection),
            Some(&RoleOutcome::LockHeld)
        );
    }

    #[tokio::test]
    async fn test_scales_up_saturated_egress_pool() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        record(&mesh, "eg-1", MetricKind::JanusStreaming, &[("janusTotalViewers", 10.0)]).await;

        let (autoscaler, provisioner) = autoscaler(&mesh, &["egress"]);
        assert_eq!(
            autoscaler.tick().await.for_role(NodeKind::Egress),
            Some(&RoleOutcome::ScalingUp)
        );
        autoscaler.wait_for_scale_ups().await;

        assert_eq!(provisioner.created(), vec!["egress-1"]);
        assert_eq!(
            mesh.pool_members(NodeKind::Egress).await.unwrap(),
            vec!["eg-1", "egress-1"]
        );
        assert_eq!(mesh.parent("egress-1").await.unwrap().as_deref(), Some("relay-root-1"));
        assert!(lock(&mesh).is_held(NodeKind::Egress).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_scale_up_releases_lock() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        record(&mesh, "eg-1", MetricKind::Nodejs, &[("cpuPercent", 95.0)]).await;

        let (autoscaler, provisioner) = autoscaler(&mesh, &["egress"]);
        provisioner.fail_create(Some(NodeKind::Egress));

        assert_eq!(
            autoscaler.tick().await.for_role(NodeKind::Egress),
            Some(&RoleOutcome::ScalingUp)
        );
        autoscaler.wait_for_scale_ups().await;

        assert!(!lock(&mesh).is_held(NodeKind::Egress).await.unwrap());
        assert_eq!(mesh.pool_members(NodeKind::Egress).await.unwrap(), vec!["eg-1"]);
    }

    #[tokio::test]
    async fn test_partial_saturation_is_idle() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        add_child(&mesh, "relay-root-1", "eg-2", NodeKind::Egress).await;
        record(&mesh, "eg-1", MetricKind::Nodejs, &[("cpuPercent", 95.0)]).await;

        let (autoscaler, provisioner) = autoscaler(&mesh, &["egress", "injection"]);
        let outcome = autoscaler.tick().await;

        assert_eq!(outcome.for_role(NodeKind::Egress), Some(&RoleOutcome::Idle));
        assert_eq!(outcome.for_role(NodeKind::Injection), Some(&RoleOutcome::Idle));
        assert!(provisioner.created().is_empty());
        assert!(!lock(&mesh).is_held(NodeKind::Egress).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_or_draining_pool_is_idle() {
        let (mesh, _) = mesh();
        add_injection(&mesh, "inj-1", "relay-root-1").await;
        mesh.set_node_status("inj-1", NodeStatus::Draining).await.unwrap();

        let (autoscaler, provisioner) = autoscaler(&mesh, &["injection", "egress"]);
        let outcome = autoscaler.tick().await;

        assert_eq!(outcome.for_role(NodeKind::Injection), Some(&RoleOutcome::Idle));
        assert_eq!(outcome.for_role(NodeKind::Egress), Some(&RoleOutcome::Idle));
        assert!(provisioner.created().is_empty());
    }

    #[tokio::test]
    async fn test_respects_lock_held_elsewhere() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        record(&mesh, "eg-1", MetricKind::Nodejs, &[("cpuPercent", 95.0)]).await;
        let other = lock(&mesh)
            .acquire(NodeKind::Egress, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let (autoscaler, provisioner) = autoscaler(&mesh, &["egress"]);
        assert_eq!(
            autoscaler.tick().await.for_role(NodeKind::Egress),
            Some(&RoleOutcome::LockHeld)
        );
        assert!(provisioner.created().is_empty());
        assert!(lock(&mesh).release(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_outage_reports_failure() {
        let (mesh, store) = mesh();
        let (autoscaler, _) = autoscaler(&mesh, &["egress", "bogus"]);
        store.set_unavailable(true);

        let outcome = autoscaler.tick().await;
        assert_eq!(outcome.roles.len(), 1);
        assert!(matches!(
            outcome.for_role(NodeKind::Egress),
            Some(RoleOutcome::Failed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_cancel() {
        let (mesh, _) = mesh();
        single_branch(&mesh).await;
        record(&mesh, "eg-1", MetricKind::Nodejs, &[("cpuPercent", 95.0)]).await;

        let (autoscaler, provisioner) = autoscaler(&mesh, &["egress"]);
        let handle = autoscaler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        autoscaler.shutdown();
        handle.await.unwrap();
        assert_eq!(provisioner.created(), vec!["egress-1"]);
    }
}
