//! Node selection with a health filter
//!
//! Candidates are ranked by their `pool:{role}:load` score. Ties are broken
//! round-robin over the tied ids in sorted order, with one process-local
//! counter per role.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use mediatree_core::models::{NodeKind, NodeStatus, SessionRecord};
use mediatree_core::{Error, MeshState, Result};

use crate::load::LoadCalculator;
use crate::path::PathBuilder;

pub struct NodeSelector {
    mesh: MeshState,
    loads: LoadCalculator,
    paths: PathBuilder,
    round_robin: Mutex<HashMap<NodeKind, usize>>,
}

impl NodeSelector {
    #[must_use]
    pub fn new(mesh: MeshState, loads: LoadCalculator, paths: PathBuilder) -> Self {
        Self {
            mesh,
            loads,
            paths,
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    /// Pick an injection for a new session and take one of its slots
    pub async fn select_injection(&self) -> Result<String> {
        let mut candidates = Vec::new();

        for node_id in self.mesh.pool_members(NodeKind::Injection).await? {
            if self.mesh.node_status(&node_id).await? != Some(NodeStatus::Active) {
                continue;
            }
            if !self.loads.is_healthy(NodeKind::Injection, &node_id).await {
                debug!(node_id = %node_id, "Skipping unhealthy injection");
                continue;
            }
            let Some(info) = self.mesh.find_node(&node_id).await? else {
                warn!(node_id = %node_id, "Pooled injection has no node record");
                continue;
            };
            let used = self.mesh.used_slots(NodeKind::Injection, &node_id).await?;
            if used >= f64::from(info.max_slots) {
                continue;
            }
            candidates.push((node_id, used));
        }

        let chosen = self.pick(NodeKind::Injection, candidates).ok_or_else(|| {
            Error::NoCapacity("no healthy injection node with free slots".to_string())
        })?;
        let used = self
            .mesh
            .adjust_used_slots(NodeKind::Injection, &chosen, 1.0)
            .await?;

        info!(node_id = %chosen, used_slots = used, "Selected injection");
        Ok(chosen)
    }

    /// Give back the slot taken by [`select_injection`](Self::select_injection)
    pub async fn release_injection(&self, node_id: &str) -> Result<()> {
        self.mesh
            .adjust_used_slots(NodeKind::Injection, node_id, -1.0)
            .await?;
        Ok(())
    }

    /// Active, below the viewer cap and below the accept load
    pub async fn can_accept_viewer(&self, egress_id: &str) -> bool {
        match self.mesh.node_status(egress_id).await {
            Ok(Some(NodeStatus::Active)) => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(egress_id = %egress_id, error = %e, "Failed to read egress status");
                return false;
            }
        }

        let limits = self.loads.limits();
        match self.loads.egress_viewers(egress_id).await {
            Ok(viewers) if viewers < limits.egress_max_viewers => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(egress_id = %egress_id, error = %e, "Failed to read egress viewers");
                return false;
            }
        }

        self.loads.load(NodeKind::Egress, egress_id).await < limits.viewer_accept_load
    }

    /// Prefer an egress already serving the session, else any reachable one
    pub async fn select_egress_for_session(&self, session: &SessionRecord) -> Result<String> {
        let serving = self.mesh.session_egresses(&session.session_id).await?;
        for egress_id in &serving {
            if self.can_accept_viewer(egress_id).await {
                return Ok(egress_id.clone());
            }
        }
        self.select_egress(session, &serving).await
    }

    /// Lowest-scored healthy egress that has a path to the session's injection
    pub async fn select_egress(&self, session: &SessionRecord, exclude: &[String]) -> Result<String> {
        let mut candidates = Vec::new();

        for node_id in self.mesh.pool_members(NodeKind::Egress).await? {
            if exclude.contains(&node_id) {
                continue;
            }
            if self.mesh.node_status(&node_id).await? != Some(NodeStatus::Active) {
                continue;
            }
            if !self.loads.is_healthy(NodeKind::Egress, &node_id).await {
                debug!(node_id = %node_id, "Skipping unhealthy egress");
                continue;
            }
            if let Err(e) = self
                .paths
                .build(&session.injection_node_id, &session.relay_root_id, &node_id)
                .await
            {
                debug!(node_id = %node_id, error = %e, "Egress cannot reach injection");
                continue;
            }
            let score = self.mesh.used_slots(NodeKind::Egress, &node_id).await?;
            candidates.push((node_id, score));
        }

        let chosen = self.pick(NodeKind::Egress, candidates).ok_or_else(|| {
            Error::NoCapacity(format!(
                "no healthy egress reachable from {}",
                session.injection_node_id
            ))
        })?;

        info!(node_id = %chosen, session_id = %session.session_id, "Selected egress");
        Ok(chosen)
    }

    fn pick(&self, kind: NodeKind, candidates: Vec<(String, f64)>) -> Option<String> {
        let lowest = candidates
            .iter()
            .map(|(_, score)| *score)
            .min_by(f64::total_cmp)?;
        let mut tied: Vec<String> = candidates
            .into_iter()
            .filter(|(_, score)| *score == lowest)
            .map(|(id, _)| id)
            .collect();
        tied.sort();

        let mut counters = self.round_robin.lock();
        let counter = counters.entry(kind).or_insert(0);
        let index = *counter % tied.len();
        *counter = counter.wrapping_add(1);
        Some(tied.swap_remove(index))
    }
}
