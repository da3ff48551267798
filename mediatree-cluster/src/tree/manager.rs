//! Node pool and topology management
//!
//! The tree is `injection -> relayRoot -> relay* -> egress`. The edge from an
//! injection to its relay root is created with the pair and is the only
//! static edge; everything below a root is attached and detached at runtime.
//! Whole trees can also be stamped out from a template and torn down again.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use mediatree_core::config::MeshConfig;
use mediatree_core::models::{
    NodeInfo, NodeKind, NodeRole, NodeSpec, NodeStatus, TopologyEvent, Tree, TreeMember,
    TreeMetadata, TreeStatus, TreeSummary,
};
use mediatree_core::provisioner::root_info;
use mediatree_core::store::{keys, WriteBatch};
use mediatree_core::{Error, MeshState, Provisioner, Result};

use super::naming::next_node_id;
use super::templates::{get_template, Template};

const ROOT_PREFIX: &str = "relay-root";
/// Walk limit when measuring depth, well past any real tree
const MAX_DEPTH_SCAN: usize = 64;

/// Node counts for one pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleCounts {
    pub total: usize,
    pub active: usize,
    pub draining: usize,
    pub destroying: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub injection: RoleCounts,
    pub relay: RoleCounts,
    pub egress: RoleCounts,
    /// Longest egress-to-top chain, in edges
    pub max_depth: usize,
}

/// An id handed out but not yet visible in any pool
struct IdReservation<'a> {
    pending: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct TreeManager {
    mesh: MeshState,
    provisioner: Arc<dyn Provisioner>,
    config: MeshConfig,
    pending_ids: Mutex<HashSet<String>>,
}

impl TreeManager {
    #[must_use]
    pub fn new(mesh: MeshState, provisioner: Arc<dyn Provisioner>, config: MeshConfig) -> Self {
        Self {
            mesh,
            provisioner,
            config,
            pending_ids: Mutex::new(HashSet::new()),
        }
    }

    const fn max_slots(&self, kind: NodeKind) -> u32 {
        match kind {
            NodeKind::Injection => self.config.injection_max_slots,
            NodeKind::Relay => self.config.relay_max_slots,
            NodeKind::Egress => self.config.egress_max_slots,
        }
    }

    /// Smallest free id for `prefix` across every pool
    pub async fn generate_node_id(&self, prefix: &str) -> Result<String> {
        Ok(self.reserve_id(prefix).await?.id.clone())
    }

    async fn reserve_id(&self, prefix: &str) -> Result<IdReservation<'_>> {
        let mut taken = Vec::new();
        for kind in NodeKind::ALL {
            taken.extend(self.mesh.pool_members(kind).await?);
        }

        let id = {
            let mut pending = self.pending_ids.lock();
            let id = next_node_id(
                prefix,
                taken.iter().chain(pending.iter()).map(String::as_str),
            );
            pending.insert(id.clone());
            id
        };

        Ok(IdReservation {
            pending: &self.pending_ids,
            id,
        })
    }

    /// Provision a node and put it in its pool
    ///
    /// An injection comes with its relay root, pooled as a relay and linked
    /// under the injection.
    pub async fn create_node(&self, kind: NodeKind) -> Result<NodeInfo> {
        let node = self.reserve_id(kind.id_prefix()).await?;
        let root = match kind {
            NodeKind::Injection => Some(self.reserve_id(ROOT_PREFIX).await?),
            _ => None,
        };

        let mut spec = NodeSpec::new(node.id.clone(), kind, self.max_slots(kind));
        if let Some(root) = &root {
            spec = spec.with_relay_root(root.id.clone());
        }

        let info = self.provisioner.create_node(&spec).await?;
        let root_id = root.as_ref().map(|r| r.id.as_str());

        if let Err(e) = self.register(&info, root_id).await {
            error!(node_id = %info.node_id, error = %e, "Failed to register node, tearing it down");
            if let Some(root_id) = root_id {
                self.discard(&root_info(&info, root_id)).await;
            }
            self.discard(&info).await;
            return Err(e);
        }

        info!(node_id = %info.node_id, kind = %kind, relay_root = ?root_id, "Node created");
        Ok(info)
    }

    async fn register(&self, info: &NodeInfo, root_id: Option<&str>) -> Result<()> {
        let Some(root_id) = root_id else {
            return self.mesh.register_in_pool(info.kind, &info.node_id).await;
        };

        // Injection, root and the static edge land together
        let active = NodeStatus::Active.as_str();
        let mut batch = WriteBatch::new();
        batch
            .sadd(keys::pool(info.kind), info.node_id.as_str())
            .zadd(keys::pool_load(info.kind), info.node_id.as_str(), 0.0)
            .set(keys::node_status(&info.node_id), active)
            .sadd(keys::pool(NodeKind::Relay), root_id)
            .zadd(keys::pool_load(NodeKind::Relay), root_id, 0.0)
            .set(keys::node_status(root_id), active)
            .set(keys::topo_parent(root_id), info.node_id.as_str())
            .sadd(keys::topo_children(&info.node_id), root_id);
        self.mesh.store().apply(batch).await?;

        self.publish_link(&info.node_id, root_id).await;
        Ok(())
    }

    async fn discard(&self, info: &NodeInfo) {
        if let Err(e) = self.mesh.remove_from_pool(info.kind, &info.node_id).await {
            warn!(node_id = %info.node_id, error = %e, "Failed to remove discarded node from pool");
        }
        if let Err(e) = self.provisioner.destroy_node(info).await {
            warn!(node_id = %info.node_id, error = %e, "Failed to discard node");
        }
    }

    /// Hang `child_id` under `parent_id`
    pub async fn attach(&self, parent_id: &str, child_id: &str) -> Result<()> {
        let parent = self.mesh.load_node(parent_id).await?;
        let child = self.mesh.load_node(child_id).await?;

        if parent.kind == NodeKind::Egress {
            return Err(Error::InvalidInput(format!("egress {parent_id} cannot have children")));
        }
        if parent.kind == NodeKind::Injection {
            return Err(Error::InvalidInput(format!(
                "injection {parent_id} only feeds its relay root"
            )));
        }
        if child.kind == NodeKind::Injection || child.role == NodeRole::Root {
            return Err(Error::InvalidInput(format!("{child_id} cannot be attached")));
        }
        if let Some(current) = self.mesh.parent(child_id).await? {
            return Err(Error::AlreadyExists(format!(
                "{child_id} is already attached to {current}"
            )));
        }

        // The child must not be an ancestor of the parent
        let mut cursor = Some(parent_id.to_string());
        let mut steps = 0;
        while let Some(node) = cursor {
            if node == child_id {
                return Err(Error::InvalidInput(format!(
                    "attaching {child_id} under {parent_id} would form a cycle"
                )));
            }
            steps += 1;
            if steps > MAX_DEPTH_SCAN {
                return Err(Error::TopologyBroken(format!("ancestry of {parent_id} does not end")));
            }
            cursor = self.mesh.parent(&node).await?;
        }

        self.mesh.link(parent_id, child_id).await?;
        self.publish_link(parent_id, child_id).await;
        info!(parent_id = %parent_id, child_id = %child_id, "Node attached");
        Ok(())
    }

    /// Detach `child_id` from its parent, returning the former parent
    pub async fn detach(&self, child_id: &str) -> Result<String> {
        let parent_id = self
            .mesh
            .parent(child_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{child_id} has no parent")))?;

        if let Some(parent) = self.mesh.find_node(&parent_id).await? {
            if parent.kind == NodeKind::Injection {
                return Err(Error::InvalidInput(format!(
                    "{child_id} is the static relay root of {parent_id}"
                )));
            }
        }

        self.mesh.unlink(&parent_id, child_id).await?;
        self.publish_unlink(&parent_id, child_id).await;
        info!(parent_id = %parent_id, child_id = %child_id, "Node detached");
        Ok(parent_id)
    }

    async fn publish_link(&self, parent_id: &str, child_id: &str) {
        let timestamp = Utc::now();
        self.publish(
            parent_id,
            &TopologyEvent::ChildAdded {
                node_id: parent_id.to_string(),
                child_id: child_id.to_string(),
                timestamp,
            },
        )
        .await;
        self.publish(
            child_id,
            &TopologyEvent::ParentChanged {
                node_id: child_id.to_string(),
                parent_id: Some(parent_id.to_string()),
                timestamp,
            },
        )
        .await;
    }

    async fn publish_unlink(&self, parent_id: &str, child_id: &str) {
        let timestamp = Utc::now();
        self.publish(
            parent_id,
            &TopologyEvent::ChildRemoved {
                node_id: parent_id.to_string(),
                child_id: child_id.to_string(),
                timestamp,
            },
        )
        .await;
        self.publish(
            child_id,
            &TopologyEvent::ParentChanged {
                node_id: child_id.to_string(),
                parent_id: None,
                timestamp,
            },
        )
        .await;
    }

    async fn publish(&self, channel_id: &str, event: &TopologyEvent) {
        if let Err(e) = self.mesh.publish_topology(channel_id, event).await {
            warn!(channel_id = %channel_id, error = %e, "Failed to publish topology event");
        }
    }

    /// Minimal serving tree: one injection with its root, one relay, one egress
    ///
    /// Returns the ids top-down.
    pub async fn bootstrap(&self) -> Result<Vec<String>> {
        let injection = self.create_node(NodeKind::Injection).await?;
        let root_id = self
            .mesh
            .children(&injection.node_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::TopologyBroken(format!("{} was created without a relay root", injection.node_id))
            })?;
        let relay = self.create_node(NodeKind::Relay).await?;
        let egress = self.create_node(NodeKind::Egress).await?;

        self.attach(&root_id, &relay.node_id).await?;
        self.attach(&relay.node_id, &egress.node_id).await?;

        self.publish_reset(&self.config.tree_id).await;

        info!(tree_id = %self.config.tree_id, "Tree bootstrapped");
        Ok(vec![injection.node_id, root_id, relay.node_id, egress.node_id])
    }

    /// Add capacity to a pool
    ///
    /// A new egress goes under the active relay root with the fewest
    /// children. A new relay stays detached until something attaches it.
    pub async fn scale_up(&self, kind: NodeKind) -> Result<NodeInfo> {
        let info = self.create_node(kind).await?;

        if kind == NodeKind::Egress {
            match self.least_populated_root().await? {
                Some(root_id) => self.attach(&root_id, &info.node_id).await?,
                None => warn!(node_id = %info.node_id, "No active relay root to attach egress to"),
            }
        }

        info!(node_id = %info.node_id, kind = %kind, "Scaled up");
        Ok(info)
    }

    async fn least_populated_root(&self) -> Result<Option<String>> {
        let mut best: Option<(usize, String)> = None;

        for node_id in self.mesh.pool_members(NodeKind::Relay).await? {
            let Some(info) = self.mesh.find_node(&node_id).await? else {
                continue;
            };
            if info.role != NodeRole::Root
                || self.mesh.node_status(&node_id).await? != Some(NodeStatus::Active)
            {
                continue;
            }
            let children = self.mesh.children(&node_id).await?.len();
            // Members come sorted, so ties keep the lowest id
            if best.as_ref().map_or(true, |(fewest, _)| children < *fewest) {
                best = Some((children, node_id));
            }
        }

        Ok(best.map(|(_, id)| id))
    }

    /// Move a node along `active <-> draining -> destroying`
    pub async fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        let current = self
            .mesh
            .node_status(node_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("status of {node_id}")))?;

        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(Error::InvalidInput(format!(
                "{node_id} cannot go from {current} to {status}"
            )));
        }

        self.mesh.set_node_status(node_id, status).await?;
        info!(node_id = %node_id, from = %current, to = %status, "Node status changed");
        Ok(())
    }

    /// Remove a node and everything the mesh knows about it
    ///
    /// Each step runs even if an earlier one failed. An injection takes its
    /// relay root with it. The first provisioner error is returned.
    pub async fn destroy_node(&self, node_id: &str, kind: NodeKind) -> Result<()> {
        let mut failure = None;

        if kind == NodeKind::Injection {
            if let Err(e) = self
                .mesh
                .set_node_status(node_id, NodeStatus::Destroying)
                .await
            {
                warn!(node_id = %node_id, error = %e, "Failed to mark injection destroying");
            }
            for root_id in self.static_roots(node_id).await {
                if let Err(e) = self.teardown(&root_id, NodeKind::Relay).await {
                    warn!(node_id = %node_id, root_id = %root_id, error = %e, "Failed to destroy relay root");
                    failure.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.teardown(node_id, kind).await {
            failure.get_or_insert(e);
        }
        failure.map_or(Ok(()), Err)
    }

    async fn teardown(&self, node_id: &str, kind: NodeKind) -> Result<()> {
        let mut failure = None;

        if let Err(e) = self
            .mesh
            .set_node_status(node_id, NodeStatus::Destroying)
            .await
        {
            warn!(node_id = %node_id, error = %e, "Failed to mark node destroying");
        }

        match self.mesh.find_node(node_id).await {
            Ok(Some(info)) => {
                if let Err(e) = self.provisioner.destroy_node(&info).await {
                    error!(node_id = %node_id, error = %e, "Provisioner failed to destroy node");
                    failure = Some(e);
                }
            }
            Ok(None) => warn!(node_id = %node_id, "Node record already gone"),
            Err(e) => warn!(node_id = %node_id, error = %e, "Failed to load node record"),
        }

        if let Err(e) = self.mesh.remove_from_pool(kind, node_id).await {
            warn!(node_id = %node_id, error = %e, "Failed to remove node from pool");
        }
        self.unwire(node_id).await;
        if let Err(e) = self.mesh.clear_node_sessions(node_id).await {
            warn!(node_id = %node_id, error = %e, "Failed to clear node sessions");
        }

        info!(node_id = %node_id, kind = %kind, "Node destroyed");
        failure.map_or(Ok(()), Err)
    }

    async fn static_roots(&self, injection_id: &str) -> Vec<String> {
        let children = match self.mesh.children(injection_id).await {
            Ok(children) => children,
            Err(e) => {
                warn!(node_id = %injection_id, error = %e, "Failed to read injection children");
                return Vec::new();
            }
        };

        let mut roots = Vec::new();
        for child_id in children {
            match self.mesh.find_node(&child_id).await {
                Ok(Some(info)) if info.role == NodeRole::Root => roots.push(child_id),
                Ok(_) => warn!(node_id = %injection_id, child_id = %child_id, "Injection has a non-root child"),
                Err(e) => warn!(child_id = %child_id, error = %e, "Failed to load injection child"),
            }
        }
        roots
    }

    /// Cut every edge touching the node and announce it
    async fn unwire(&self, node_id: &str) {
        match self.mesh.parent(node_id).await {
            Ok(Some(parent_id)) => match self.mesh.unlink(&parent_id, node_id).await {
                Ok(()) => self.publish_unlink(&parent_id, node_id).await,
                Err(e) => warn!(node_id = %node_id, error = %e, "Failed to unlink from parent"),
            },
            Ok(None) => {}
            Err(e) => warn!(node_id = %node_id, error = %e, "Failed to read parent"),
        }

        match self.mesh.children(node_id).await {
            Ok(children) => {
                for child_id in children {
                    match self.mesh.unlink(node_id, &child_id).await {
                        Ok(()) => self.publish_unlink(node_id, &child_id).await,
                        Err(e) => warn!(node_id = %node_id, child_id = %child_id, error = %e, "Failed to unlink child"),
                    }
                }
            }
            Err(e) => warn!(node_id = %node_id, error = %e, "Failed to read children"),
        }

        if let Err(e) = self.mesh.clear_topology(node_id).await {
            warn!(node_id = %node_id, error = %e, "Failed to clear topology keys");
        }
    }

    /// Stamp out a tree from a named template
    ///
    /// Nodes are created in template order, then wired layer by layer with
    /// parents taken round-robin. Any failure destroys what was created and
    /// drops the tree's records.
    pub async fn create_tree(&self, tree_id: &str, template_name: &str) -> Result<Tree> {
        if tree_id.is_empty() || tree_id.contains(':') {
            return Err(Error::InvalidInput(format!("invalid tree id '{tree_id}'")));
        }
        let template = get_template(template_name)?;
        if self.mesh.tree_exists(tree_id).await? {
            return Err(Error::AlreadyExists(format!("tree {tree_id}")));
        }

        let now = Utc::now().timestamp();
        let mut metadata = TreeMetadata {
            tree_id: tree_id.to_string(),
            template: template.name.to_string(),
            status: TreeStatus::Creating,
            created_at: now,
            updated_at: now,
        };
        self.mesh.save_tree(&metadata).await?;
        info!(tree_id = %tree_id, template = %template.name, nodes = template.total_nodes(), "Creating tree");

        let mut created = Vec::new();
        let mut nodes = match self.populate(tree_id, template, &mut created).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(tree_id = %tree_id, created = created.len(), error = %e, "Tree creation failed, rolling back");
                for (node_id, kind) in created.iter().rev() {
                    if let Err(e) = self.destroy_node(node_id, *kind).await {
                        warn!(tree_id = %tree_id, node_id = %node_id, error = %e, "Failed to roll back node");
                    }
                }
                if let Err(e) = self.mesh.remove_tree(tree_id).await {
                    warn!(tree_id = %tree_id, error = %e, "Failed to drop tree records");
                }
                return Err(e);
            }
        };

        self.publish_reset(tree_id).await;
        metadata.status = TreeStatus::Active;
        metadata.updated_at = Utc::now().timestamp();
        if let Err(e) = self
            .mesh
            .set_tree_status(tree_id, metadata.status, metadata.updated_at)
            .await
        {
            warn!(tree_id = %tree_id, error = %e, "Failed to mark tree active");
        }

        nodes.sort_by(|a, b| a.layer.cmp(&b.layer).then_with(|| a.node_id.cmp(&b.node_id)));
        info!(tree_id = %tree_id, nodes = nodes.len(), "Tree created");
        Ok(Tree { metadata, nodes })
    }

    /// Create and wire the template's nodes, recording each one as it lands
    async fn populate(
        &self,
        tree_id: &str,
        template: &Template,
        created: &mut Vec<(String, NodeKind)>,
    ) -> Result<Vec<TreeMember>> {
        let mut members = Vec::new();

        for spec in template.nodes {
            for _ in 0..spec.count {
                let info = self.create_node(spec.kind).await?;
                created.push((info.node_id.clone(), spec.kind));

                let mut placed = vec![TreeMember {
                    node_id: info.node_id.clone(),
                    kind: spec.kind,
                    layer: spec.layer,
                }];
                if spec.kind == NodeKind::Injection {
                    for root_id in self.mesh.children(&info.node_id).await? {
                        placed.push(TreeMember {
                            node_id: root_id,
                            kind: NodeKind::Relay,
                            layer: 0,
                        });
                    }
                }
                for member in placed {
                    self.mesh.add_tree_member(tree_id, &member).await?;
                    members.push(member);
                }
            }
        }

        for layer in 1..=template.max_layer() {
            let parents: Vec<&str> = members
                .iter()
                .filter(|m| m.kind == NodeKind::Relay && m.layer == layer - 1)
                .map(|m| m.node_id.as_str())
                .collect();
            if parents.is_empty() {
                return Err(Error::TopologyBroken(format!(
                    "tree {tree_id} has no relay at layer {}",
                    layer - 1
                )));
            }
            let children = members.iter().filter(|m| m.layer == layer);
            for (i, child) in children.enumerate() {
                self.attach(parents[i % parents.len()], &child.node_id).await?;
            }
        }

        Ok(members)
    }

    pub async fn get_tree(&self, tree_id: &str) -> Result<Tree> {
        let metadata = self
            .mesh
            .load_tree(tree_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tree {tree_id}")))?;
        let nodes = self.mesh.tree_members(tree_id).await?;
        Ok(Tree { metadata, nodes })
    }

    /// Summaries of every indexed tree, by id
    pub async fn list_trees(&self) -> Result<Vec<TreeSummary>> {
        let mut trees = Vec::new();
        for tree_id in self.mesh.list_tree_ids().await? {
            match self.get_tree(&tree_id).await {
                Ok(tree) => trees.push(tree.summary()),
                Err(Error::NotFound(_)) => warn!(tree_id = %tree_id, "Indexed tree has no metadata"),
                Err(e) => return Err(e),
            }
        }
        Ok(trees)
    }

    /// Destroy a tree's nodes deepest layer first, then its records
    ///
    /// Relay roots go with their injection. Every node is attempted; the
    /// first failure is returned once the records are gone.
    pub async fn destroy_tree(&self, tree_id: &str) -> Result<()> {
        let tree = self.get_tree(tree_id).await?;
        if let Err(e) = self
            .mesh
            .set_tree_status(tree_id, TreeStatus::Destroying, Utc::now().timestamp())
            .await
        {
            warn!(tree_id = %tree_id, error = %e, "Failed to mark tree destroying");
        }

        let mut failure = None;
        for member in tree.nodes.iter().rev() {
            if member.kind == NodeKind::Relay && member.layer == 0 {
                continue;
            }
            if let Err(e) = self.destroy_node(&member.node_id, member.kind).await {
                warn!(tree_id = %tree_id, node_id = %member.node_id, error = %e, "Failed to destroy tree node");
                failure.get_or_insert(e);
            }
        }

        if let Err(e) = self.mesh.remove_tree(tree_id).await {
            warn!(tree_id = %tree_id, error = %e, "Failed to drop tree records");
            failure.get_or_insert(e);
        }
        self.publish_reset(tree_id).await;

        info!(tree_id = %tree_id, nodes = tree.nodes.len(), "Tree destroyed");
        failure.map_or(Ok(()), Err)
    }

    async fn publish_reset(&self, tree_id: &str) {
        self.publish(
            tree_id,
            &TopologyEvent::TopologyReset {
                tree_id: tree_id.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    pub async fn pool_summary(&self) -> Result<PoolSummary> {
        let mut summary = PoolSummary::default();

        for kind in NodeKind::ALL {
            let mut counts = RoleCounts::default();
            for node_id in self.mesh.pool_members(kind).await? {
                counts.total += 1;
                match self.mesh.node_status(&node_id).await? {
                    Some(NodeStatus::Active) => counts.active += 1,
                    Some(NodeStatus::Draining) => counts.draining += 1,
                    Some(NodeStatus::Destroying) => counts.destroying += 1,
                    None => {}
                }
            }
            match kind {
                NodeKind::Injection => summary.injection = counts,
                NodeKind::Relay => summary.relay = counts,
                NodeKind::Egress => summary.egress = counts,
            }
        }

        for egress_id in self.mesh.pool_members(NodeKind::Egress).await? {
            let mut depth = 0;
            let mut cursor = egress_id;
            while let Some(parent) = self.mesh.parent(&cursor).await? {
                depth += 1;
                if depth >= MAX_DEPTH_SCAN {
                    break;
                }
                cursor = parent;
            }
            summary.max_depth = summary.max_depth.max(depth);
        }

        Ok(summary)
    }
}
