//! Typed access to the mesh schema
//!
//! `MeshState` is the only place that knows how pools, topology, sessions,
//! routes, counters and activity sets map onto store keys.

use std::sync::Arc;

use super::{keys, StateStore, WriteBatch};
use crate::models::{
    MetricKind, MetricsSample, NodeInfo, NodeKind, NodeStatus, SessionEvent, SessionRecord,
    TopologyEvent, TreeMember, TreeMetadata, TreeStatus,
};
use crate::{Error, Result};

#[derive(Clone)]
pub struct MeshState {
    store: Arc<dyn StateStore>,
}

impl MeshState {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Node records
    // ------------------------------------------------------------------

    pub async fn save_node(&self, info: &NodeInfo) -> Result<()> {
        self.store
            .hset_multiple(&keys::node(&info.node_id), &info.to_fields())
            .await
    }

    pub async fn find_node(&self, node_id: &str) -> Result<Option<NodeInfo>> {
        let fields = self.store.hget_all(&keys::node(node_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        NodeInfo::from_fields(&fields).map(Some)
    }

    pub async fn load_node(&self, node_id: &str) -> Result<NodeInfo> {
        self.find_node(node_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))
    }

    pub async fn delete_node(&self, node_id: &str) -> Result<()> {
        self.store.del(&keys::node(node_id)).await?;
        Ok(())
    }

    pub async fn node_status(&self, node_id: &str) -> Result<Option<NodeStatus>> {
        match self.store.get(&keys::node_status(node_id)).await? {
            Some(raw) => raw.parse().map(Some),
            None => Ok(None),
        }
    }

    pub async fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        self.store
            .set(&keys::node_status(node_id), status.as_str())
            .await
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Add a node to its pool with zero used slots and `active` status
    pub async fn register_in_pool(&self, kind: NodeKind, node_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .sadd(keys::pool(kind), node_id)
            .zadd(keys::pool_load(kind), node_id, 0.0)
            .set(keys::node_status(node_id), NodeStatus::Active.as_str());
        self.store.apply(batch).await
    }

    pub async fn remove_from_pool(&self, kind: NodeKind, node_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .srem(keys::pool(kind), node_id)
            .zrem(keys::pool_load(kind), node_id)
            .del(keys::node_status(node_id));
        self.store.apply(batch).await
    }

    /// Pool members sorted by id
    pub async fn pool_members(&self, kind: NodeKind) -> Result<Vec<String>> {
        let mut members = self.store.smembers(&keys::pool(kind)).await?;
        members.sort();
        Ok(members)
    }

    pub async fn used_slots(&self, kind: NodeKind, node_id: &str) -> Result<f64> {
        Ok(self
            .store
            .zscore(&keys::pool_load(kind), node_id)
            .await?
            .unwrap_or(0.0))
    }

    /// Adjust a node's used-slot score, never letting it drop below zero
    pub async fn adjust_used_slots(&self, kind: NodeKind, node_id: &str, delta: f64) -> Result<f64> {
        let key = keys::pool_load(kind);
        let score = self.store.zincr_by(&key, node_id, delta).await?;
        if score < 0.0 {
            self.store.zadd(&key, node_id, 0.0).await?;
            return Ok(0.0);
        }
        Ok(score)
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    pub async fn parent(&self, node_id: &str) -> Result<Option<String>> {
        self.store.get(&keys::topo_parent(node_id)).await
    }

    /// Children sorted by id
    pub async fn children(&self, node_id: &str) -> Result<Vec<String>> {
        let mut children = self.store.smembers(&keys::topo_children(node_id)).await?;
        children.sort();
        Ok(children)
    }

    pub async fn link(&self, parent_id: &str, child_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .set(keys::topo_parent(child_id), parent_id)
            .sadd(keys::topo_children(parent_id), child_id);
        self.store.apply(batch).await
    }

    pub async fn unlink(&self, parent_id: &str, child_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .del(keys::topo_parent(child_id))
            .srem(keys::topo_children(parent_id), child_id);
        self.store.apply(batch).await
    }

    /// Drop the node's own parent pointer and children set
    pub async fn clear_topology(&self, node_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .del(keys::topo_parent(node_id))
            .del(keys::topo_children(node_id));
        self.store.apply(batch).await
    }

    pub async fn publish_topology(&self, channel_id: &str, event: &TopologyEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.store
            .publish(&keys::topology_channel(channel_id), &payload)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn session_exists(&self, session_id: &str) -> Result<bool> {
        self.store.sismember(keys::SESSIONS_ALL, session_id).await
    }

    pub async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let fields = self.store.hget_all(&keys::session(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        SessionRecord::from_fields(session_id, &fields).map(Some)
    }

    /// Persist the session hash and link it into the global and injection indexes
    pub async fn insert_session(&self, record: &SessionRecord) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .hset(keys::session(&record.session_id), record.to_fields())
            .sadd(keys::SESSIONS_ALL, &record.session_id)
            .sadd(
                keys::node_sessions(&record.injection_node_id),
                &record.session_id,
            );
        self.store.apply(batch).await
    }

    /// Delete the session hash, its egress and hop sets and its index entries
    pub async fn remove_session(&self, record: &SessionRecord) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .del(keys::session(&record.session_id))
            .del(keys::session_egresses(&record.session_id))
            .del(keys::session_hops(&record.session_id))
            .srem(keys::SESSIONS_ALL, &record.session_id)
            .srem(
                keys::node_sessions(&record.injection_node_id),
                &record.session_id,
            );
        self.store.apply(batch).await
    }

    /// Live session ids, sorted
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions = self.store.smembers(keys::SESSIONS_ALL).await?;
        sessions.sort();
        Ok(sessions)
    }

    /// Egresses serving the session, sorted
    pub async fn session_egresses(&self, session_id: &str) -> Result<Vec<String>> {
        let mut egresses = self
            .store
            .smembers(&keys::session_egresses(session_id))
            .await?;
        egresses.sort();
        Ok(egresses)
    }

    pub async fn add_session_egress(&self, session_id: &str, egress_id: &str) -> Result<()> {
        self.store
            .sadd(&keys::session_egresses(session_id), egress_id)
            .await?;
        Ok(())
    }

    pub async fn remove_session_egress(&self, session_id: &str, egress_id: &str) -> Result<()> {
        self.store
            .srem(&keys::session_egresses(session_id), egress_id)
            .await?;
        Ok(())
    }

    /// Nodes below the injection that may hold state for the session, sorted
    pub async fn session_hops(&self, session_id: &str) -> Result<Vec<String>> {
        let mut hops = self.store.smembers(&keys::session_hops(session_id)).await?;
        hops.sort();
        Ok(hops)
    }

    pub async fn track_session_hop(&self, session_id: &str, node_id: &str) -> Result<()> {
        self.store
            .sadd(&keys::session_hops(session_id), node_id)
            .await?;
        Ok(())
    }

    pub async fn untrack_session_hop(&self, session_id: &str, node_id: &str) -> Result<()> {
        self.store
            .srem(&keys::session_hops(session_id), node_id)
            .await?;
        Ok(())
    }

    pub async fn node_serves(&self, node_id: &str, session_id: &str) -> Result<bool> {
        self.store
            .sismember(&keys::node_sessions(node_id), session_id)
            .await
    }

    pub async fn add_node_session(&self, node_id: &str, session_id: &str) -> Result<()> {
        self.store
            .sadd(&keys::node_sessions(node_id), session_id)
            .await?;
        Ok(())
    }

    pub async fn remove_node_session(&self, node_id: &str, session_id: &str) -> Result<()> {
        self.store
            .srem(&keys::node_sessions(node_id), session_id)
            .await?;
        Ok(())
    }

    pub async fn node_session_count(&self, node_id: &str) -> Result<usize> {
        self.store.scard(&keys::node_sessions(node_id)).await
    }

    pub async fn clear_node_sessions(&self, node_id: &str) -> Result<()> {
        self.store.del(&keys::node_sessions(node_id)).await?;
        Ok(())
    }

    pub async fn publish_session(&self, node_id: &str, event: &SessionEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.store
            .publish(&keys::session_channel(node_id), &payload)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    pub async fn add_route(&self, session_id: &str, relay_id: &str, target_id: &str) -> Result<()> {
        self.store
            .sadd(&keys::routes(session_id, relay_id), target_id)
            .await?;
        Ok(())
    }

    pub async fn remove_route(&self, session_id: &str, relay_id: &str, target_id: &str) -> Result<()> {
        self.store
            .srem(&keys::routes(session_id, relay_id), target_id)
            .await?;
        Ok(())
    }

    pub async fn routes(&self, session_id: &str, relay_id: &str) -> Result<Vec<String>> {
        let mut routes = self
            .store
            .smembers(&keys::routes(session_id, relay_id))
            .await?;
        routes.sort();
        Ok(routes)
    }

    pub async fn clear_routes(&self, session_id: &str, relay_id: &str) -> Result<()> {
        self.store.del(&keys::routes(session_id, relay_id)).await?;
        Ok(())
    }

    pub async fn route_count(&self, session_id: &str, relay_id: &str) -> Result<usize> {
        self.store.scard(&keys::routes(session_id, relay_id)).await
    }

    pub async fn save_path(&self, session_id: &str, egress_id: &str, path: &[String]) -> Result<()> {
        self.store
            .set(&keys::path(session_id, egress_id), &path.join(","))
            .await
    }

    pub async fn load_path(&self, session_id: &str, egress_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .store
            .get(&keys::path(session_id, egress_id))
            .await?
            .filter(|raw| !raw.is_empty())
            .map(|raw| raw.split(',').map(str::to_string).collect()))
    }

    pub async fn delete_path(&self, session_id: &str, egress_id: &str) -> Result<()> {
        self.store.del(&keys::path(session_id, egress_id)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trees
    // ------------------------------------------------------------------

    pub async fn tree_exists(&self, tree_id: &str) -> Result<bool> {
        self.store.sismember(keys::TREES_ALL, tree_id).await
    }

    /// Write the metadata hash and index the tree
    pub async fn save_tree(&self, metadata: &TreeMetadata) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .hset(keys::tree_metadata(&metadata.tree_id), metadata.to_fields())
            .sadd(keys::TREES_ALL, &metadata.tree_id);
        self.store.apply(batch).await
    }

    pub async fn load_tree(&self, tree_id: &str) -> Result<Option<TreeMetadata>> {
        let fields = self.store.hget_all(&keys::tree_metadata(tree_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        TreeMetadata::from_fields(tree_id, &fields).map(Some)
    }

    pub async fn set_tree_status(&self, tree_id: &str, status: TreeStatus, at: i64) -> Result<()> {
        let fields = [
            ("status".to_string(), status.to_string()),
            ("updated_at".to_string(), at.to_string()),
        ];
        self.store
            .hset_multiple(&keys::tree_metadata(tree_id), &fields)
            .await
    }

    pub async fn add_tree_member(&self, tree_id: &str, member: &TreeMember) -> Result<()> {
        self.store
            .hset_multiple(
                &keys::tree_nodes(tree_id),
                &[(member.node_id.clone(), member.field_value())],
            )
            .await
    }

    /// Members sorted by layer, then id
    pub async fn tree_members(&self, tree_id: &str) -> Result<Vec<TreeMember>> {
        let fields = self.store.hget_all(&keys::tree_nodes(tree_id)).await?;
        let mut members = fields
            .iter()
            .map(|(node_id, value)| TreeMember::from_field(node_id, value))
            .collect::<Result<Vec<_>>>()?;
        members.sort_by(|a, b| a.layer.cmp(&b.layer).then_with(|| a.node_id.cmp(&b.node_id)));
        Ok(members)
    }

    /// Drop the metadata, the member hash and the index entry
    pub async fn remove_tree(&self, tree_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .del(keys::tree_metadata(tree_id))
            .del(keys::tree_nodes(tree_id))
            .srem(keys::TREES_ALL, tree_id);
        self.store.apply(batch).await
    }

    /// Indexed tree ids, sorted
    pub async fn list_tree_ids(&self) -> Result<Vec<String>> {
        let mut trees = self.store.smembers(keys::TREES_ALL).await?;
        trees.sort();
        Ok(trees)
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    /// Allocate consecutive audio and video SSRCs
    pub async fn next_ssrc_pair(&self) -> Result<(u32, u32)> {
        let audio = self.next_counter(keys::SSRC_COUNTER, keys::SSRC_INITIAL, keys::SSRC_MAX).await?;
        let video = self.next_counter(keys::SSRC_COUNTER, keys::SSRC_INITIAL, keys::SSRC_MAX).await?;
        Ok((audio, video))
    }

    pub async fn next_room_id(&self) -> Result<u32> {
        self.next_counter(keys::ROOM_COUNTER, keys::ROOM_INITIAL, keys::ROOM_MAX)
            .await
    }

    async fn next_counter(&self, key: &str, initial: i64, max: i64) -> Result<u32> {
        let value = self.store.incr_from(key, initial).await?;
        if value > max {
            return Err(Error::InvalidInput(format!(
                "{key} overflow: {value} exceeds {max}"
            )));
        }
        u32::try_from(value).map_err(|_| Error::InvalidInput(format!("{key} out of range: {value}")))
    }

    // ------------------------------------------------------------------
    // Activity
    // ------------------------------------------------------------------

    /// Sessions idle since at or before `cutoff_ms`
    pub async fn idle_sessions(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        self.store
            .zrange_by_score(keys::INACTIVE_SESSIONS, cutoff_ms as f64)
            .await
    }

    pub async fn mark_session_idle(&self, session_id: &str, since_ms: i64) -> Result<()> {
        self.store
            .zadd(keys::INACTIVE_SESSIONS, session_id, since_ms as f64)
            .await
    }

    pub async fn clear_session_idle(&self, session_id: &str) -> Result<()> {
        self.store.zrem(keys::INACTIVE_SESSIONS, session_id).await?;
        Ok(())
    }

    /// `inactive_paths` members idle since at or before `cutoff_ms`
    pub async fn idle_paths(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        self.store
            .zrange_by_score(keys::INACTIVE_PATHS, cutoff_ms as f64)
            .await
    }

    pub async fn mark_path_idle(&self, egress_id: &str, session_id: &str, since_ms: i64) -> Result<()> {
        self.store
            .zadd(
                keys::INACTIVE_PATHS,
                &keys::inactive_path_member(egress_id, session_id),
                since_ms as f64,
            )
            .await
    }

    pub async fn clear_path_idle(&self, member: &str) -> Result<()> {
        self.store.zrem(keys::INACTIVE_PATHS, member).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    /// Latest sample for one container; an absent hash reads as all zeros
    pub async fn metrics(&self, node_id: &str, kind: MetricKind) -> Result<MetricsSample> {
        let fields = self.store.hget_all(&keys::metrics(node_id, kind)).await?;
        Ok(MetricsSample::from_fields(&fields))
    }

    /// Write a metrics hash the way the collector does
    pub async fn record_metrics(
        &self,
        node_id: &str,
        kind: MetricKind,
        fields: &[(String, String)],
    ) -> Result<()> {
        self.store
            .hset_multiple(&keys::metrics(node_id, kind), fields)
            .await
    }
}
