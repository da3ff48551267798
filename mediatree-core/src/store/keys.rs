//! Store key and channel layout
//!
//! These prefixes are shared with the media nodes and the metrics collector
//! and must stay stable.

use crate::models::{MetricKind, NodeKind};

pub const SESSIONS_ALL: &str = "sessions:all";
pub const SSRC_COUNTER: &str = "ssrc_counter";
pub const ROOM_COUNTER: &str = "room_counter";
pub const INACTIVE_SESSIONS: &str = "inactive_sessions";
pub const INACTIVE_PATHS: &str = "inactive_paths";
pub const TREES_ALL: &str = "trees:all";

/// Value `ssrc_counter` starts from; the first allocated SSRC is one above
pub const SSRC_INITIAL: i64 = 9999;
pub const ROOM_INITIAL: i64 = 999;
pub const SSRC_MAX: i64 = 999_999_999;
pub const ROOM_MAX: i64 = 999_999;

#[must_use]
pub fn pool(kind: NodeKind) -> String {
    format!("pool:{kind}")
}

#[must_use]
pub fn pool_load(kind: NodeKind) -> String {
    format!("pool:{kind}:load")
}

#[must_use]
pub fn node(node_id: &str) -> String {
    format!("pool:node:{node_id}")
}

#[must_use]
pub fn node_status(node_id: &str) -> String {
    format!("pool:node:{node_id}:status")
}

#[must_use]
pub fn topo_parent(node_id: &str) -> String {
    format!("topo:parent:{node_id}")
}

#[must_use]
pub fn topo_children(node_id: &str) -> String {
    format!("topo:children:{node_id}")
}

#[must_use]
pub fn session(session_id: &str) -> String {
    format!("session:{session_id}")
}

#[must_use]
pub fn session_egresses(session_id: &str) -> String {
    format!("session:{session_id}:egresses")
}

/// Relays and egresses the session has been pushed to
#[must_use]
pub fn session_hops(session_id: &str) -> String {
    format!("session:{session_id}:hops")
}

#[must_use]
pub fn node_sessions(node_id: &str) -> String {
    format!("node:{node_id}:sessions")
}

#[must_use]
pub fn routes(session_id: &str, node_id: &str) -> String {
    format!("routes:{session_id}:{node_id}")
}

#[must_use]
pub fn path(session_id: &str, egress_id: &str) -> String {
    format!("path:{session_id}:{egress_id}")
}

#[must_use]
pub fn tree_metadata(tree_id: &str) -> String {
    format!("tree:{tree_id}:metadata")
}

/// Hash of member node id to `{kind}:{layer}`
#[must_use]
pub fn tree_nodes(tree_id: &str) -> String {
    format!("tree:{tree_id}:nodes")
}

#[must_use]
pub fn scaling_lock(kind: NodeKind) -> String {
    format!("lock:scaling:{kind}")
}

#[must_use]
pub fn metrics(node_id: &str, kind: MetricKind) -> String {
    format!("metrics:node:{node_id}:{kind}")
}

/// Pub/sub channel carrying session events for one node
#[must_use]
pub fn session_channel(node_id: &str) -> String {
    format!("sessions:{node_id}")
}

/// Pub/sub channel carrying topology events for one node or a whole tree
#[must_use]
pub fn topology_channel(id: &str) -> String {
    format!("topology:{id}")
}

/// Member of `inactive_paths`
#[must_use]
pub fn inactive_path_member(egress_id: &str, session_id: &str) -> String {
    format!("{egress_id}:{session_id}")
}

/// Split an `inactive_paths` member into `(egressId, sessionId)`
///
/// Node ids never contain `:`, so the first separator delimits the egress.
#[must_use]
pub fn parse_inactive_path_member(member: &str) -> Option<(&str, &str)> {
    member
        .split_once(':')
        .filter(|(egress, session)| !egress.is_empty() && !session.is_empty())
}
