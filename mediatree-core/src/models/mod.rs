//! Domain models shared by the store, provisioners and cluster services

pub mod events;
pub mod metrics;
pub mod node;
pub mod session;
pub mod tree;

pub use events::{RouteTarget, SessionEvent, TopologyEvent};
pub use metrics::{MetricKind, MetricsSample};
pub use node::{MediaServerHandle, NodeInfo, NodeKind, NodeRole, NodeSpec, NodeStatus, PortRange};
pub use session::{SessionDetail, SessionInfo, SessionRecord, ViewerInfo};
pub use tree::{Tree, TreeMember, TreeMetadata, TreeStatus, TreeSummary};

/// Current wall-clock time as unix milliseconds
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Random token used as a lock owner value
#[must_use]
pub fn generate_token() -> String {
    nanoid::nanoid!(12)
}
