use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Downstream hop a relay forwards a session to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTarget {
    pub target_id: String,
    pub host: String,
    pub audio_port: u16,
    pub video_port: u16,
}

/// Events published on `sessions:{nodeId}`
///
/// Media nodes treat these as at-least-once: a repeated `route-added` for the
/// same target and a `session-destroyed` for an unknown session are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// Start handling a session. `routes` is `null` for terminal sinks.
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        audio_ssrc: u32,
        video_ssrc: u32,
        routes: Option<Vec<RouteTarget>>,
    },

    /// Add a forwarding branch to a session the relay already serves
    #[serde(rename_all = "camelCase")]
    RouteAdded { session_id: String, target_id: String },

    /// Drop one forwarding branch; other branches stay up
    #[serde(rename_all = "camelCase")]
    RouteRemoved { session_id: String, target_id: String },

    #[serde(rename_all = "camelCase")]
    SessionDestroyed { session_id: String },
}

impl SessionEvent {
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::RouteAdded { session_id, .. }
            | Self::RouteRemoved { session_id, .. }
            | Self::SessionDestroyed { session_id } => session_id,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session-created",
            Self::RouteAdded { .. } => "route-added",
            Self::RouteRemoved { .. } => "route-removed",
            Self::SessionDestroyed { .. } => "session-destroyed",
        }
    }
}

/// Events published on `topology:{nodeId}` and `topology:{treeId}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TopologyEvent {
    /// The node's upstream changed; `parent_id` is `None` once detached
    #[serde(rename_all = "camelCase")]
    ParentChanged {
        node_id: String,
        parent_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    ChildAdded {
        node_id: String,
        child_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    ChildRemoved {
        node_id: String,
        child_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Broadcast on the tree channel after a bootstrap
    #[serde(rename_all = "camelCase")]
    TopologyReset {
        tree_id: String,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_created_wire_format() {
        let event = SessionEvent::SessionCreated {
            session_id: "sess-A".to_string(),
            audio_ssrc: 10000,
            video_ssrc: 10001,
            routes: Some(vec![RouteTarget {
                target_id: "eg-1".to_string(),
                host: "eg-1".to_string(),
                audio_port: 5002,
                video_port: 5004,
            }]),
        };

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "session-created",
                "sessionId": "sess-A",
                "audioSsrc": 10000,
                "videoSsrc": 10001,
                "routes": [{"targetId": "eg-1", "host": "eg-1", "audioPort": 5002, "videoPort": 5004}]
            })
        );
    }

    #[test]
    fn test_terminal_sink_has_null_routes() {
        let event = SessionEvent::SessionCreated {
            session_id: "sess-A".to_string(),
            audio_ssrc: 10000,
            video_ssrc: 10001,
            routes: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value["routes"].is_null());
        assert!(value.as_object().unwrap().contains_key("routes"));
    }

    #[test]
    fn test_route_events() {
        let added: SessionEvent = serde_json::from_value(json!({
            "type": "route-added",
            "sessionId": "sess-A",
            "targetId": "eg-2"
        }))
        .unwrap();
        assert_eq!(
            added,
            SessionEvent::RouteAdded {
                session_id: "sess-A".to_string(),
                target_id: "eg-2".to_string()
            }
        );
        assert_eq!(added.kind(), "route-added");
        assert_eq!(added.session_id(), "sess-A");
    }

    #[test]
    fn test_topology_event_tag() {
        let event = TopologyEvent::ChildAdded {
            node_id: "injection-1".to_string(),
            child_id: "relay-root-1".to_string(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "child-added");
        assert_eq!(value["childId"], "relay-root-1");
    }
}
