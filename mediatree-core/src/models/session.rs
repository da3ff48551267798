use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, Result};

/// Session metadata stored at `session:{sessionId}`
///
/// `active` is encoded as `"true"`/`"false"` and `createdAt` as unix
/// milliseconds. Older writers used `"1"` for `active`; both are accepted on
/// read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub injection_node_id: String,
    pub relay_root_id: String,
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
    pub room_id: u32,
    pub active: bool,
    pub created_at: i64,
}

impl SessionRecord {
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("injectionNodeId".to_string(), self.injection_node_id.clone()),
            ("relayRootId".to_string(), self.relay_root_id.clone()),
            ("audioSsrc".to_string(), self.audio_ssrc.to_string()),
            ("videoSsrc".to_string(), self.video_ssrc.to_string()),
            ("roomId".to_string(), self.room_id.to_string()),
            ("active".to_string(), self.active.to_string()),
            ("createdAt".to_string(), self.created_at.to_string()),
        ]
    }

    pub fn from_fields(session_id: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            fields.get(name).ok_or_else(|| {
                Error::InvalidInput(format!("session {session_id} is missing '{name}'"))
            })
        };
        let parse = |name: &str| -> Result<u32> {
            get(name)?.parse().map_err(|_| {
                Error::InvalidInput(format!("session {session_id} has a malformed '{name}'"))
            })
        };

        Ok(Self {
            session_id: session_id.to_string(),
            injection_node_id: get("injectionNodeId")?.clone(),
            relay_root_id: get("relayRootId")?.clone(),
            audio_ssrc: parse("audioSsrc")?,
            video_ssrc: parse("videoSsrc")?,
            room_id: parse("roomId")?,
            active: matches!(get("active")?.as_str(), "true" | "1"),
            created_at: get("createdAt")?.parse().map_err(|_| {
                Error::InvalidInput(format!("session {session_id} has a malformed 'createdAt'"))
            })?,
        })
    }
}

/// Result of admitting a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub injection_node_id: String,
    pub relay_root_id: String,
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
    pub room_id: u32,
    pub whip_endpoint: String,
    pub active: bool,
    pub created_at: i64,
}

/// Result of placing a viewer on an egress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerInfo {
    pub session_id: String,
    pub egress_node_id: String,
    pub egress_port: u16,
    pub whep_endpoint: String,
    pub path: Vec<String>,
    pub reused: bool,
}

/// Session record plus the egresses currently serving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: SessionRecord,
    pub egresses: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord {
            session_id: "sess-A".to_string(),
            injection_node_id: "inj-1".to_string(),
            relay_root_id: "relay-root-1".to_string(),
            audio_ssrc: 10000,
            video_ssrc: 10001,
            room_id: 1000,
            active: true,
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_canonical_encoding() {
        let fields: HashMap<String, String> = record().to_fields().into_iter().collect();
        assert_eq!(fields["active"], "true");
        assert_eq!(fields["createdAt"], "1700000000000");
        assert_eq!(SessionRecord::from_fields("sess-A", &fields).unwrap(), record());
    }

    #[test]
    fn test_legacy_active_flag() {
        let mut fields: HashMap<String, String> = record().to_fields().into_iter().collect();
        fields.insert("active".to_string(), "1".to_string());
        assert!(SessionRecord::from_fields("sess-A", &fields).unwrap().active);

        fields.insert("active".to_string(), "false".to_string());
        assert!(!SessionRecord::from_fields("sess-A", &fields).unwrap().active);
    }

    #[test]
    fn test_malformed_ssrc() {
        let mut fields: HashMap<String, String> = record().to_fields().into_iter().collect();
        fields.insert("audioSsrc".to_string(), "abc".to_string());
        assert!(SessionRecord::from_fields("sess-A", &fields).is_err());
    }

    #[test]
    fn test_viewer_info_json() {
        let viewer = ViewerInfo {
            session_id: "sess-A".to_string(),
            egress_node_id: "eg-1".to_string(),
            egress_port: 7072,
            whep_endpoint: "http://localhost:7072/whep/endpoint/sess-A".to_string(),
            path: vec!["inj-1".to_string(), "relay-root-1".to_string(), "eg-1".to_string()],
            reused: false,
        };
        let json = serde_json::to_value(&viewer).unwrap();
        assert_eq!(json["egressNodeId"], "eg-1");
        assert_eq!(json["reused"], false);
    }
}
