use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Compute unit type. Selects the container images, port layout and pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Injection,
    Relay,
    Egress,
}

impl NodeKind {
    pub const ALL: [Self; 3] = [Self::Injection, Self::Relay, Self::Egress];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Injection => "injection",
            Self::Relay => "relay",
            Self::Egress => "egress",
        }
    }

    /// Injection and egress nodes run alongside a media server container
    #[must_use]
    pub const fn needs_media_server(&self) -> bool {
        matches!(self, Self::Injection | Self::Egress)
    }

    /// Prefix used when generating node ids of this kind
    #[must_use]
    pub const fn id_prefix(&self) -> &'static str {
        self.as_str()
    }

    #[must_use]
    pub const fn default_role(&self) -> NodeRole {
        match self {
            Self::Injection => NodeRole::Injection,
            Self::Relay => NodeRole::Standalone,
            Self::Egress => NodeRole::Egress,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "injection" => Ok(Self::Injection),
            "relay" => Ok(Self::Relay),
            "egress" => Ok(Self::Egress),
            other => Err(Error::InvalidInput(format!("unknown node type '{other}'"))),
        }
    }
}

/// Position of a node inside its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Injection,
    /// Relay statically paired with an injection
    Root,
    /// Relay created on its own and attached on demand
    Standalone,
    Egress,
}

impl NodeRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Injection => "injection",
            Self::Root => "root",
            Self::Standalone => "standalone",
            Self::Egress => "egress",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "injection" => Ok(Self::Injection),
            "root" => Ok(Self::Root),
            "standalone" => Ok(Self::Standalone),
            "egress" => Ok(Self::Egress),
            other => Err(Error::InvalidInput(format!("unknown node role '{other}'"))),
        }
    }
}

/// Lifecycle status: `active ⇄ draining → destroying`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Draining,
    Destroying,
}

impl NodeStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Destroying => "destroying",
        }
    }

    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Draining)
                | (Self::Draining, Self::Active)
                | (Self::Active | Self::Draining, Self::Destroying)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "draining" => Ok(Self::Draining),
            "destroying" => Ok(Self::Destroying),
            other => Err(Error::InvalidInput(format!("unknown node status '{other}'"))),
        }
    }
}

/// Request to provision a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub node_id: String,
    pub node_type: NodeKind,
    pub role: NodeRole,
    pub max_slots: u32,
    /// Paired relay root to register alongside an injection
    pub relay_root_id: Option<String>,
}

impl NodeSpec {
    #[must_use]
    pub fn new(node_id: impl Into<String>, node_type: NodeKind, max_slots: u32) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            role: node_type.default_role(),
            max_slots,
            relay_root_id: None,
        }
    }

    #[must_use]
    pub fn with_relay_root(mut self, relay_root_id: impl Into<String>) -> Self {
        self.relay_root_id = Some(relay_root_id.into());
        self
    }
}

/// Inclusive UDP port block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    #[must_use]
    pub const fn len(&self) -> u32 {
        (self.end as u32) - (self.start as u32) + 1
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Media server (videoroom or streaming) running next to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaServerHandle {
    pub container_id: String,
    pub host: String,
    pub http_port: u16,
    pub ws_port: u16,
}

/// Provisioned node record, persisted as the `pool:node:{nodeId}` hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub kind: NodeKind,
    pub role: NodeRole,
    pub max_slots: u32,
    /// Container id or pod name
    pub container_id: String,
    pub internal_host: String,
    pub internal_api_port: u16,
    pub internal_rtp_audio: u16,
    pub internal_rtp_video: u16,
    pub external_host: String,
    pub external_api_port: u16,
    /// Only set for kinds that need a media server
    pub media: Option<MediaServerHandle>,
    pub webrtc: Option<PortRange>,
    /// Unix milliseconds
    pub created_at: i64,
}

impl NodeInfo {
    /// Base URL of the node's control API, reachable inside the mesh network
    #[must_use]
    pub fn internal_api_base(&self) -> String {
        format!("http://{}:{}", self.internal_host, self.internal_api_port)
    }

    #[must_use]
    pub fn whep_endpoint(&self, session_id: &str) -> String {
        format!(
            "http://{}:{}/whep/endpoint/{session_id}",
            self.external_host, self.external_api_port
        )
    }

    /// Hash fields for the `pool:node:{nodeId}` record
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("nodeId".to_string(), self.node_id.clone()),
            ("nodeType".to_string(), self.kind.to_string()),
            ("role".to_string(), self.role.to_string()),
            ("maxSlots".to_string(), self.max_slots.to_string()),
            ("containerId".to_string(), self.container_id.clone()),
            ("internalHost".to_string(), self.internal_host.clone()),
            ("internalApiPort".to_string(), self.internal_api_port.to_string()),
            ("internalRtpAudio".to_string(), self.internal_rtp_audio.to_string()),
            ("internalRtpVideo".to_string(), self.internal_rtp_video.to_string()),
            ("externalHost".to_string(), self.external_host.clone()),
            ("externalApiPort".to_string(), self.external_api_port.to_string()),
            ("createdAt".to_string(), self.created_at.to_string()),
        ];

        if let Some(media) = &self.media {
            fields.push(("mediaContainerId".to_string(), media.container_id.clone()));
            fields.push(("mediaHost".to_string(), media.host.clone()));
            fields.push(("mediaHttpPort".to_string(), media.http_port.to_string()));
            fields.push(("mediaWsPort".to_string(), media.ws_port.to_string()));
        }
        if let Some(range) = &self.webrtc {
            fields.push(("webrtcPortStart".to_string(), range.start.to_string()));
            fields.push(("webrtcPortEnd".to_string(), range.end.to_string()));
        }

        fields
    }

    /// Decode a `pool:node:{nodeId}` hash
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let media = match fields.get("mediaContainerId") {
            Some(container_id) => Some(MediaServerHandle {
                container_id: container_id.clone(),
                host: text(fields, "mediaHost")?,
                http_port: number(fields, "mediaHttpPort")?,
                ws_port: number(fields, "mediaWsPort")?,
            }),
            None => None,
        };
        let webrtc = match fields.get("webrtcPortStart") {
            Some(_) => Some(PortRange {
                start: number(fields, "webrtcPortStart")?,
                end: number(fields, "webrtcPortEnd")?,
            }),
            None => None,
        };

        Ok(Self {
            node_id: text(fields, "nodeId")?,
            kind: text(fields, "nodeType")?.parse()?,
            role: text(fields, "role")?.parse()?,
            max_slots: number(fields, "maxSlots")?,
            container_id: text(fields, "containerId")?,
            internal_host: text(fields, "internalHost")?,
            internal_api_port: number(fields, "internalApiPort")?,
            internal_rtp_audio: number(fields, "internalRtpAudio")?,
            internal_rtp_video: number(fields, "internalRtpVideo")?,
            external_host: text(fields, "externalHost")?,
            external_api_port: number(fields, "externalApiPort")?,
            media,
            webrtc,
            created_at: number(fields, "createdAt")?,
        })
    }
}

fn text(fields: &HashMap<String, String>, name: &str) -> Result<String> {
    fields
        .get(name)
        .cloned()
        .ok_or_else(|| Error::InvalidInput(format!("node record is missing '{name}'")))
}

fn number<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T> {
    let raw = text(fields, name)?;
    raw.parse()
        .map_err(|_| Error::InvalidInput(format!("node record field '{name}' is not a number: {raw}")))
}
