use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::NodeKind;
use crate::{Error, Result};

/// Lifecycle of a tree built from a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeStatus {
    Creating,
    Active,
    Destroying,
}

impl TreeStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Destroying => "destroying",
        }
    }
}

impl fmt::Display for TreeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TreeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "active" => Ok(Self::Active),
            "destroying" => Ok(Self::Destroying),
            other => Err(Error::InvalidInput(format!("unknown tree status '{other}'"))),
        }
    }
}

/// Hash stored at `tree:{treeId}:metadata`, timestamps in unix seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeMetadata {
    pub tree_id: String,
    pub template: String,
    pub status: TreeStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TreeMetadata {
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("tree_id".to_string(), self.tree_id.clone()),
            ("template".to_string(), self.template.clone()),
            ("status".to_string(), self.status.to_string()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("updated_at".to_string(), self.updated_at.to_string()),
        ]
    }

    pub fn from_fields(tree_id: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            fields.get(name).ok_or_else(|| {
                Error::InvalidInput(format!("tree {tree_id} is missing '{name}'"))
            })
        };
        let seconds = |name: &str| -> Result<i64> {
            get(name)?.parse().map_err(|_| {
                Error::InvalidInput(format!("tree {tree_id} has a malformed '{name}'"))
            })
        };

        Ok(Self {
            tree_id: tree_id.to_string(),
            template: get("template")?.clone(),
            status: get("status")?.parse()?,
            created_at: seconds("created_at")?,
            updated_at: seconds("updated_at")?,
        })
    }
}

/// One node of a tree and the layer it was placed at
///
/// Injections and their relay roots sit at layer 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeMember {
    pub node_id: String,
    pub kind: NodeKind,
    pub layer: u32,
}

impl TreeMember {
    /// Value kept under the node id in `tree:{treeId}:nodes`
    #[must_use]
    pub fn field_value(&self) -> String {
        format!("{}:{}", self.kind, self.layer)
    }

    pub fn from_field(node_id: &str, value: &str) -> Result<Self> {
        let malformed = || Error::InvalidInput(format!("tree member {node_id} is malformed: '{value}'"));
        let (kind, layer) = value.split_once(':').ok_or_else(malformed)?;
        Ok(Self {
            node_id: node_id.to_string(),
            kind: kind.parse()?,
            layer: layer.parse().map_err(|_| malformed())?,
        })
    }
}

/// A tree with its members, sorted by layer then id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tree {
    #[serde(flatten)]
    pub metadata: TreeMetadata,
    pub nodes: Vec<TreeMember>,
}

/// Per-tree counts for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSummary {
    pub tree_id: String,
    pub template: String,
    pub status: TreeStatus,
    pub nodes_count: usize,
    pub injection_count: usize,
    pub relay_count: usize,
    pub egress_count: usize,
    pub max_layer: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Tree {
    #[must_use]
    pub fn summary(&self) -> TreeSummary {
        let count = |kind: NodeKind| self.nodes.iter().filter(|n| n.kind == kind).count();
        TreeSummary {
            tree_id: self.metadata.tree_id.clone(),
            template: self.metadata.template.clone(),
            status: self.metadata.status,
            nodes_count: self.nodes.len(),
            injection_count: count(NodeKind::Injection),
            relay_count: count(NodeKind::Relay),
            egress_count: count(NodeKind::Egress),
            max_layer: self.nodes.iter().map(|n| n.layer).max().unwrap_or(0),
            created_at: self.metadata.created_at,
            updated_at: self.metadata.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_fields() {
        let metadata = TreeMetadata {
            tree_id: "tree-1".to_string(),
            template: "medium".to_string(),
            status: TreeStatus::Creating,
            created_at: 1_700_000_000,
            updated_at: 1_700_000_005,
        };
        let fields: HashMap<String, String> = metadata.to_fields().into_iter().collect();
        assert_eq!(fields["status"], "creating");
        assert_eq!(TreeMetadata::from_fields("tree-1", &fields).unwrap(), metadata);

        let mut broken = fields;
        broken.insert("status".to_string(), "unhealthy".to_string());
        assert!(TreeMetadata::from_fields("tree-1", &broken).is_err());
    }

    #[test]
    fn test_member_field() {
        let member = TreeMember::from_field("relay-2", "relay:1").unwrap();
        assert_eq!(member.kind, NodeKind::Relay);
        assert_eq!(member.layer, 1);
        assert_eq!(member.field_value(), "relay:1");

        assert!(TreeMember::from_field("relay-2", "relay").is_err());
        assert!(TreeMember::from_field("relay-2", "relay:x").is_err());
        assert!(TreeMember::from_field("relay-2", "router:1").is_err());
    }
}
