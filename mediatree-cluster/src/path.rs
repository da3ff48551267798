//! Viewer path resolution
//!
//! A path is the hop list `[injection, relayRoot, relay*, egress]` found by
//! walking parent pointers up from the egress.

use std::collections::HashSet;

use mediatree_core::{Error, MeshState, Result};

#[derive(Clone)]
pub struct PathBuilder {
    mesh: MeshState,
    max_hops: usize,
}

impl PathBuilder {
    #[must_use]
    pub const fn new(mesh: MeshState, max_hops: usize) -> Self {
        Self { mesh, max_hops }
    }

    /// Resolve the hop list from `injection_id` down to `egress_id`
    pub async fn build(
        &self,
        injection_id: &str,
        relay_root_id: &str,
        egress_id: &str,
    ) -> Result<Vec<String>> {
        let mut path = vec![egress_id.to_string()];
        let mut current = egress_id.to_string();

        while current != injection_id {
            if path.len() > self.max_hops {
                return Err(Error::TopologyBroken(format!(
                    "no path from {egress_id} to {injection_id} within {} hops",
                    self.max_hops
                )));
            }

            let parent = self.parent_of(&current, injection_id).await?;
            if path.contains(&parent) {
                return Err(Error::TopologyBroken(format!(
                    "cycle through {parent} above {egress_id}"
                )));
            }
            path.push(parent.clone());
            current = parent;
        }

        path.reverse();
        validate_path(&path, injection_id, relay_root_id, egress_id)?;
        Ok(path)
    }

    /// Upstream of `node_id`
    ///
    /// The parent pointer must agree with the parent's children set. When it
    /// does not, the node hangs under more than one parent; only the
    /// injection is an acceptable choice then.
    async fn parent_of(&self, node_id: &str, injection_id: &str) -> Result<String> {
        let parent = self
            .mesh
            .parent(node_id)
            .await?
            .ok_or_else(|| Error::TopologyBroken(format!("{node_id} has no parent")))?;

        if self.mesh.children(&parent).await?.iter().any(|c| c == node_id) {
            return Ok(parent);
        }
        if parent != injection_id
            && self
                .mesh
                .children(injection_id)
                .await?
                .iter()
                .any(|c| c == node_id)
        {
            return Ok(injection_id.to_string());
        }
        Err(Error::TopologyBroken(format!(
            "ambiguous parent for {node_id}: pointer says {parent}"
        )))
    }
}

/// Structural checks every stored path must pass
pub fn validate_path(
    path: &[String],
    injection_id: &str,
    relay_root_id: &str,
    egress_id: &str,
) -> Result<()> {
    let (Some(first), Some(last)) = (path.first(), path.last()) else {
        return Err(Error::TopologyBroken("empty path".to_string()));
    };
    if path.len() < 2 {
        return Err(Error::TopologyBroken(format!("path {path:?} has no egress")));
    }
    if first != injection_id {
        return Err(Error::TopologyBroken(format!(
            "path starts at {first}, expected {injection_id}"
        )));
    }
    if last != egress_id {
        return Err(Error::TopologyBroken(format!(
            "path ends at {last}, expected {egress_id}"
        )));
    }
    if path.len() > 2 && path[1] != relay_root_id {
        return Err(Error::TopologyBroken(format!(
            "path enters through {}, expected relay root {relay_root_id}",
            path[1]
        )));
    }

    let mut seen = HashSet::new();
    if let Some(dup) = path.iter().find(|hop| !seen.insert(hop.as_str())) {
        return Err(Error::TopologyBroken(format!("{dup} appears twice in path")));
    }
    Ok(())
}

/// Hops strictly between the injection and the egress
#[must_use]
pub fn extract_relay_nodes(path: &[String]) -> &[String] {
    if path.len() < 2 {
        return &[];
    }
    &path[1..path.len() - 1]
}

#[must_use]
pub fn next_hop<'a>(path: &'a [String], node_id: &str) -> Option<&'a str> {
    let index = path.iter().position(|hop| hop == node_id)?;
    path.get(index + 1).map(String::as_str)
}
