//! Built-in tree shapes
//!
//! Layer 0 holds injections; each gets its relay root there automatically,
//! so templates never list relays at layer 0. Layer 1 nodes hang under the
//! relay roots, and a node at layer `n > 1` under a relay at layer `n - 1`.

use serde::Serialize;

use mediatree_core::models::NodeKind;
use mediatree_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateNode {
    pub kind: NodeKind,
    pub layer: u32,
    pub count: u32,
}

const fn nodes(kind: NodeKind, layer: u32, count: u32) -> TemplateNode {
    TemplateNode { kind, layer, count }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Template {
    pub name: &'static str,
    pub description: &'static str,
    pub nodes: &'static [TemplateNode],
}

const TEMPLATES: &[Template] = &[
    Template {
        name: "minimal",
        description: "One injection feeding one egress",
        nodes: &[
            nodes(NodeKind::Injection, 0, 1),
            nodes(NodeKind::Egress, 1, 1),
        ],
    },
    Template {
        name: "test-overload",
        description: "One injection fanning out to three egresses",
        nodes: &[
            nodes(NodeKind::Injection, 0, 1),
            nodes(NodeKind::Egress, 1, 3),
        ],
    },
    Template {
        name: "small",
        description: "Two injections, one egress under each root",
        nodes: &[
            nodes(NodeKind::Injection, 0, 2),
            nodes(NodeKind::Egress, 1, 2),
        ],
    },
    Template {
        name: "medium",
        description: "Two injections, a relay layer and egresses at two depths",
        nodes: &[
            nodes(NodeKind::Injection, 0, 2),
            nodes(NodeKind::Relay, 1, 2),
            nodes(NodeKind::Egress, 1, 3),
            nodes(NodeKind::Egress, 2, 3),
        ],
    },
    Template {
        name: "large",
        description: "One injection with a wide relay layer",
        nodes: &[
            nodes(NodeKind::Injection, 0, 1),
            nodes(NodeKind::Relay, 1, 3),
            nodes(NodeKind::Egress, 1, 5),
            nodes(NodeKind::Egress, 2, 4),
        ],
    },
    Template {
        name: "deep",
        description: "Two relay layers, egresses down to layer 3",
        nodes: &[
            nodes(NodeKind::Injection, 0, 1),
            nodes(NodeKind::Relay, 1, 2),
            nodes(NodeKind::Relay, 2, 2),
            nodes(NodeKind::Egress, 1, 2),
            nodes(NodeKind::Egress, 2, 2),
            nodes(NodeKind::Egress, 3, 4),
        ],
    },
    Template {
        name: "test-route",
        description: "Two injections sharing a relay layer, for routing tests",
        nodes: &[
            nodes(NodeKind::Injection, 0, 2),
            nodes(NodeKind::Relay, 1, 2),
            nodes(NodeKind::Egress, 1, 2),
            nodes(NodeKind::Egress, 2, 2),
        ],
    },
];

impl Template {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> {
            Err(Error::InvalidInput(format!("template {}: {reason}", self.name)))
        };

        if self.name.is_empty() {
            return Err(Error::InvalidInput("template name is required".to_string()));
        }
        if self.nodes.is_empty() {
            return invalid("needs at least one node spec".to_string());
        }

        for spec in self.nodes {
            if spec.count == 0 {
                return invalid(format!("{} count at layer {} must be positive", spec.kind, spec.layer));
            }
            match spec.kind {
                NodeKind::Injection if spec.layer != 0 => {
                    return invalid("injections must be at layer 0".to_string());
                }
                NodeKind::Relay if spec.layer == 0 => {
                    return invalid("layer 0 relays come with their injection".to_string());
                }
                NodeKind::Egress if spec.layer == 0 => {
                    return invalid("egresses must be at layer 1 or deeper".to_string());
                }
                _ => {}
            }
            if spec.layer >= 2 && !self.has(NodeKind::Relay, spec.layer - 1) {
                return invalid(format!(
                    "layer {} has no relay at layer {} to hang from",
                    spec.layer,
                    spec.layer - 1
                ));
            }
        }

        if self.nodes_of(NodeKind::Injection).next().is_none() {
            return invalid("needs at least one injection".to_string());
        }
        if self.nodes_of(NodeKind::Egress).next().is_none() {
            return invalid("needs at least one egress".to_string());
        }
        Ok(())
    }

    fn has(&self, kind: NodeKind, layer: u32) -> bool {
        self.nodes.iter().any(|n| n.kind == kind && n.layer == layer)
    }

    /// Nodes the template asks for, relay roots excluded
    #[must_use]
    pub fn total_nodes(&self) -> u32 {
        self.nodes.iter().map(|n| n.count).sum()
    }

    pub fn nodes_of(&self, kind: NodeKind) -> impl Iterator<Item = &TemplateNode> + '_ {
        self.nodes.iter().filter(move |n| n.kind == kind)
    }

    pub fn nodes_at(&self, layer: u32) -> impl Iterator<Item = &TemplateNode> + '_ {
        self.nodes.iter().filter(move |n| n.layer == layer)
    }

    #[must_use]
    pub fn max_layer(&self) -> u32 {
        self.nodes.iter().map(|n| n.layer).max().unwrap_or(0)
    }
}

/// Look up a validated template by name
pub fn get_template(name: &str) -> Result<&'static Template> {
    let template = TEMPLATES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| Error::NotFound(format!("template {name}")))?;
    template.validate()?;
    Ok(template)
}

#[must_use]
pub fn list_templates() -> &'static [Template] {
    TEMPLATES
}

#[must_use]
pub fn template_exists(name: &str) -> bool {
    TEMPLATES.iter().any(|t| t.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates_are_valid() {
        for template in list_templates() {
            template.validate().unwrap();
        }
        assert_eq!(list_templates().len(), 7);
    }

    #[test]
    fn test_lookup() {
        let medium = get_template("medium").unwrap();
        assert_eq!(medium.total_nodes(), 10);
        assert_eq!(medium.max_layer(), 2);
        assert_eq!(medium.nodes_of(NodeKind::Egress).count(), 2);
        assert_eq!(medium.nodes_at(1).map(|n| n.count).sum::<u32>(), 5);

        assert!(template_exists("deep"));
        assert!(!template_exists("huge"));
        assert!(get_template("huge").unwrap_err().is_not_found());
    }

    #[test]
    fn test_validation_rules() {
        let check = |specs: Vec<TemplateNode>| {
            Template {
                name: "custom",
                description: "",
                nodes: Box::leak(specs.into_boxed_slice()),
            }
            .validate()
        };
        let injection = nodes(NodeKind::Injection, 0, 1);

        check(vec![injection, nodes(NodeKind::Egress, 1, 1)]).unwrap();

        // No egress
        assert!(check(vec![injection]).is_err());
        // No injection
        assert!(check(vec![nodes(NodeKind::Relay, 1, 1), nodes(NodeKind::Egress, 2, 1)]).is_err());
        // Roots are implicit
        assert!(check(vec![
            injection,
            nodes(NodeKind::Relay, 0, 1),
            nodes(NodeKind::Egress, 1, 1),
        ])
        .is_err());
        assert!(check(vec![nodes(NodeKind::Injection, 1, 1), nodes(NodeKind::Egress, 1, 1)]).is_err());
        assert!(check(vec![injection, nodes(NodeKind::Egress, 0, 1)]).is_err());
        assert!(check(vec![injection, nodes(NodeKind::Egress, 1, 0)]).is_err());
        // Layer 2 egress without a layer 1 relay
        let err = check(vec![injection, nodes(NodeKind::Egress, 2, 1)]).unwrap_err();
        assert!(err.to_string().contains("hang from"));
    }
}
