//! Tree shape: node pools, parent/child edges, node lifecycle and templates

pub mod manager;
pub mod naming;
pub mod templates;

pub use manager::{PoolSummary, RoleCounts, TreeManager};
pub use naming::next_node_id;
pub use templates::{get_template, list_templates, template_exists, Template, TemplateNode};
