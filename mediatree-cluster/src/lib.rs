pub mod autoscaler;
pub mod load;
pub mod path;
pub mod selector;
pub mod session;
pub mod tree;

#[cfg(test)]
mod testing;

pub use autoscaler::{Autoscaler, RoleOutcome, TickOutcome};
pub use load::{EgressPoolReport, InjectionPoolReport, LoadCalculator};
pub use path::PathBuilder;
pub use selector::NodeSelector;
pub use session::{CleanupJob, HttpInjectionApi, InjectionApi, SessionManager};
pub use tree::{PoolSummary, Template, TreeManager};
