pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod provisioner;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use provisioner::Provisioner;
pub use store::{MeshState, StateStore};
