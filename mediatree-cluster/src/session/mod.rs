//! Session admission, viewer paths and teardown

pub mod cleanup;
pub mod injection_api;
pub mod manager;
pub mod routing;

pub use cleanup::{CleanupJob, CleanupStats};
pub use injection_api::{
    CreateSessionRequest, CreateSessionResponse, HttpInjectionApi, InjectionApi, Recipient,
};
pub use manager::SessionManager;
