pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod telemetry;
pub mod translate;
pub mod upstream;

pub use config::{config_search_paths, ProxyConfig};
pub use error::{ProxyError, Result};
pub use server::{build_router, AppState};
