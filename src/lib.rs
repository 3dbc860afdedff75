pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod rate_limit;
pub mod relay;
pub mod retry;
pub mod server;
pub mod translate;

pub use config::ServiceConfig;
pub use error::{ProxyError, Result};
pub use logging::SharedLogger;
pub use server::{build_router, AppState};
