//! # hubbub-server
//!
//! HTTP surface of the hubbub chat service: the WebSocket endpoint, the
//! message routes that feed the hub, admin sessions, configuration and
//! metrics.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod policy;
pub mod storage;

pub use config::Config;
pub use error::ApiError;
pub use handlers::{build_router, run_server, serve, AppState};
pub use storage::{MemoryStore, MessageStore, StoreError};
