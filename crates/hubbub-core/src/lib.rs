//! # hubbub-core
//!
//! Connection lifecycle and broadcast fan-out for the hubbub chat service.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Single-writer registry of live connections and event fan-out
//! - **Connection** - Per-peer outbound queue, identifier and rate limiter
//! - **Pump** - Read and write loops bridging a transport and the hub
//! - **Admission** - Per-address connection ceiling
//! - **RateLimit** - Token bucket for inbound frames
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ register   ┌─────────────┐ payload    ┌─────────────┐
//! │  Read pump  │──────────▶│     Hub     │──────────▶│ Write pump  │
//! └─────────────┘ unregister └─────────────┘ (per conn) └─────────────┘
//!        ▲                          ▲                          │
//!        │ frames                   │ broadcast                ▼ frames
//!   ┌─────────┐              ┌─────────────┐              ┌─────────┐
//!   │  Peer   │              │  Producers  │              │  Peer   │
//!   └─────────┘              └─────────────┘              └─────────┘
//! ```
//!
//! Only the hub's control loop touches the live set. Everything else talks to
//! it through three bounded queues.

pub mod admission;
pub mod connection;
pub mod hub;
pub mod pump;
pub mod rate_limit;

pub use admission::{AdmissionError, AdmissionPermit, IpAdmission};
pub use connection::{Connection, ConnectionHandle, ConnectionId};
pub use hub::{Hub, HubConfig, HubError, HubLoop, HubStats, Registry};
pub use pump::{serve, ExitReason, PumpConfig};
pub use rate_limit::{RateLimitConfig, RateLimiter};
