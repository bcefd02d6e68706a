//! Multi-provider AI orchestration gateway.
//!
//! A single long-running server accepts chat-style requests, routes each to
//! one of several heterogeneous upstream AI backends (HTTP APIs, local CLI
//! subprocesses, or terminal-pane-hosted CLIs), enforces priority,
//! concurrency, retry/fallback, and cache policies across them, persists
//! every lifecycle transition in an embedded SQLite store, and broadcasts
//! typed events to WebSocket subscribers.

pub mod backend;
pub mod cache;
pub mod config;
mod error;
pub mod events;
pub mod executor;
pub mod fingerprint;
pub mod health;
pub mod http;
pub mod limits;
pub mod metrics;
pub mod observability;
pub mod queue;
pub mod server;
pub mod single_flight;
pub mod store;
pub mod types;
pub mod worker;

pub use config::{GatewayConfig, ProviderConfig};
pub use error::{GatewayError, Result};
pub use server::{CancelOutcome, Gateway, SubmitOutcome, SubmitParams};
pub use types::{
    ApiKeyRecord, BackendKind, ErrorKind, GatewayEvent, ProviderHealth, RequestRecord,
    RequestStatus, ResponseRecord, TokenUsage,
};
