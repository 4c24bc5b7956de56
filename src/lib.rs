//! tabular-relay: adaptive batching, caching and quota governance for
//! spreadsheet tool calls.
//!
//! Sits between an AI agent's tool-handler layer and a quota-limited
//! spreadsheet API:
//!   tool call → cache → batch window → quota governor → upstream
//!
//! Large reads are paged with opaque cursors and split into chunks that
//! respect the provider's per-request cell limit.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod paging;
pub mod range;
pub mod server;
pub mod upstream;
