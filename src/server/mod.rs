//! HTTP server exposing the engine as tool calls.
//!
//! - [`tool_api`]: routes, handlers and error-to-status mapping
//! - [`streaming`]: SSE progress and result events for long calls

pub mod streaming;
pub mod tool_api;
