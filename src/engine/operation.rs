//! Tool operations.
//!
//! The tool-handler layer sends one of a closed set of operations. Each is a
//! request type implementing [`Execute`]; [`Operation`] is the tagged union
//! that arrives over the wire.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::fingerprint::RenderOption;
use crate::engine::heartbeat::ProgressSink;
use crate::engine::Engine;
use crate::error::{EngineError, ErrorBody};
use crate::upstream::RangeData;

/// Per-call context supplied by the protocol layer.
#[derive(Clone)]
pub struct CallContext {
    pub session_id: String,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl CallContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Same session, no progress reporting.
    pub(crate) fn silent(&self) -> Self {
        Self::new(self.session_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub resource_id: String,
    pub range: String,
    #[serde(default)]
    pub render_option: RenderOption,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl ReadRequest {
    pub fn new(resource_id: &str, range: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            range: range.to_string(),
            render_option: RenderOption::default(),
            page_size: None,
            cursor: None,
        }
    }

    pub fn paged(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn at_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn render(mut self, render: RenderOption) -> Self {
        self.render_option = render;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub total_rows: u32,
    /// 1-based; 0 when the range is empty.
    pub current_page: u64,
    pub total_pages: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    /// Normalized range actually served.
    pub range: String,
    pub data: RangeData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PageInfo>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub resource_id: String,
    pub range: String,
    pub payload: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResponse {
    pub updated_range: String,
    pub updated_cells: u64,
    pub chunks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReadRequest {
    pub resource_id: String,
    pub ranges: Vec<String>,
    #[serde(default)]
    pub render_option: RenderOption,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RangeOutcome {
    #[serde(rename_all = "camelCase")]
    Ok {
        range: String,
        data: RangeData,
        from_cache: bool,
    },
    Error { range: String, error: ErrorBody },
}

impl RangeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, RangeOutcome::Ok { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReadResponse {
    pub results: Vec<RangeOutcome>,
}

/// A tool call, tagged by `op`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Read(ReadRequest),
    Write(WriteRequest),
    BatchRead(BatchReadRequest),
}

impl Operation {
    pub fn resource_id(&self) -> &str {
        match self {
            Operation::Read(r) => &r.resource_id,
            Operation::Write(w) => &w.resource_id,
            Operation::BatchRead(b) => &b.resource_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OperationOutput {
    Read(ReadResponse),
    Write(WriteResponse),
    BatchRead(BatchReadResponse),
}

#[async_trait]
pub trait Execute {
    type Output;

    async fn execute(self, engine: &Engine, ctx: &CallContext) -> Result<Self::Output, EngineError>;
}

#[async_trait]
impl Execute for ReadRequest {
    type Output = ReadResponse;

    async fn execute(self, engine: &Engine, ctx: &CallContext) -> Result<ReadResponse, EngineError> {
        engine.read(self, ctx).await
    }
}

#[async_trait]
impl Execute for WriteRequest {
    type Output = WriteResponse;

    async fn execute(self, engine: &Engine, ctx: &CallContext) -> Result<WriteResponse, EngineError> {
        engine.write(self, ctx).await
    }
}

#[async_trait]
impl Execute for BatchReadRequest {
    type Output = BatchReadResponse;

    async fn execute(self, engine: &Engine, ctx: &CallContext) -> Result<BatchReadResponse, EngineError> {
        engine.batch_read(self, ctx).await
    }
}

#[async_trait]
impl Execute for Operation {
    type Output = OperationOutput;

    async fn execute(self, engine: &Engine, ctx: &CallContext) -> Result<OperationOutput, EngineError> {
        match self {
            Operation::Read(req) => req.execute(engine, ctx).await.map(OperationOutput::Read),
            Operation::Write(req) => req.execute(engine, ctx).await.map(OperationOutput::Write),
            Operation::BatchRead(req) => req.execute(engine, ctx).await.map(OperationOutput::BatchRead),
        }
    }
}
