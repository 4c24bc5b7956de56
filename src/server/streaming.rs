//! SSE streaming for long tool calls.
//!
//! The call runs in its own task with a progress sink feeding the stream.
//! Clients see zero or more `progress` events, then exactly one `result` or
//! `error` event. A client that disconnects cancels the call.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::engine::heartbeat::{ProgressSignal, ProgressSink};
use crate::engine::operation::{CallContext, Operation, OperationOutput};
use crate::engine::Engine;
use crate::error::ErrorBody;

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Progress(ProgressSignal),
    Result(OperationOutput),
    Error(ErrorBody),
}

impl StreamEvent {
    fn name(&self) -> &'static str {
        match self {
            StreamEvent::Progress(_) => "progress",
            StreamEvent::Result(_) => "result",
            StreamEvent::Error(_) => "error",
        }
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ProgressSink for ChannelSink {
    fn progress(&self, signal: ProgressSignal) {
        let _ = self.tx.send(StreamEvent::Progress(signal));
    }
}

/// Run `op` and stream its progress and outcome as SSE events.
pub fn operation_to_sse_stream(
    engine: Arc<Engine>,
    op: Operation,
    session_id: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let ctx = CallContext::new(session_id).with_progress(Arc::new(ChannelSink { tx: tx.clone() }));
        let outcome = tokio::select! {
            outcome = engine.execute(op, &ctx) => outcome,
            _ = tx.closed() => {
                debug!(session_id = %ctx.session_id, "Stream closed by client, call cancelled");
                return;
            }
        };
        let event = match outcome {
            Ok(output) => StreamEvent::Result(output),
            Err(err) => StreamEvent::Error(ErrorBody::from(&err)),
        };
        let _ = tx.send(event);
    });

    UnboundedReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event(event.name()).data(data))
    })
}
