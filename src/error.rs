//! Engine error taxonomy.
//!
//! Every variant names the operation kind and the fingerprint it concerns
//! (or the resource and raw input when no fingerprint could be formed).
//! Errors are `Clone` because one window- or quota-level failure is delivered
//! to every waiter of the batch.

use serde::Serialize;
use thiserror::Error;

use crate::dispatch::OperationKind;
use crate::range::RangeError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("{op} on `{resource_id}`: invalid range `{input}`: {source}")]
    InvalidRange {
        op: OperationKind,
        resource_id: String,
        input: String,
        source: RangeError,
    },

    #[error("{op} {fingerprint}: quota exceeded: {reason}")]
    QuotaExceeded {
        op: OperationKind,
        fingerprint: String,
        reason: String,
    },

    #[error("{op} {fingerprint}: cursor invalid: {reason}")]
    CursorInvalid {
        op: OperationKind,
        fingerprint: String,
        reason: String,
    },

    #[error("{op} {fingerprint}: page {page} is out of range ({total_pages} pages)")]
    PageOutOfRange {
        op: OperationKind,
        fingerprint: String,
        page: u64,
        total_pages: u64,
    },

    #[error("{op} {fingerprint}: chunk failed while the rest of its batch succeeded: {message}")]
    PartialBatchFailure {
        op: OperationKind,
        fingerprint: String,
        message: String,
    },

    #[error("{op} {fingerprint}: upstream call timed out after {elapsed_ms} ms")]
    UpstreamTimeout {
        op: OperationKind,
        fingerprint: String,
        elapsed_ms: u64,
        retryable: bool,
    },

    #[error("{op} {fingerprint}: upstream failure: {message}")]
    UpstreamFailure {
        op: OperationKind,
        fingerprint: String,
        message: String,
    },

    #[error("{op} {fingerprint}: batch window not sealed within {waited_ms} ms")]
    BatchWindowTimeout {
        op: OperationKind,
        fingerprint: String,
        waited_ms: u64,
    },

    #[error("{op} {fingerprint}: engine is shutting down")]
    Shutdown { op: OperationKind, fingerprint: String },
}

impl EngineError {
    pub fn invalid_range(op: OperationKind, resource_id: &str, input: &str, source: RangeError) -> Self {
        EngineError::InvalidRange {
            op,
            resource_id: resource_id.to_string(),
            input: input.to_string(),
            source,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRange { .. } => "invalid_range",
            EngineError::QuotaExceeded { .. } => "quota_exceeded",
            EngineError::CursorInvalid { .. } => "cursor_invalid",
            EngineError::PageOutOfRange { .. } => "page_out_of_range",
            EngineError::PartialBatchFailure { .. } => "partial_batch_failure",
            EngineError::UpstreamTimeout { .. } => "upstream_timeout",
            EngineError::UpstreamFailure { .. } => "upstream_failure",
            EngineError::BatchWindowTimeout { .. } => "batch_window_timeout",
            EngineError::Shutdown { .. } => "shutdown",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::QuotaExceeded { .. } | EngineError::BatchWindowTimeout { .. } => true,
            EngineError::UpstreamTimeout { retryable, .. } => *retryable,
            EngineError::PartialBatchFailure { .. } => true,
            EngineError::InvalidRange { .. }
            | EngineError::CursorInvalid { .. }
            | EngineError::PageOutOfRange { .. }
            | EngineError::UpstreamFailure { .. }
            | EngineError::Shutdown { .. } => false,
        }
    }

    pub fn operation(&self) -> OperationKind {
        match self {
            EngineError::InvalidRange { op, .. }
            | EngineError::QuotaExceeded { op, .. }
            | EngineError::CursorInvalid { op, .. }
            | EngineError::PageOutOfRange { op, .. }
            | EngineError::PartialBatchFailure { op, .. }
            | EngineError::UpstreamTimeout { op, .. }
            | EngineError::UpstreamFailure { op, .. }
            | EngineError::BatchWindowTimeout { op, .. }
            | EngineError::Shutdown { op, .. } => *op,
        }
    }
}

/// Serializable view of an error for the tool-handler layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for ErrorBody {
    fn from(err: &EngineError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_operation_and_fingerprint() {
        let err = EngineError::QuotaExceeded {
            op: OperationKind::Read,
            fingerprint: "book:A1:B2[formatted]".into(),
            reason: "queue wait exceeded 500 ms".into(),
        };
        let text = err.to_string();
        assert!(text.starts_with("read book:A1:B2[formatted]"));
        assert!(err.is_retryable());
        assert_eq!(err.code(), "quota_exceeded");
    }

    #[test]
    fn test_write_timeouts_are_not_retryable() {
        let err = EngineError::UpstreamTimeout {
            op: OperationKind::Write,
            fingerprint: "book:A1:A1[formatted]".into(),
            elapsed_ms: 30_000,
            retryable: false,
        };
        assert!(!err.is_retryable());
        assert_eq!(ErrorBody::from(&err).code, "upstream_timeout");
    }

    #[test]
    fn test_invalid_range_keeps_source() {
        let err = EngineError::invalid_range(OperationKind::Read, "book", "A:C", RangeError::BadCell("A".into()));
        assert_eq!(err.operation(), OperationKind::Read);
        assert!(err.to_string().contains("`A:C`"));
        assert!(!err.is_retryable());
    }
}
