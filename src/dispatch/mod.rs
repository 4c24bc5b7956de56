//! Upstream dispatch: everything between a cache miss and the remote API.
//!
//! - [`quota`]: token-bucket governor over the remote API's global budget
//! - [`window`]: AIMD controller for batch window duration
//! - [`batcher`]: window-based coalescing and single-flight

pub mod batcher;
pub mod quota;
pub mod window;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of upstream operation. Batches never mix kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Metadata,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Metadata => "metadata",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
