//! Boundary to the remote tabular-data API.
//!
//! - [`ResourceAccessor`]: the collaborator that executes batched reads and writes
//! - [`memory`]: an in-process accessor used by the binary and the tests

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::fingerprint::RenderOption;
use crate::range::CellRange;

/// Approximate wire size of one cell, used for payload-byte quota estimates.
pub const ESTIMATED_CELL_BYTES: u64 = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("resource `{0}` not found")]
    NotFound(String),

    #[error("provider error {code}: {message}")]
    Provider { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// A rectangular block of cell values, row-major.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeData {
    pub values: Vec<Vec<Value>>,
}

impl RangeData {
    pub fn new(values: Vec<Vec<Value>>) -> Self {
        Self { values }
    }

    pub fn row_count(&self) -> usize {
        self.values.len()
    }

    /// Width of the widest row.
    pub fn column_count(&self) -> usize {
        self.values.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn cell_count(&self) -> u64 {
        self.values.iter().map(|row| row.len() as u64).sum()
    }

    /// Rough serialized size, for quota accounting.
    pub fn estimated_bytes(&self) -> u64 {
        self.values
            .iter()
            .flatten()
            .map(|v| match v {
                Value::String(s) => s.len() as u64 + 2,
                Value::Null => 4,
                _ => 8,
            })
            .sum()
    }

    /// Copy of `count` rows starting at `offset`.
    pub fn slice_rows(&self, offset: usize, count: usize) -> RangeData {
        let rows = self.values.iter().skip(offset).take(count).cloned().collect();
        RangeData { values: rows }
    }

    /// Stack parts vertically, in order.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a RangeData>) -> RangeData {
        let mut values = Vec::new();
        for part in parts {
            values.extend(part.values.iter().cloned());
        }
        RangeData { values }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetMetadata {
    pub title: String,
    pub row_count: u32,
    pub column_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub resource_id: String,
    pub sheets: Vec<SheetMetadata>,
}

impl ResourceMetadata {
    /// Look up a sheet by title, or the first sheet when no title is given.
    pub fn sheet(&self, title: Option<&str>) -> Option<&SheetMetadata> {
        match title {
            Some(title) => self.sheets.iter().find(|s| s.title == title),
            None => self.sheets.first(),
        }
    }
}

/// One range of a batched read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRead {
    pub range: CellRange,
    pub render: RenderOption,
}

/// One range of a batched write.
#[derive(Debug, Clone)]
pub struct ChunkWrite {
    pub range: CellRange,
    pub values: Arc<RangeData>,
}

/// Executes upstream calls against the remote API.
///
/// Batched calls return one outcome per requested chunk, in request order.
/// An `Err` at the outer level means the whole call failed.
#[async_trait]
pub trait ResourceAccessor: Send + Sync {
    async fn metadata(&self, resource_id: &str) -> Result<ResourceMetadata, UpstreamError>;

    async fn batch_read(
        &self,
        resource_id: &str,
        reads: &[ChunkRead],
    ) -> Result<Vec<Result<RangeData, UpstreamError>>, UpstreamError>;

    /// Returns the number of cells written per chunk.
    async fn batch_write(
        &self,
        resource_id: &str,
        writes: &[ChunkWrite],
    ) -> Result<Vec<Result<u64, UpstreamError>>, UpstreamError>;
}

pub type SharedAccessor = Arc<dyn ResourceAccessor>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_range_data_shape() {
        let data = RangeData::new(vec![vec![json!("a"), json!(1)], vec![json!(null)]]);
        assert_eq!(data.row_count(), 2);
        assert_eq!(data.column_count(), 2);
        assert_eq!(data.cell_count(), 3);
        assert_eq!(data.estimated_bytes(), 3 + 8 + 4);
    }

    #[test]
    fn test_slice_and_concat() {
        let data = RangeData::new((0..5).map(|i| vec![json!(i)]).collect());
        let head = data.slice_rows(0, 2);
        let tail = data.slice_rows(2, 10);
        assert_eq!(tail.row_count(), 3);
        assert_eq!(RangeData::concat([&head, &tail]), data);
    }
}
