//! In-process [`ResourceAccessor`] backed by a map of workbooks.
//!
//! Stands in for the remote API: it honours sheet bounds, renders values,
//! can inject latency and per-range failures, and counts the calls it serves.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::fingerprint::RenderOption;
use crate::range::{column_name, CellRange};
use crate::upstream::{
    ChunkRead, ChunkWrite, RangeData, ResourceAccessor, ResourceMetadata, SheetMetadata,
    UpstreamError,
};

/// Sheet definition used to seed a workbook.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSeed {
    pub title: String,
    pub row_count: u32,
    pub column_count: u32,

    /// Fill unset cells with their own A1 label (`C17`).
    #[serde(default)]
    pub generated: bool,

    /// Dense values anchored at A1.
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

#[derive(Debug)]
struct SheetState {
    title: String,
    row_count: u32,
    column_count: u32,
    generated: bool,
    cells: HashMap<(u32, u32), Value>,
}

impl SheetState {
    fn from_seed(seed: SheetSeed) -> Self {
        let mut cells = HashMap::new();
        for (r, row) in seed.values.into_iter().enumerate() {
            for (c, value) in row.into_iter().enumerate() {
                cells.insert((r as u32 + 1, c as u32 + 1), value);
            }
        }
        Self {
            title: seed.title,
            row_count: seed.row_count,
            column_count: seed.column_count,
            generated: seed.generated,
            cells,
        }
    }

    fn metadata(&self) -> SheetMetadata {
        SheetMetadata {
            title: self.title.clone(),
            row_count: self.row_count,
            column_count: self.column_count,
        }
    }

    fn read(&self, range: &CellRange, render: RenderOption) -> RangeData {
        let last_row = range.end_row.min(self.row_count);
        let last_col = range.end_col.min(self.column_count);
        if range.start_row > last_row || range.start_col > last_col {
            return RangeData::default();
        }

        let values = (range.start_row..=last_row)
            .map(|row| {
                (range.start_col..=last_col)
                    .map(|col| render_value(self.cell(row, col), render))
                    .collect()
            })
            .collect();
        RangeData::new(values)
    }

    fn cell(&self, row: u32, col: u32) -> Value {
        match self.cells.get(&(row, col)) {
            Some(value) => value.clone(),
            None if self.generated => Value::String(format!("{}{row}", column_name(col))),
            None => Value::Null,
        }
    }

    fn write(&mut self, range: &CellRange, data: &RangeData) -> u64 {
        let mut written = 0;
        for (r, row) in data.values.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                let key = (range.start_row + r as u32, range.start_col + c as u32);
                self.cells.insert(key, value.clone());
                written += 1;
            }
        }
        // Writes past the edge grow the grid, as the provider does.
        self.row_count = self.row_count.max(range.end_row);
        self.column_count = self.column_count.max(range.end_col);
        written
    }
}

fn render_value(value: Value, render: RenderOption) -> Value {
    match (value, render) {
        (Value::Null, _) => Value::String(String::new()),
        (Value::String(s), _) => Value::String(s),
        (other, RenderOption::FormattedValue) => Value::String(other.to_string()),
        (other, _) => other,
    }
}

/// Per-call counters, for observing how much upstream traffic the engine caused.
#[derive(Debug, Default)]
pub struct AccessorCounters {
    pub metadata_calls: AtomicU64,
    pub read_calls: AtomicU64,
    pub ranges_read: AtomicU64,
    pub write_calls: AtomicU64,
}

#[derive(Debug, Default)]
pub struct MemoryAccessor {
    workbooks: RwLock<HashMap<String, Vec<SheetState>>>,
    latency: Mutex<Duration>,
    failing: Mutex<HashSet<String>>,
    next_call_error: Mutex<Option<UpstreamError>>,
    counters: AccessorCounters,
}

impl MemoryAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load workbooks from a JSON file of `{ "<resource id>": [SheetSeed, ...] }`.
    pub fn from_seed_file(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let seeds: HashMap<String, Vec<SheetSeed>> = serde_json::from_str(&data)?;
        let accessor = Self::new();
        for (resource_id, sheets) in seeds {
            for sheet in sheets {
                accessor.add_sheet(&resource_id, sheet);
            }
        }
        Ok(accessor)
    }

    pub fn add_sheet(&self, resource_id: &str, seed: SheetSeed) {
        self.workbooks
            .write()
            .entry(resource_id.to_string())
            .or_default()
            .push(SheetState::from_seed(seed));
    }

    /// Add a sheet whose cells hold their own A1 labels.
    pub fn add_generated_sheet(&self, resource_id: &str, title: &str, rows: u32, columns: u32) {
        self.add_sheet(
            resource_id,
            SheetSeed {
                title: title.to_string(),
                row_count: rows,
                column_count: columns,
                generated: true,
                values: Vec::new(),
            },
        );
    }

    /// Change a sheet's row count, as if rows were appended or deleted remotely.
    pub fn resize_rows(&self, resource_id: &str, title: &str, rows: u32) {
        if let Some(sheets) = self.workbooks.write().get_mut(resource_id) {
            if let Some(sheet) = sheets.iter_mut().find(|s| s.title == title) {
                sheet.row_count = rows;
            }
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Make every read of exactly this range fail with a provider error.
    pub fn fail_range(&self, resource_id: &str, range: &CellRange) {
        self.failing.lock().insert(format!("{resource_id}:{range}"));
    }

    /// Fail the next batched call as a whole.
    pub fn fail_next_call(&self, error: UpstreamError) {
        *self.next_call_error.lock() = Some(error);
    }

    pub fn counters(&self) -> &AccessorCounters {
        &self.counters
    }

    pub fn read_calls(&self) -> u64 {
        self.counters.read_calls.load(Ordering::Relaxed)
    }

    pub fn write_calls(&self) -> u64 {
        self.counters.write_calls.load(Ordering::Relaxed)
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_call_error(&self) -> Option<UpstreamError> {
        self.next_call_error.lock().take()
    }
}

fn sheet_index(sheets: &[SheetState], title: Option<&str>) -> Option<usize> {
    match title {
        Some(title) => sheets.iter().position(|s| s.title == title),
        None if sheets.is_empty() => None,
        None => Some(0),
    }
}

fn unknown_sheet(range: &CellRange) -> UpstreamError {
    UpstreamError::Provider {
        code: 400,
        message: format!("Unable to parse range: {range}"),
    }
}

#[async_trait]
impl ResourceAccessor for MemoryAccessor {
    async fn metadata(&self, resource_id: &str) -> Result<ResourceMetadata, UpstreamError> {
        self.counters.metadata_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        let workbooks = self.workbooks.read();
        let sheets = workbooks
            .get(resource_id)
            .ok_or_else(|| UpstreamError::NotFound(resource_id.to_string()))?;
        Ok(ResourceMetadata {
            resource_id: resource_id.to_string(),
            sheets: sheets.iter().map(SheetState::metadata).collect(),
        })
    }

    async fn batch_read(
        &self,
        resource_id: &str,
        reads: &[ChunkRead],
    ) -> Result<Vec<Result<RangeData, UpstreamError>>, UpstreamError> {
        self.counters.read_calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .ranges_read
            .fetch_add(reads.len() as u64, Ordering::Relaxed);
        self.simulate_latency().await;

        if let Some(error) = self.take_call_error() {
            return Err(error);
        }

        let failing = self.failing.lock().clone();
        let workbooks = self.workbooks.read();
        let sheets = workbooks
            .get(resource_id)
            .ok_or_else(|| UpstreamError::NotFound(resource_id.to_string()))?;

        debug!(resource_id, ranges = reads.len(), "Serving batched read");

        Ok(reads
            .iter()
            .map(|read| {
                if failing.contains(&format!("{resource_id}:{}", read.range)) {
                    return Err(UpstreamError::Provider {
                        code: 500,
                        message: format!("internal error reading {}", read.range),
                    });
                }
                let index = sheet_index(sheets, read.range.sheet.as_deref())
                    .ok_or_else(|| unknown_sheet(&read.range))?;
                Ok(sheets[index].read(&read.range, read.render))
            })
            .collect())
    }

    async fn batch_write(
        &self,
        resource_id: &str,
        writes: &[ChunkWrite],
    ) -> Result<Vec<Result<u64, UpstreamError>>, UpstreamError> {
        self.counters.write_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        if let Some(error) = self.take_call_error() {
            return Err(error);
        }

        let mut workbooks = self.workbooks.write();
        let sheets = workbooks
            .get_mut(resource_id)
            .ok_or_else(|| UpstreamError::NotFound(resource_id.to_string()))?;

        Ok(writes
            .iter()
            .map(|write| {
                let index = sheet_index(sheets, write.range.sheet.as_deref())
                    .ok_or_else(|| unknown_sheet(&write.range))?;
                Ok(sheets[index].write(&write.range, &write.values))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reads(ranges: &[&str]) -> Vec<ChunkRead> {
        ranges
            .iter()
            .map(|r| ChunkRead {
                range: CellRange::parse(r).unwrap(),
                render: RenderOption::FormattedValue,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_generated_values_and_bounds() {
        let accessor = MemoryAccessor::new();
        accessor.add_generated_sheet("book", "Sheet1", 3, 2);

        let out = accessor.batch_read("book", &reads(&["A2:C9"])).await.unwrap();
        let data = out[0].as_ref().unwrap();
        assert_eq!(
            data.values,
            vec![vec![json!("A2"), json!("B2")], vec![json!("A3"), json!("B3")]]
        );
        assert_eq!(accessor.read_calls(), 1);
    }

    #[tokio::test]
    async fn test_write_then_read_and_render() {
        let accessor = MemoryAccessor::new();
        accessor.add_generated_sheet("book", "Sheet1", 10, 5);

        let write = ChunkWrite {
            range: CellRange::parse("B2:C2").unwrap(),
            values: std::sync::Arc::new(RangeData::new(vec![vec![json!(7), json!("x")]])),
        };
        let written = accessor.batch_write("book", &[write]).await.unwrap();
        assert_eq!(written[0], Ok(2));

        let formatted = accessor.batch_read("book", &reads(&["B2:C2"])).await.unwrap();
        assert_eq!(formatted[0].as_ref().unwrap().values[0], vec![json!("7"), json!("x")]);

        let raw = accessor
            .batch_read(
                "book",
                &[ChunkRead {
                    range: CellRange::parse("B2").unwrap(),
                    render: RenderOption::UnformattedValue,
                }],
            )
            .await
            .unwrap();
        assert_eq!(raw[0].as_ref().unwrap().values[0], vec![json!(7)]);
    }

    #[tokio::test]
    async fn test_failure_injection_is_per_range() {
        let accessor = MemoryAccessor::new();
        accessor.add_generated_sheet("book", "Sheet1", 10, 5);
        accessor.fail_range("book", &CellRange::parse("A1:A2").unwrap());

        let out = accessor
            .batch_read("book", &reads(&["A1:A2", "B1:B2", "Missing!A1"]))
            .await
            .unwrap();
        assert!(out[0].is_err());
        assert!(out[1].is_ok());
        assert!(out[2].is_err());

        accessor.fail_next_call(UpstreamError::Transport("reset".into()));
        assert!(accessor.batch_read("book", &reads(&["B1"])).await.is_err());
        assert!(accessor.batch_read("book", &reads(&["B1"])).await.is_ok());
    }
}
