//! Chunk planning.
//!
//! Chunks are horizontal bands of whole rows. Every chunk but the last has the
//! same height: `min(page_size, provider_cell_limit / columns)`.

use crate::range::{CellRange, RangeError};

/// Rows per chunk for a range `columns` wide.
pub fn rows_per_chunk(columns: u32, provider_cell_limit: u64, page_size: u32) -> Result<u32, RangeError> {
    if page_size == 0 {
        return Err(RangeError::ZeroPageSize);
    }
    let by_limit = provider_cell_limit / u64::from(columns.max(1));
    if by_limit == 0 {
        return Err(RangeError::RowExceedsCellLimit {
            columns,
            limit: provider_cell_limit,
        });
    }
    Ok(u64::from(page_size).min(by_limit) as u32)
}

/// Split `range` into ordered chunks that partition it.
pub fn plan_chunks(range: &CellRange, provider_cell_limit: u64, page_size: u32) -> Result<Vec<CellRange>, RangeError> {
    let height = rows_per_chunk(range.columns(), provider_cell_limit, page_size)?;
    let rows = range.rows();

    let mut chunks = Vec::with_capacity(rows.div_ceil(height) as usize);
    let mut offset = 0;
    while offset < rows {
        chunks.push(range.row_slice(offset, height));
        offset += height;
    }
    Ok(chunks)
}

/// Pages needed for `total_rows` rows. An empty range still has no pages.
pub fn total_pages(total_rows: u32, page_size: u32) -> u64 {
    if page_size == 0 {
        return 0;
    }
    u64::from(total_rows.div_ceil(page_size))
}
