//! A1-notation cell ranges.
//!
//! Every range entering the relay is parsed into a [`CellRange`], which is the
//! normalized form used for keying, chunking and cursor bases. Two inputs that
//! denote the same cell set (`$a$1:B2`, `B2:A1`, ` A1:b2 `) parse to equal
//! values and render to the same canonical string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest row index accepted.
pub const MAX_ROWS: u32 = 10_000_000;

/// Largest column index accepted (`ZZZ`).
pub const MAX_COLUMNS: u32 = 18_278;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("range is empty")]
    Empty,

    #[error("malformed cell reference `{0}`")]
    BadCell(String),

    #[error("unterminated quoted sheet name")]
    UnterminatedSheet,

    #[error("sheet name is empty")]
    EmptySheet,

    #[error("row {0} is outside 1..={MAX_ROWS}")]
    RowOutOfBounds(u64),

    #[error("column `{0}` is outside A..=ZZZ")]
    ColumnOutOfBounds(String),

    #[error("one row of {columns} columns exceeds the provider limit of {limit} cells")]
    RowExceedsCellLimit { columns: u32, limit: u64 },

    #[error("page size must be at least 1")]
    ZeroPageSize,

    #[error("sheet `{0}` does not exist")]
    UnknownSheet(String),

    #[error("payload is {rows}x{columns} but the range is {expected_rows}x{expected_columns}")]
    PayloadShape {
        rows: usize,
        columns: usize,
        expected_rows: u32,
        expected_columns: u32,
    },
}

/// A bounded rectangle of cells, 1-based and inclusive on both corners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellRange {
    pub sheet: Option<String>,
    pub start_row: u32,
    pub start_col: u32,
    pub end_row: u32,
    pub end_col: u32,
}

impl CellRange {
    /// Build a range from corners given in any order.
    pub fn new(sheet: Option<String>, row_a: u32, col_a: u32, row_b: u32, col_b: u32) -> Self {
        Self {
            sheet,
            start_row: row_a.min(row_b),
            start_col: col_a.min(col_b),
            end_row: row_a.max(row_b),
            end_col: col_a.max(col_b),
        }
    }

    /// Parse an A1-notation range.
    pub fn parse(input: &str) -> Result<Self, RangeError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RangeError::Empty);
        }

        let (sheet, cells) = split_sheet(input)?;
        if cells.is_empty() {
            return Err(RangeError::Empty);
        }

        let (first, second) = cells.split_once(':').unwrap_or((cells, cells));
        let (row_a, col_a) = parse_cell(first)?;
        let (row_b, col_b) = parse_cell(second)?;

        Ok(Self::new(sheet, row_a, col_a, row_b, col_b))
    }

    /// Number of rows covered.
    pub fn rows(&self) -> u32 {
        self.end_row - self.start_row + 1
    }

    /// Number of columns covered.
    pub fn columns(&self) -> u32 {
        self.end_col - self.start_col + 1
    }

    pub fn cell_count(&self) -> u64 {
        u64::from(self.rows()) * u64::from(self.columns())
    }

    /// Sub-range of `count` rows starting `offset` rows below the top edge,
    /// clipped to this range's bottom edge.
    pub fn row_slice(&self, offset: u32, count: u32) -> CellRange {
        let start_row = self.start_row.saturating_add(offset).min(self.end_row);
        let end_row = start_row
            .saturating_add(count.max(1) - 1)
            .min(self.end_row);
        CellRange {
            sheet: self.sheet.clone(),
            start_row,
            start_col: self.start_col,
            end_row,
            end_col: self.end_col,
        }
    }

    /// Rows of this range that exist in a sheet holding `sheet_rows` rows.
    pub fn rows_within(&self, sheet_rows: u32) -> u32 {
        if sheet_rows < self.start_row {
            return 0;
        }
        self.end_row.min(sheet_rows) - self.start_row + 1
    }

    /// Move the top-left corner by the given offsets and resize to
    /// `rows` x `columns`. Returns `None` when the result leaves the grid.
    pub fn shifted(&self, row_offset: i64, col_offset: i64, rows: u32, columns: u32) -> Option<CellRange> {
        let start_row = i64::from(self.start_row) + row_offset;
        let start_col = i64::from(self.start_col) + col_offset;
        let end_row = start_row + i64::from(rows) - 1;
        let end_col = start_col + i64::from(columns) - 1;

        if start_row < 1 || start_col < 1 || rows == 0 || columns == 0 {
            return None;
        }
        if end_row > i64::from(MAX_ROWS) || end_col > i64::from(MAX_COLUMNS) {
            return None;
        }

        Some(CellRange {
            sheet: self.sheet.clone(),
            start_row: start_row as u32,
            start_col: start_col as u32,
            end_row: end_row as u32,
            end_col: end_col as u32,
        })
    }

    /// Whether the two ranges share at least one cell.
    pub fn overlaps(&self, other: &CellRange) -> bool {
        self.sheet == other.sheet
            && self.start_row <= other.end_row
            && other.start_row <= self.end_row
            && self.start_col <= other.end_col
            && other.start_col <= self.end_col
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sheet) = &self.sheet {
            if needs_quotes(sheet) {
                write!(f, "'{}'!", sheet.replace('\'', "''"))?;
            } else {
                write!(f, "{sheet}!")?;
            }
        }
        write!(
            f,
            "{}{}:{}{}",
            column_name(self.start_col),
            self.start_row,
            column_name(self.end_col),
            self.end_row
        )
    }
}

impl FromStr for CellRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CellRange {
    type Error = RangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CellRange> for String {
    fn from(range: CellRange) -> Self {
        range.to_string()
    }
}

/// Column letters for a 1-based column index (`1 → A`, `27 → AA`).
pub fn column_name(mut index: u32) -> String {
    let mut letters = Vec::with_capacity(3);
    while index > 0 {
        let rem = (index - 1) % 26;
        letters.push(b'A' + rem as u8);
        index = (index - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

fn needs_quotes(sheet: &str) -> bool {
    !sheet.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        || sheet.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn split_sheet(input: &str) -> Result<(Option<String>, &str), RangeError> {
    if let Some(rest) = input.strip_prefix('\'') {
        let mut name = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((i, ch)) = chars.next() {
            if ch != '\'' {
                name.push(ch);
                continue;
            }
            // '' is an escaped quote inside the name.
            if matches!(chars.peek(), Some((_, '\''))) {
                chars.next();
                name.push('\'');
                continue;
            }
            let after = &rest[i + 1..];
            let cells = after
                .strip_prefix('!')
                .ok_or_else(|| RangeError::BadCell(after.to_string()))?;
            if name.is_empty() {
                return Err(RangeError::EmptySheet);
            }
            return Ok((Some(name), cells.trim()));
        }
        return Err(RangeError::UnterminatedSheet);
    }

    match input.rsplit_once('!') {
        Some((sheet, cells)) => {
            let sheet = sheet.trim();
            if sheet.is_empty() {
                return Err(RangeError::EmptySheet);
            }
            Ok((Some(sheet.to_string()), cells.trim()))
        }
        None => Ok((None, input)),
    }
}

fn parse_cell(cell: &str) -> Result<(u32, u32), RangeError> {
    let cleaned: String = cell.trim().chars().filter(|c| *c != '$').collect();
    let split = cleaned
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| RangeError::BadCell(cell.to_string()))?;
    let (letters, digits) = cleaned.split_at(split);

    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(RangeError::BadCell(cell.to_string()));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(RangeError::BadCell(cell.to_string()));
    }
    if letters.len() > 3 {
        return Err(RangeError::ColumnOutOfBounds(letters.to_ascii_uppercase()));
    }

    let col = letters
        .chars()
        .fold(0u32, |acc, c| acc * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1));

    let row: u64 = digits
        .parse()
        .map_err(|_| RangeError::BadCell(cell.to_string()))?;
    if row == 0 || row > u64::from(MAX_ROWS) {
        return Err(RangeError::RowOutOfBounds(row));
    }

    Ok((row as u32, col))
}
