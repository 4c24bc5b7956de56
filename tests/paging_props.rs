//! Property tests for chunk planning and cursors.

use proptest::prelude::*;

use tabular_relay::paging::{decode_cursor, encode_cursor, plan_chunks, total_pages, CursorBasis, CursorError};
use tabular_relay::range::{CellRange, MAX_COLUMNS, MAX_ROWS};

fn arb_range() -> impl Strategy<Value = CellRange> {
    (1u32..5_000, 1u32..60, 1u32..20_000, 1u32..200).prop_map(|(row, col, rows, cols)| {
        CellRange::new(
            None,
            row,
            col,
            (row + rows - 1).min(MAX_ROWS),
            (col + cols - 1).min(MAX_COLUMNS),
        )
    })
}

proptest! {
    #[test]
    fn chunks_partition_the_range(
        range in arb_range(),
        limit in 200u64..50_000,
        page_size in 1u32..5_000,
    ) {
        let chunks = plan_chunks(&range, limit, page_size).unwrap();

        let mut next_row = range.start_row;
        for chunk in &chunks {
            prop_assert_eq!(chunk.start_row, next_row);
            prop_assert_eq!(chunk.start_col, range.start_col);
            prop_assert_eq!(chunk.end_col, range.end_col);
            prop_assert!(chunk.cell_count() <= limit);
            prop_assert!(chunk.rows() <= page_size);
            next_row = chunk.end_row + 1;
        }
        prop_assert_eq!(next_row, range.end_row + 1);

        let cells: u64 = chunks.iter().map(CellRange::cell_count).sum();
        prop_assert_eq!(cells, range.cell_count());
    }

    #[test]
    fn cursor_decodes_to_its_page(
        range in arb_range(),
        page_size in 1u32..10_000,
        page in 0u64..1_000,
    ) {
        let basis = CursorBasis::new("book", range, page_size);
        let token = encode_cursor(page, &basis);
        prop_assert_eq!(decode_cursor(&token, &basis), Ok(page));
    }

    #[test]
    fn cursor_is_bound_to_its_resource(
        range in arb_range(),
        page_size in 1u32..10_000,
        page in 0u64..1_000,
    ) {
        let token = encode_cursor(page, &CursorBasis::new("book", range.clone(), page_size));
        let other = CursorBasis::new("another-book", range, page_size);
        prop_assert_eq!(decode_cursor(&token, &other), Err(CursorError::ChecksumMismatch));
    }

    #[test]
    fn pages_cover_every_row(total_rows in 0u32..1_000_000, page_size in 1u32..10_000) {
        let pages = total_pages(total_rows, page_size);
        prop_assert!(pages * u64::from(page_size) >= u64::from(total_rows));
        if pages > 0 {
            prop_assert!((pages - 1) * u64::from(page_size) < u64::from(total_rows));
        }
    }

    #[test]
    fn canonical_form_reparses_to_itself(range in arb_range()) {
        let reparsed = CellRange::parse(&range.to_string()).unwrap();
        prop_assert_eq!(reparsed, range);
    }
}
