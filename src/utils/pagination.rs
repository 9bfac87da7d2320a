//! Drift-aware skip cursor for scanning a table that shrinks underneath it.
//!
//! The reconciler pages wait-queue rows with `OFFSET`/`LIMIT` while consumers
//! delete rows concurrently. Advancing the offset by a full page would skip
//! rows that slid back into already-scanned positions. Instead the next
//! offset is the number of rows that still sort at or before the last row
//! returned, so the next page starts immediately after it.

/// Cursor state after one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStep {
    /// Offset for the next page.
    pub next_skip: usize,
    /// Rows ordered before the cursor that vanished since the scan began.
    pub carry: usize,
    /// No further page exists.
    pub done: bool,
}

/// Compute the cursor for the page after one that returned `returned` rows.
///
/// `skip` and `carry` are the values used for the current page.
/// `remaining_through_last` counts rows currently ordered at or before the
/// last row of the current page; it is only called when another page is
/// needed.
pub fn next_skip<F>(
    skip: usize,
    page_size: usize,
    returned: usize,
    carry: usize,
    remaining_through_last: F,
) -> PageStep
where
    F: FnOnce() -> usize,
{
    if returned == 0 || returned < page_size {
        return PageStep {
            next_skip: skip + returned,
            carry,
            done: true,
        };
    }

    let visited = skip + carry + returned;
    let remaining = remaining_through_last();

    PageStep {
        next_skip: remaining,
        carry: visited.saturating_sub(remaining),
        done: false,
    }
}
