//! Locating the fragment to load for a buffer position or wall-clock time.
//!
//! All functions return an index into the fragment slice, which must be sorted
//! by start time.

use std::cmp::Ordering;

use crate::fragment::Fragment;

/// Position of `candidate` relative to `buffer_end`.
///
/// `Less` means the candidate ends at or before the position, `Greater` that
/// it starts after it, `Equal` that it is the fragment to load.
pub fn fragment_within_tolerance(buffer_end: f64, tolerance: f64, candidate: &Fragment) -> Ordering {
    let lookup_tolerance =
        tolerance.min(candidate.duration + candidate.delta_pts.unwrap_or(0.0));
    if candidate.start + candidate.duration - lookup_tolerance <= buffer_end {
        Ordering::Less
    } else if candidate.start - lookup_tolerance > buffer_end && candidate.start != 0.0 {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Whether `candidate` ends after `pdt` (epoch milliseconds), allowing for `tolerance` seconds.
pub fn pdt_within_tolerance(pdt: i64, tolerance: f64, candidate: &Fragment) -> bool {
    let lookup_tolerance =
        tolerance.min(candidate.duration + candidate.delta_pts.unwrap_or(0.0)) * 1000.0;
    let end = candidate.end_program_date_time().unwrap_or(0) as f64;
    end - lookup_tolerance > pdt as f64
}

/// Fragment covering `buffer_end`.
///
/// The fragment following `previous` in sequence is preferred whenever it
/// fits, so consecutive loads stay on the same continuity path even when
/// several fragments share a timestamp.
pub fn find_fragment_by_pts(
    previous: Option<&Fragment>,
    fragments: &[Fragment],
    buffer_end: f64,
    tolerance: f64,
) -> Option<usize> {
    let first = fragments.first()?;
    let next = match previous {
        Some(prev) => prev
            .sn
            .checked_sub(first.sn)
            .and_then(|delta| usize::try_from(delta).ok())
            .map(|idx| idx + 1)
            .filter(|&idx| idx < fragments.len()),
        None if buffer_end == 0.0 && first.start == 0.0 => Some(0),
        None => None,
    };

    if let Some(idx) = next
        && fragment_within_tolerance(buffer_end, tolerance, &fragments[idx]) == Ordering::Equal
    {
        return Some(idx);
    }

    fragments
        .binary_search_by(|candidate| fragment_within_tolerance(buffer_end, tolerance, candidate))
        .ok()
        .or(next)
}

/// First fragment ending after the wall-clock time `pdt`.
pub fn find_fragment_by_pdt(fragments: &[Fragment], pdt: i64, tolerance: f64) -> Option<usize> {
    let first_pdt = fragments.first()?.program_date_time.unwrap_or(0);
    let last_end = fragments.last()?.end_program_date_time().unwrap_or(0);
    if pdt < first_pdt || pdt >= last_end {
        return None;
    }
    fragments
        .iter()
        .position(|frag| pdt_within_tolerance(pdt, tolerance, frag))
}
