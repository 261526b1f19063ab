// Fragment lookup by program-date-time and by presentation timestamp.

use crate::fragment::Fragment;
use std::cmp::Ordering;

/// Find the fragment that continues at the wall-clock time `pdt_millis`.
///
/// Returns `None` when the playlist has no date-time tags or the time lies
/// outside the playlist.
pub fn find_fragment_by_pdt(
    fragments: &[Fragment],
    pdt_millis: Option<f64>,
    tolerance: f64,
) -> Option<&Fragment> {
    let pdt = pdt_millis.filter(|v| v.is_finite())?;
    let first_pdt = fragments.first()?.program_date_time_millis()?;
    let last_end_pdt = fragments.last()?.end_program_date_time_millis()?;

    if pdt < first_pdt || pdt >= last_end_pdt {
        return None;
    }

    fragments.iter().find(|frag| {
        frag.end_program_date_time_millis().is_some_and(|end| {
            let lookup_tolerance = tolerance.min(frag.duration) * 1000.0;
            end - lookup_tolerance > pdt
        })
    })
}

/// Find the fragment covering `buffer_end`.
///
/// The fragment following `previous` is preferred when it is within tolerance,
/// otherwise the playlist is binary-searched.
pub fn find_fragment_by_pts<'a>(
    previous: Option<&Fragment>,
    fragments: &'a [Fragment],
    buffer_end: f64,
    tolerance: f64,
) -> Option<&'a Fragment> {
    let first_sn = fragments.first()?.sn;

    let next = previous
        .and_then(|prev| prev.sn.checked_sub(first_sn))
        .and_then(|offset| usize::try_from(offset + 1).ok())
        .and_then(|idx| fragments.get(idx));
    if let Some(next) = next
        && compare_to_position(next, buffer_end, tolerance) == Ordering::Equal
    {
        return Some(next);
    }

    fragments
        .binary_search_by(|candidate| compare_to_position(candidate, buffer_end, tolerance))
        .ok()
        .map(|idx| &fragments[idx])
}

/// Order a candidate relative to a timeline position.
///
/// `Less` when the candidate ends before the position, `Greater` when it starts
/// after it, `Equal` when it covers the position within tolerance.
fn compare_to_position(candidate: &Fragment, position: f64, tolerance: f64) -> Ordering {
    let lookup_tolerance = tolerance.min(candidate.duration);
    if candidate.start + candidate.duration - lookup_tolerance <= position {
        Ordering::Less
    } else if candidate.start - lookup_tolerance > position && candidate.start != 0.0 {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}
