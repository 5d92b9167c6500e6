//! Whole-book reading progress

use crate::spine::SpineEntry;

/// Fraction of the book read, in `[0.0, 1.0]`
///
/// Progress is weighted by inflated document size: everything before
/// `spine_index` counts as read, plus `fraction` of the current entry.
/// `fraction` is clamped to `[0, 1]` and `spine_index` to the last entry.
/// Books with no content return `0.0`.
pub fn calculate_progress(spine: &[SpineEntry], spine_index: usize, fraction: f32) -> f32 {
    let Some(last) = spine.last() else {
        return 0.0;
    };
    let total = last.cumulative_size;
    if total == 0 {
        return 0.0;
    }

    let index = spine_index.min(spine.len() - 1);
    let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
    let current = spine[index].cumulative_size;
    let previous = match index {
        0 => 0,
        _ => spine[index - 1].cumulative_size,
    };

    let read = previous as f64 + fraction as f64 * current.saturating_sub(previous) as f64;
    ((read / total as f64) as f32).clamp(0.0, 1.0)
}
