//! Score-based narrowing of raw upstream results.
//!
//! Both filters are pure: they borrow the input and return a new vector.

use crate::RawResult;

/// Linear-interpolated percentile of `scores` (`percentile` in `[0, 100]`).
///
/// Matches the usual "linear" definition: sort, take rank `p/100 * (n-1)` and interpolate
/// between the neighbouring order statistics.
pub fn percentile_value(scores: &[f64], percentile: f64) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let p = percentile.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    let v = sorted[lo] + (sorted[hi] - sorted[lo]) * frac;
    Some(v.clamp(sorted[lo], sorted[hi]))
}

/// Keep every result whose score is at or above the given percentile, in original order.
///
/// `None` disables the cutoff; the results are then routed through [`filter_by_top_k`] with
/// `k = len`, which returns them unchanged.
pub fn filter_by_percentile(results: &[RawResult], percentile: Option<f64>) -> Vec<RawResult> {
    if results.is_empty() {
        return Vec::new();
    }
    let Some(percentile) = percentile else {
        return filter_by_top_k(results, results.len());
    };
    let scores: Vec<f64> = results.iter().map(RawResult::score).collect();
    let Some(cutoff) = percentile_value(&scores, percentile) else {
        return Vec::new();
    };
    results
        .iter()
        .zip(scores)
        .filter(|(_, s)| *s >= cutoff)
        .map(|(r, _)| r.clone())
        .collect()
}

/// Keep the `k` highest-scoring results, ordered by descending score.
///
/// Ties keep the lower original index first. When `k >= len` the input order is preserved.
pub fn filter_by_top_k(results: &[RawResult], k: usize) -> Vec<RawResult> {
    if k >= results.len() {
        return results.to_vec();
    }
    let mut idx: Vec<usize> = (0..results.len()).collect();
    // Stable sort: equal scores stay in index order.
    idx.sort_by(|&a, &b| results[b].score().total_cmp(&results[a].score()));
    idx.truncate(k);
    idx.into_iter().map(|i| results[i].clone()).collect()
}
