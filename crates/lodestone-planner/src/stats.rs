//! Histogram-based row estimation for index scans.
//!
//! When ANALYZE-style samples are present on an index's left-most column,
//! range and equality constraints are costed by locating the constraint
//! values among the samples. Without samples, fixed default factors apply:
//! each range inequality is assumed to cut the search space four-fold.

use lodestone_ast::Literal;
use lodestone_types::Cost;
use tracing::trace;

use crate::catalog::{Index, SampleValue};
use crate::clause::wo;

/// A range bound extracted from a WHERE term for estimation purposes.
pub(crate) struct RangeBound {
    /// The bound value, when the RHS is a literal the histogram can place.
    pub value: Option<SampleValue>,
    /// The `wo::*` operator bit of the bounding term.
    pub eop: u16,
    /// True for a manufactured `x > NULL` bound, which carries no
    /// selectivity of its own.
    pub vnull: bool,
}

/// Convert a literal to a sample-comparable value.
pub(crate) fn literal_to_sample(lit: &Literal) -> SampleValue {
    match lit {
        Literal::Null => SampleValue::Null,
        Literal::Integer(i) => SampleValue::Integer(*i),
        Literal::Float(f) => SampleValue::Real(*f),
        Literal::String(s) => SampleValue::Text(s.clone()),
        Literal::Blob(b) => SampleValue::Blob(b.clone()),
    }
}

/// Estimate the location of `val` among all keys of the index:
/// `(rows_less_than, rows_equal)`.
pub(crate) fn key_stats(index: &Index, val: &SampleValue, round_up: bool) -> (u64, u64) {
    use std::cmp::Ordering;
    debug_assert!(!index.samples.is_empty());
    let n = index.row_est[0];
    let samples = &index.samples;

    let mut i = samples.len();
    let mut is_eq = false;
    for (j, s) in samples.iter().enumerate() {
        match val.compare(&s.value) {
            Ordering::Less => {
                i = j;
                break;
            }
            Ordering::Equal => {
                i = j;
                is_eq = true;
                break;
            }
            Ordering::Greater => {}
        }
    }

    if is_eq {
        (samples[i].n_lt, samples[i].n_eq)
    } else {
        let (lower, upper) = if i == 0 {
            (0, samples[0].n_lt)
        } else {
            let upper = if i >= samples.len() {
                n
            } else {
                samples[i].n_lt
            };
            (samples[i - 1].n_eq + samples[i - 1].n_lt, upper)
        };
        let gap = upper.saturating_sub(lower);
        let gap = if round_up { gap * 2 / 3 } else { gap / 3 };
        (lower + gap, index.avg_eq)
    }
}

/// Estimate how much a range constraint narrows an index scan.
///
/// The return value is a log-domain divisor: 0 means the range does not
/// help at all, `Cost::of(4)` that it cuts the space four-fold, and so on.
/// A BETWEEN (both bounds) therefore defaults to a sixteen-fold cut.
pub(crate) fn range_scan_est(
    stat3: bool,
    index: &Index,
    n_eq: u16,
    lower: Option<&RangeBound>,
    upper: Option<&RangeBound>,
) -> Cost {
    if stat3 && n_eq == 0 && !index.samples.is_empty() {
        let mut i_lower = 0u64;
        let mut i_upper = index.row_est[0];
        let mut usable = false;
        if let Some(lo) = lower {
            if let Some(v) = &lo.value {
                let (n_lt, n_eq_here) = key_stats(index, v, false);
                i_lower = n_lt + if lo.eop & wo::GT != 0 { n_eq_here } else { 0 };
                usable = true;
            }
        }
        if let Some(up) = upper {
            if let Some(v) = &up.value {
                let (n_lt, n_eq_here) = key_stats(index, v, true);
                i_upper = n_lt + if up.eop & wo::LE != 0 { n_eq_here } else { 0 };
                usable = true;
            }
        }
        if usable {
            let base = Cost::of(index.row_est[0]);
            let div = if i_upper > i_lower {
                base.saturating_sub(Cost::of(i_upper - i_lower))
            } else {
                base
            };
            trace!(
                target: "lodestone.planner",
                lower = i_lower,
                upper = i_upper,
                div = div.0,
                "range scan regions"
            );
            return div;
        }
    }

    let mut div = Cost::ZERO;
    if lower.is_some_and(|lo| !lo.vnull) {
        div += Cost::of(4);
    }
    if upper.is_some() {
        div += Cost::of(4);
    }
    div
}

/// Estimate the rows returned by `x = value` (or `x IS NULL` when `value`
/// is the NULL sample) when histogram samples cover the left-most column.
pub(crate) fn equal_scan_est(index: &Index, value: &SampleValue) -> u64 {
    key_stats(index, value, false).1
}

/// Estimate the rows returned by `x IN (v1, v2, ...)`: the sum of the
/// per-value equality estimates, never more than the whole index.
pub(crate) fn in_scan_est(index: &Index, values: &[SampleValue]) -> u64 {
    let sum: u64 = values.iter().map(|v| equal_scan_est(index, v)).sum();
    sum.min(index.row_est[0])
}
