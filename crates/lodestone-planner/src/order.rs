//! ORDER BY satisfaction analysis and DISTINCT reduction.
//!
//! Given a candidate path and a proposed next loop, decide whether the
//! rows will already come out in the requested order. A loop can
//! contribute ordering through its index's columns (possibly scanned in
//! reverse), a column can be neutralized by an outer `= const` or
//! `IS NULL` constraint, and once every loop touched by an ORDER BY term
//! is *order-distinct*, meaning no two of its rows agree on the referenced
//! columns, the remaining terms are free.
//!
//! GROUP BY and DISTINCT reuse the analysis with relaxed strictness:
//! equivalent rows only need to be adjacent, so terms may match index
//! columns in any order.

use lodestone_ast::{Expr, OrderingTerm, SortOrder};
use lodestone_types::{Bitmask, BMS};

use crate::catalog::{FromItem, IndexKind, IndexProbe};
use crate::clause::{wo, ClauseSet};
use crate::expr::{collation_of, expr_usage};
use crate::loops::{wf, LoopPayload, WhereLoop};
use crate::masks::MaskSet;
use crate::scan::{find_term, ScanLink};
use crate::PlannerOptions;

/// Outcome of an ordering check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrderCheck {
    /// Rows come out in the requested order; no sort needed.
    Satisfied,
    /// A separate sort pass is required.
    NotSatisfied,
    /// Depends on loops not yet added to the path.
    Unknown,
}

/// How strictly the ordering terms must be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrderMode {
    /// ORDER BY: terms match left-to-right with consistent directions.
    OrderBy,
    /// GROUP BY: any matching order, directions irrelevant.
    GroupBy,
    /// DISTINCT: any matching order, directions as indexed.
    DistinctBy,
}

impl OrderMode {
    const fn any_order(self) -> bool {
        matches!(self, Self::GroupBy | Self::DistinctBy)
    }

    const fn ignore_direction(self) -> bool {
        matches!(self, Self::GroupBy)
    }
}

/// Read-only state for ordering checks.
pub(crate) struct OrderCx<'a, 'f> {
    pub cs: &'a ClauseSet,
    pub from: &'a [FromItem<'f>],
    pub masks: &'a MaskSet,
    pub opts: &'a PlannerOptions,
    pub main_chain: &'a [ScanLink],
}

fn peel(e: &Expr) -> &Expr {
    match e.skip_collate() {
        Expr::FromJoin { expr, .. } => expr.skip_collate(),
        other => other,
    }
}

/// Examine a path (plus one more loop) against an ordering list.
#[allow(clippy::too_many_lines)]
pub(crate) fn path_satisfies_order_by(
    cx: &OrderCx<'_, '_>,
    order_by: &[OrderingTerm],
    path_loops: &[&WhereLoop],
    mode: OrderMode,
    n_loop: usize,
    last: &WhereLoop,
    rev_mask: &mut Bitmask,
) -> OrderCheck {
    // A virtual table answers for its own ordering.
    if last.flags & wf::VIRTUALTABLE != 0 {
        if let LoopPayload::Vtab(v) = &last.payload {
            return if v.ordered {
                OrderCheck::Satisfied
            } else {
                OrderCheck::NotSatisfied
            };
        }
    }
    if n_loop > 0 && !cx.opts.order_by_idx_join {
        return OrderCheck::NotSatisfied;
    }

    let n_order_by = order_by.len();
    if n_order_by > BMS - 1 {
        return OrderCheck::NotSatisfied;
    }
    let ob_done = Bitmask(Bitmask::bit(n_order_by).0.wrapping_sub(1));
    let mut ob_sat = Bitmask::EMPTY;
    let mut is_order_distinct = true;
    let mut order_distinct_mask = Bitmask::EMPTY;
    let mut ready = Bitmask::EMPTY;
    let mut prev_mask = Bitmask::EMPTY;

    let mut i_loop = 0;
    while is_order_distinct && ob_sat != ob_done && i_loop <= n_loop {
        if i_loop > 0 {
            ready |= prev_mask;
        }
        let lp: &WhereLoop = if i_loop < n_loop {
            path_loops[i_loop]
        } else {
            last
        };
        prev_mask = lp.mask_self;
        let fi = &cx.from[lp.tab_pos];
        let cursor = fi.cursor;

        // An ORDER BY column held constant by outer-loop constraints is
        // satisfied regardless of scan order.
        for i in 0..n_order_by {
            if Bitmask::bit(i).is_subset_of(ob_sat) {
                continue;
            }
            let ob = peel(&order_by[i].expr);
            let Expr::Column { cursor: c, column, .. } = ob else {
                continue;
            };
            if *c != cursor {
                continue;
            }
            let Some(tr) = find_term(
                cx.cs,
                cx.from,
                cx.main_chain,
                cursor,
                *column,
                !ready,
                wo::EQ | wo::ISNULL,
                None,
            ) else {
                continue;
            };
            let term = cx.cs.term(tr);
            if term.e_operator & wo::EQ != 0 && *column >= 0 {
                let z1 = collation_of(&order_by[i].expr, cx.from)
                    .unwrap_or_else(|| "BINARY".to_owned());
                let z2 =
                    collation_of(&term.expr, cx.from).unwrap_or_else(|| "BINARY".to_owned());
                if !z1.eq_ignore_ascii_case(&z2) {
                    continue;
                }
            }
            ob_sat |= Bitmask::bit(i);
        }

        if lp.flags & wf::ONEROW == 0 {
            let Some(idx_pos) = lp.catalog_index() else {
                // No index (full scan, auto-index, OR union): nothing to
                // order by.
                return OrderCheck::NotSatisfied;
            };
            let probe = IndexProbe::new(fi.table, idx_pos);
            if probe.index.unordered {
                return OrderCheck::NotSatisfied;
            }
            is_order_distinct = probe.index.is_unique();
            let n_column = probe.column_count();
            let n_eq = lp.n_eq() as usize;

            let mut rev = false;
            let mut rev_set = false;
            let mut consumed_all = true;
            for j in 0..n_column {
                // Equality and IS NULL constrained columns impose no order
                // of their own; IS NULL ones also break distinctness.
                if j < n_eq {
                    let eop = lp.terms[j]
                        .map_or(0, |tr| cx.cs.term(tr).e_operator);
                    if eop & (wo::EQ | wo::ISNULL) != 0 {
                        if eop & wo::ISNULL != 0 {
                            is_order_distinct = false;
                        }
                        continue;
                    }
                }

                let i_column = probe.column_number(j).unwrap_or(-1);
                let rev_idx = probe.sort_order(j) == SortOrder::Desc;

                // An unconstrained nullable column breaks the loop's
                // order-distinctness.
                if is_order_distinct
                    && i_column >= 0
                    && j >= n_eq
                    && !fi.table.column_not_null(i_column)
                {
                    is_order_distinct = false;
                }

                // Find the ORDER BY term this index column satisfies.
                let mut matched = None;
                for i in 0..n_order_by {
                    if Bitmask::bit(i).is_subset_of(ob_sat) {
                        continue;
                    }
                    let ob = peel(&order_by[i].expr);
                    let ok = match ob {
                        Expr::Column { cursor: c, column, .. } => {
                            *c == cursor && *column == i_column && {
                                if i_column >= 0 {
                                    let z1 = collation_of(&order_by[i].expr, cx.from)
                                        .unwrap_or_else(|| "BINARY".to_owned());
                                    z1.eq_ignore_ascii_case(probe.collation(j))
                                } else {
                                    true
                                }
                            }
                        }
                        _ => false,
                    };
                    if ok {
                        matched = Some(i);
                        break;
                    }
                    // Strict ORDER BY may only consume the next unused
                    // term; grouping modes may take any.
                    if !mode.any_order() {
                        break;
                    }
                }

                if let Some(i) = matched {
                    ob_sat |= Bitmask::bit(i);
                    if !mode.ignore_direction() {
                        let desc = order_by[i].sort_order == SortOrder::Desc;
                        if rev_set {
                            if (rev ^ rev_idx) != desc {
                                return OrderCheck::NotSatisfied;
                            }
                        } else {
                            rev = rev_idx ^ desc;
                            if rev {
                                *rev_mask |= Bitmask::bit(i_loop);
                            }
                            rev_set = true;
                        }
                    }
                } else {
                    is_order_distinct = false;
                    consumed_all = false;
                    break;
                }
            }
            // Every key field, including the appended primary-key fields,
            // was either constrained or matched: collectively UNIQUE and
            // NOT NULL, hence order-distinct.
            if consumed_all {
                is_order_distinct = true;
            }
        }

        if is_order_distinct {
            order_distinct_mask |= lp.mask_self;
            for i in 0..n_order_by {
                if Bitmask::bit(i).is_subset_of(ob_sat) {
                    continue;
                }
                let usage = expr_usage(cx.masks, &order_by[i].expr);
                if usage.minus(order_distinct_mask).is_empty() {
                    ob_sat |= Bitmask::bit(i);
                }
            }
        }

        i_loop += 1;
    }

    if ob_sat == ob_done {
        OrderCheck::Satisfied
    } else if !is_order_distinct {
        OrderCheck::NotSatisfied
    } else {
        OrderCheck::Unknown
    }
}

// ---------------------------------------------------------------------------
// DISTINCT reduction
// ---------------------------------------------------------------------------

/// Whether the DISTINCT over `result_set` is redundant: a single-table
/// query whose projection pins some UNIQUE NOT NULL key entirely, so the
/// raw output can contain no duplicates.
pub(crate) fn is_distinct_redundant(
    cx: &OrderCx<'_, '_>,
    result_set: &[OrderingTerm],
) -> bool {
    if cx.from.len() != 1 {
        return false;
    }
    let fi = &cx.from[0];
    let cursor = fi.cursor;

    // Projecting the implicit key makes every row unique on its own.
    for term in result_set {
        if let Expr::Column { cursor: c, column, .. } = peel(&term.expr) {
            if *c == cursor && *column < 0 {
                return true;
            }
        }
    }

    for (pos, idx) in fi.table.indexes.iter().enumerate() {
        if idx.kind == IndexKind::Plain {
            continue;
        }
        let probe = IndexProbe::new(fi.table, pos);
        let mut all = true;
        for (j, ic) in idx.columns.iter().enumerate() {
            let constrained = find_term(
                cx.cs,
                cx.from,
                cx.main_chain,
                cursor,
                ic.column,
                Bitmask::ALL,
                wo::EQ,
                Some(&probe),
            )
            .is_some();
            if constrained {
                continue;
            }
            let projected = find_index_col(cx, result_set, cursor, &probe, j);
            if !projected || !fi.table.column_not_null(ic.column) {
                all = false;
                break;
            }
        }
        if all {
            return true;
        }
    }
    false
}

/// Whether `list` contains a bare reference to the `j`-th column of the
/// index, with matching collation.
fn find_index_col(
    cx: &OrderCx<'_, '_>,
    list: &[OrderingTerm],
    cursor: lodestone_types::CursorId,
    probe: &IndexProbe<'_>,
    j: usize,
) -> bool {
    let want = probe.index.columns[j].column;
    for term in list {
        if let Expr::Column { cursor: c, column, .. } = peel(&term.expr) {
            if *c == cursor && *column == want {
                let z = collation_of(&term.expr, cx.from).unwrap_or_else(|| "BINARY".to_owned());
                if z.eq_ignore_ascii_case(&probe.index.columns[j].collation) {
                    return true;
                }
            }
        }
    }
    false
}
