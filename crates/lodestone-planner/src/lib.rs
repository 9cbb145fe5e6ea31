//! Cost-based WHERE-clause planner.
//!
//! Given the decomposed WHERE clause of a SELECT, UPDATE, or DELETE, the
//! FROM list, an optional ORDER BY, and the catalog of available indexes,
//! [`plan`] decides in what order to visit the tables, which index (if
//! any) to use for each, and how to scan it, minimizing the estimated
//! total cost while preserving SQL semantics.
//!
//! The pipeline: the WHERE expression is normalized into terms
//! ([`clause`]), candidate loops are enumerated per table (loop builder),
//! an N-best dynamic program picks the join order (solver), ORDER BY and
//! DISTINCT satisfaction are analyzed along the way, and the chosen path
//! is handed off as a [`plan::WherePlan`] for the code emitter.
//!
//! The planner is single-threaded and synchronous; one call owns all of
//! its working memory and releases it on return.

pub mod catalog;
pub mod clause;
pub mod masks;
pub mod plan;
pub mod vtab;

mod expr;
mod loops;
mod order;
mod scan;
mod solver;
mod stats;

use lodestone_ast::{Expr, OrderingTerm};
use lodestone_types::{Bitmask, Cost, BMS};
use smallvec::SmallVec;
use tracing::debug;

use catalog::{FromItem, IndexKind, IndexProbe, JoinKind};
use clause::{analyze_all, split, wo, AnalyzeCx, ClauseSet, SplitOp, TermRef};
use loops::{add_all_loops, wf, BuildCx, LoopIndex, LoopPayload, WhereLoop};
use masks::MaskSet;
use order::{is_distinct_redundant, path_satisfies_order_by, OrderCheck, OrderCx, OrderMode};
use plan::{build_levels, DistinctMode, WherePlan};
use scan::{chain_from, find_term};
use solver::{path_solver, SolveInput};

pub use lodestone_error::{PlanError, Result};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Optimizer toggles. Everything defaults to on except diagnostic
/// reverse-output.
#[derive(Debug, Clone)]
pub struct PlannerOptions {
    /// Use stat3-style histogram samples when present.
    pub stat3: bool,
    /// Synthesize transient automatic indexes.
    pub auto_index: bool,
    /// Prefer full scans of covering indexes over table scans.
    pub covering_index_scan: bool,
    /// Propagate equality constraints transitively (`x=y ∧ y=5 ⇒ x=5`).
    pub transitive: bool,
    /// Drop unreferenced LEFT JOIN tables from the plan.
    pub omit_noop_join: bool,
    /// Detect redundant DISTINCT clauses.
    pub distinct_opt: bool,
    /// Allow inner loops of a join to satisfy ORDER BY.
    pub order_by_idx_join: bool,
    /// Force every scan to run backwards (diagnostic tracing aid).
    pub reverse_order: bool,
    /// LIKE compares case-insensitively (the default collation regime).
    pub like_nocase: bool,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            stat3: true,
            auto_index: true,
            covering_index_scan: true,
            transitive: true,
            omit_noop_join: true,
            distinct_opt: true,
            order_by_idx_join: true,
            reverse_order: false,
            like_nocase: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Everything the statement compiler hands to the planner.
pub struct WhereInput<'a> {
    /// The FROM list, left to right. At most [`BMS`] entries.
    pub from: Vec<FromItem<'a>>,
    /// The WHERE expression, with ON-clause terms already merged in and
    /// marked.
    pub where_expr: Option<&'a Expr>,
    /// ORDER BY (or GROUP BY, with [`WhereInput::group_by`] set).
    pub order_by: Option<&'a [OrderingTerm]>,
    /// `order_by` is actually a GROUP BY list: equivalent rows need only
    /// be adjacent.
    pub group_by: bool,
    /// The result-set expressions DISTINCT operates on.
    pub result_set: Option<&'a [Expr]>,
    pub want_distinct: bool,
    /// An UPDATE or DELETE would like to modify rows as it scans.
    pub one_pass_desired: bool,
    /// Estimated iterations of this whole WHERE loop (non-zero inside
    /// subqueries), log-encoded.
    pub n_query_loop: Cost,
}

impl<'a> WhereInput<'a> {
    /// A plain SELECT over `from` with an optional WHERE.
    #[must_use]
    pub fn new(from: Vec<FromItem<'a>>, where_expr: Option<&'a Expr>) -> Self {
        Self {
            from,
            where_expr,
            order_by: None,
            group_by: false,
            result_set: None,
            want_distinct: false,
            one_pass_desired: false,
            n_query_loop: Cost::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// The planner
// ---------------------------------------------------------------------------

/// Plan the WHERE processing of one statement.
///
/// # Errors
///
/// Fails when the join exceeds [`BMS`] tables, when an `INDEXED BY`
/// clause names an unknown index or forbids every usable access path, or
/// when a virtual table's planning method misbehaves.
#[allow(clippy::too_many_lines)]
pub fn plan(input: &WhereInput<'_>, opts: &PlannerOptions) -> Result<WherePlan> {
    let n_src = input.from.len();
    if n_src > BMS {
        return Err(PlanError::TooManyTables { max: BMS });
    }
    for fi in &input.from {
        if let Some(name) = &fi.indexed_by {
            if fi.table.index_position(name).is_none() {
                return Err(PlanError::NoSuchIndex {
                    table: fi.table.name.clone(),
                    index: name.clone(),
                });
            }
        }
    }

    // Assign a bit to every FROM entry, in order, so that the masks of
    // any FROM prefix are dense. LEFT-JOIN analysis depends on this.
    let mut masks = MaskSet::new();
    for fi in &input.from {
        masks.assign(fi.cursor);
    }
    #[cfg(debug_assertions)]
    {
        let mut to_the_left = Bitmask::EMPTY;
        for fi in &input.from {
            let m = masks.mask_of(fi.cursor);
            debug_assert_eq!(m.below(), to_the_left);
            to_the_left |= m;
        }
    }

    // Split the WHERE clause on AND and analyze every term. A constant
    // WHERE still passes through here; its terms classify as residue and
    // leave the plan unchanged.
    let mut cs = ClauseSet::new();
    let main = cs.add_clause(SplitOp::And, None);
    if let Some(w) = input.where_expr {
        split(&mut cs, main, w, SplitOp::And);
    }
    {
        let acx = AnalyzeCx {
            from: &input.from,
            masks: &masks,
            opts,
        };
        analyze_all(&mut cs, main, &acx);
    }

    // No FROM clause: a single evaluation, trivially ordered and unique.
    if n_src == 0 {
        return Ok(WherePlan {
            levels: Vec::new(),
            order_by_satisfied: input.order_by.is_some(),
            rev_mask: Bitmask::EMPTY,
            n_row_out: Cost::ZERO,
            distinct: if input.want_distinct {
                DistinctMode::Unique
            } else {
                DistinctMode::Noop
            },
            ok_one_pass: false,
            clauses: cs,
            main_clause: main,
        });
    }

    let want_distinct = input.want_distinct && opts.distinct_opt;

    // When DISTINCT is in play, an ORDER BY over general expressions can
    // never be satisfied by indexes; drop it from planning so it is
    // sorted downstream.
    let mut order_by: Option<Vec<OrderingTerm>> = input.order_by.map(<[OrderingTerm]>::to_vec);
    if order_by.is_some() && want_distinct {
        let keep = {
            let mut keep = true;
            for term in order_by.as_deref().unwrap_or_default() {
                match term.expr.skip_collate() {
                    Expr::Column { column, .. } => {
                        if *column < 0 {
                            break;
                        }
                    }
                    _ => {
                        keep = false;
                        break;
                    }
                }
            }
            keep
        };
        if !keep {
            order_by = None;
        }
    }

    let mut mode = if input.group_by {
        OrderMode::GroupBy
    } else {
        OrderMode::OrderBy
    };
    let result_terms: Option<Vec<OrderingTerm>> = input
        .result_set
        .map(|rs| rs.iter().map(|e| OrderingTerm::asc(e.clone())).collect());

    let chain = chain_from(&cs, main);
    let mut e_distinct = DistinctMode::Noop;
    let mut distinct_by = false;
    if want_distinct {
        if let Some(rt) = &result_terms {
            let ocx = OrderCx {
                cs: &cs,
                from: &input.from,
                masks: &masks,
                opts,
                main_chain: &chain,
            };
            if is_distinct_redundant(&ocx, rt) {
                // The DISTINCT marking is pointless; every row is unique
                // already.
                e_distinct = DistinctMode::Unique;
            } else if order_by.is_none() {
                // Order the scan by the result set so duplicates arrive
                // adjacent.
                distinct_by = true;
                mode = OrderMode::DistinctBy;
                order_by = Some(rt.clone());
            }
        }
    }

    let mut loops: Vec<WhereLoop> = Vec::new();
    let chosen: Vec<usize>;
    let n_row_out: Cost;
    let mut b_ob_sat = false;
    let mut rev_mask = Bitmask::EMPTY;

    let shortcut = if n_src == 1 {
        try_shortcut(&cs, main, &input.from, &masks)
    } else {
        None
    };

    if let Some(short_loop) = shortcut {
        debug!(target: "lodestone.planner", "shortcut plan");
        loops.push(short_loop);
        chosen = vec![0];
        n_row_out = Cost(1);
        if order_by.is_some() {
            b_ob_sat = true;
        }
        if want_distinct {
            e_distinct = DistinctMode::Unique;
        }
    } else {
        {
            let bcx = BuildCx {
                cs: &cs,
                from: &input.from,
                masks: &masks,
                opts,
                order_by: order_by.as_deref(),
                main_clause: main,
            };
            add_all_loops(&bcx, &mut loops)?;
        }

        let ocx = OrderCx {
            cs: &cs,
            from: &input.from,
            masks: &masks,
            opts,
            main_chain: &chain,
        };
        let sinp = SolveInput {
            order_cx: ocx,
            loops: &loops,
            order_by: order_by.as_deref(),
            mode,
            n_query_loop: input.n_query_loop,
            n_level: n_src,
        };
        // First pass ignores sorting and finds the best raw plan; when an
        // ORDER BY is present a second pass charges the sort cost against
        // that plan's output estimate and reports the sort-satisfied
        // status.
        let mut sol = path_solver(&sinp, Cost::ZERO)?;
        let mut second_pass = false;
        if order_by.is_some() {
            sol = path_solver(&sinp, sol.n_row + 1)?;
            second_pass = true;
        }

        // A path that naturally groups the DISTINCT projection downgrades
        // the dedup step to an adjacency check.
        if want_distinct && !distinct_by && e_distinct == DistinctMode::Noop && second_pass {
            if let Some(rt) = &result_terms {
                if let Some((&last, prefix_idx)) = sol.loops.split_last() {
                    let prefix: Vec<&WhereLoop> =
                        prefix_idx.iter().map(|&i| &loops[i]).collect();
                    let mut scratch = Bitmask::EMPTY;
                    let ocx2 = OrderCx {
                        cs: &cs,
                        from: &input.from,
                        masks: &masks,
                        opts,
                        main_chain: &chain,
                    };
                    if path_satisfies_order_by(
                        &ocx2,
                        rt,
                        &prefix,
                        OrderMode::DistinctBy,
                        prefix.len(),
                        &loops[last],
                        &mut scratch,
                    ) == OrderCheck::Satisfied
                    {
                        e_distinct = DistinctMode::Ordered;
                    }
                }
            }
        }

        if sol.is_ordered {
            if distinct_by {
                e_distinct = DistinctMode::Ordered;
            } else {
                b_ob_sat = true;
                rev_mask = sol.rev_mask;
            }
        }
        n_row_out = sol.n_row;
        chosen = sol.loops;
    }

    // Diagnostic knob: run everything backwards when nothing asked for an
    // order.
    if order_by.is_none() && opts.reverse_order {
        rev_mask = Bitmask::ALL;
    }

    let mut chosen = chosen;
    // Trailing LEFT JOIN tables that contribute no columns and no
    // filtering can be dropped from the join entirely.
    if opts.omit_noop_join && chosen.len() >= 2 {
        if let Some(rs) = input.result_set {
            let mut tab_used = expr::expr_list_usage(&masks, rs.iter());
            if let Some(ob) = order_by.as_deref() {
                tab_used |= expr::expr_list_usage(&masks, ob.iter().map(|t| &t.expr));
            }
            while chosen.len() >= 2 {
                let wl = &loops[chosen[chosen.len() - 1]];
                if input.from[wl.tab_pos].join != JoinKind::Left {
                    break;
                }
                if !want_distinct && wl.flags & wf::ONEROW == 0 {
                    break;
                }
                if tab_used.overlaps(wl.mask_self) {
                    break;
                }
                let referenced = cs.clause(main).terms.iter().any(|t| {
                    t.prereq_all.overlaps(wl.mask_self)
                        && !matches!(t.expr, Expr::FromJoin { .. })
                });
                if referenced {
                    break;
                }
                debug!(target: "lodestone.planner", tab = wl.tab_pos, "dropping unused LEFT JOIN table");
                chosen.pop();
            }
        }
    }

    // One-pass UPDATE/DELETE works only when the scan visits at most one
    // row; the table itself must then stay open.
    let mut ok_one_pass = false;
    if input.one_pass_desired && chosen.len() == 1 {
        let li = chosen[0];
        if loops[li].flags & wf::ONEROW != 0 {
            ok_one_pass = true;
            loops[li].flags &= !wf::IDX_ONLY;
        }
    }

    let mut distinct = e_distinct;
    if input.want_distinct && distinct == DistinctMode::Noop {
        distinct = DistinctMode::Unordered;
    }

    let levels = build_levels(&cs, &input.from, &loops, &chosen, rev_mask);
    Ok(WherePlan {
        levels,
        order_by_satisfied: b_ob_sat,
        rev_mask,
        n_row_out,
        distinct,
        ok_one_pass,
        clauses: cs,
        main_clause: main,
    })
}

/// The no-frills planner for the most common statement shape: a single
/// table with equality constraints covering a unique index. Bypasses loop
/// enumeration and the solver entirely.
fn try_shortcut(
    cs: &ClauseSet,
    main: clause::ClauseId,
    from: &[FromItem<'_>],
    masks: &MaskSet,
) -> Option<WhereLoop> {
    let fi = &from[0];
    if fi.table.is_virtual() || fi.indexed_by.is_some() {
        return None;
    }
    let chain = chain_from(cs, main);
    for (pos, idx) in fi.table.indexes.iter().enumerate() {
        if !idx.is_unique() {
            continue;
        }
        let probe = IndexProbe::new(fi.table, pos);
        let mut terms: SmallVec<[Option<TermRef>; 4]> = SmallVec::new();
        let mut ok = true;
        for ic in &idx.columns {
            match find_term(
                cs,
                from,
                &chain,
                fi.cursor,
                ic.column,
                Bitmask::EMPTY,
                wo::EQ,
                Some(&probe),
            ) {
                Some(tr) => terms.push(Some(tr)),
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        let mut l = WhereLoop::template(0, masks.mask_of(fi.cursor));
        l.flags = wf::COLUMN_EQ | wf::ONEROW | wf::INDEXED;
        if idx.kind != IndexKind::PrimaryKey
            && fi.columns_used.is_subset_of(probe.columns_covered())
        {
            l.flags |= wf::IDX_ONLY;
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            l.payload = LoopPayload::BTree {
                n_eq: idx.columns.len() as u16,
                index: Some(LoopIndex::Catalog(pos)),
            };
        }
        l.terms = terms;
        // A unique index lookup costs ~15 regardless of table size.
        l.r_run = Cost(39);
        l.n_out = Cost(1);
        return Some(l);
    }
    None
}

/// Operator and state-flag bit namespaces, re-exported for emitter-side
/// term handling.
pub use clause::{tf as term_flags, wo as term_ops};
