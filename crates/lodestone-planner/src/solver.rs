//! The path solver: dynamic programming over join prefixes.
//!
//! Think of each candidate loop as a node in a graph whose arcs carry
//! dependencies and costs. The solver builds the N best paths of length 1,
//! extends those to the N best paths of length 2, and so on until paths
//! span the whole FROM list; the cheapest surviving path is the plan.
//! ORDER BY satisfaction is evaluated incrementally as paths grow, and a
//! path known to need sorting is charged the sort cost up front.

use lodestone_ast::OrderingTerm;
use lodestone_types::{Bitmask, Cost};
use tracing::{debug, trace};

use crate::loops::WhereLoop;
use crate::order::{path_satisfies_order_by, OrderCheck, OrderCx, OrderMode};
use lodestone_error::{PlanError, Result};

/// A prefix of a candidate plan: an ordered subset of loops.
#[derive(Debug, Clone, Default)]
pub(crate) struct WherePath {
    /// Union of the member loops' self-masks.
    pub mask_loop: Bitmask,
    /// Loops to run in reverse scan order for ORDER BY.
    pub rev_loop: Bitmask,
    /// Estimated rows produced by the prefix.
    pub n_row: Cost,
    /// Accumulated cost.
    pub r_cost: Cost,
    pub is_ordered: bool,
    pub is_ordered_valid: bool,
    /// Member loops, as indices into the loop list, outermost first.
    pub loops: Vec<usize>,
}

/// Everything the solver reads.
pub(crate) struct SolveInput<'a, 'f> {
    pub order_cx: OrderCx<'a, 'f>,
    pub loops: &'a [WhereLoop],
    /// The active ordering list: ORDER BY, GROUP BY, or the DISTINCT
    /// projection, depending on `mode`.
    pub order_by: Option<&'a [OrderingTerm]>,
    pub mode: OrderMode,
    /// The caller's estimate of how many times this WHERE loop will
    /// itself be iterated (non-zero inside subqueries).
    pub n_query_loop: Cost,
    pub n_level: usize,
}

/// The chosen path.
#[derive(Debug)]
pub(crate) struct Solution {
    pub loops: Vec<usize>,
    pub n_row: Cost,
    pub r_cost: Cost,
    pub is_ordered: bool,
    pub rev_mask: Bitmask,
}

/// Find the lowest-cost path visiting one loop per FROM entry.
///
/// `n_row_est` is the estimated size of the final result for sort-cost
/// purposes; pass zero to ignore sorting (the first of the two solver
/// passes).
#[allow(clippy::too_many_lines)]
pub(crate) fn path_solver(inp: &SolveInput<'_, '_>, n_row_est: Cost) -> Result<Solution> {
    let n_loop = inp.n_level;
    // For simple queries only the best path is tracked; two-way joins
    // follow the 5 best, larger joins the 10 best.
    let mx_choice = match n_loop {
        0 | 1 => 1,
        2 => 5,
        _ => 10,
    };
    debug!(target: "lodestone.planner", n_loop, mx_choice, n_row_est = n_row_est.0, "solver start");

    let mut seed = WherePath::default();
    // Do not let the assumed iteration count grow past 25: an automatic
    // index that is not paid back within the first 25 rows is not built.
    seed.n_row = inp.n_query_loop.min(Cost::of(25));
    let mut r_sort_cost = Cost::ZERO;
    if inp.order_by.is_none() || n_row_est == Cost::ZERO {
        seed.is_ordered_valid = true;
    } else {
        // Sorting the result costs N*log2(N).
        r_sort_cost = n_row_est + n_row_est.est_log();
        trace!(target: "lodestone.planner", sort_cost = r_sort_cost.0, "sort cost");
    }
    let mut a_from = vec![seed];

    for i_loop in 0..n_loop {
        let mut a_to: Vec<WherePath> = Vec::new();
        let mut mx_cost = Cost::ZERO;

        for p_from in &a_from {
            for (wl_idx, wl) in inp.loops.iter().enumerate() {
                if !wl.prereq.is_subset_of(p_from.mask_loop) {
                    continue;
                }
                if wl.mask_self.overlaps(p_from.mask_loop) {
                    continue;
                }
                // A candidate next loop: cost it and check ordering.
                let mut r_cost = Cost::plus(wl.r_setup, wl.r_run + p_from.n_row);
                r_cost = r_cost.plus(p_from.r_cost);
                let mask_new = p_from.mask_loop | wl.mask_self;
                let mut rev_new = Bitmask::EMPTY;
                let mut is_ordered = p_from.is_ordered;
                let mut is_ordered_valid = p_from.is_ordered_valid;
                if is_ordered_valid {
                    rev_new = p_from.rev_loop;
                } else if let Some(order_by) = inp.order_by {
                    let prefix: Vec<&WhereLoop> =
                        p_from.loops.iter().map(|&i| &inp.loops[i]).collect();
                    match path_satisfies_order_by(
                        &inp.order_cx,
                        order_by,
                        &prefix,
                        inp.mode,
                        i_loop,
                        wl,
                        &mut rev_new,
                    ) {
                        OrderCheck::Satisfied => {
                            is_ordered = true;
                            is_ordered_valid = true;
                        }
                        OrderCheck::NotSatisfied => {
                            is_ordered = false;
                            is_ordered_valid = true;
                            r_cost = r_cost.plus(r_sort_cost);
                        }
                        OrderCheck::Unknown => {}
                    }
                }

                // Keep the mx_choice best paths, one per distinct
                // (loop-set, ordering-known) key.
                let existing = a_to
                    .iter()
                    .position(|t| t.mask_loop == mask_new && t.is_ordered_valid == is_ordered_valid);
                let jj = match existing {
                    None => {
                        if a_to.len() >= mx_choice {
                            if r_cost >= mx_cost {
                                continue;
                            }
                            // Replace the costliest retained path.
                            let mut jj = a_to.len() - 1;
                            while a_to[jj].r_cost < mx_cost {
                                debug_assert!(jj > 0);
                                jj -= 1;
                            }
                            jj
                        } else {
                            a_to.push(WherePath::default());
                            a_to.len() - 1
                        }
                    }
                    Some(jj) => {
                        // An equivalent path exists; keep the earlier one
                        // on ties so planning stays deterministic.
                        if a_to[jj].r_cost <= r_cost {
                            continue;
                        }
                        jj
                    }
                };

                let mut new_loops = Vec::with_capacity(i_loop + 1);
                new_loops.extend_from_slice(&p_from.loops);
                new_loops.push(wl_idx);
                a_to[jj] = WherePath {
                    mask_loop: mask_new,
                    rev_loop: rev_new,
                    n_row: p_from.n_row + wl.n_out,
                    r_cost,
                    is_ordered,
                    is_ordered_valid,
                    loops: new_loops,
                };
                if a_to.len() >= mx_choice {
                    mx_cost = a_to
                        .iter()
                        .map(|p| p.r_cost)
                        .max()
                        .unwrap_or(Cost::ZERO);
                }
            }
        }

        trace!(
            target: "lodestone.planner",
            round = i_loop,
            paths = a_to.len(),
            "solver round complete"
        );
        a_from = a_to;
    }

    if a_from.is_empty() {
        return Err(PlanError::NoQuerySolution);
    }

    // The lowest-cost complete path wins; the earliest on equal cost.
    let mut best = 0;
    for i in 1..a_from.len() {
        if a_from[i].r_cost < a_from[best].r_cost {
            best = i;
        }
    }
    let chosen = a_from.swap_remove(best);
    debug!(
        target: "lodestone.planner",
        cost = chosen.r_cost.0,
        n_row = chosen.n_row.0,
        ordered = chosen.is_ordered,
        "solution"
    );
    Ok(Solution {
        loops: chosen.loops,
        n_row: chosen.n_row,
        r_cost: chosen.r_cost,
        is_ordered: chosen.is_ordered_valid && chosen.is_ordered,
        rev_mask: chosen.rev_loop,
    })
}
