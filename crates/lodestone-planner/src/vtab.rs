//! Virtual-table planning.
//!
//! A virtual table plans its own scans: the planner describes the usable
//! constraints and the ORDER BY, and the module's `best_index` method
//! answers with a cost, an opaque `(idx_num, idx_str)` plan identifier,
//! the constraint-to-argument mapping, and whether its output satisfies
//! the ORDER BY.
//!
//! `best_index` is consulted in up to four phases of increasing constraint
//! availability (constants without IN, constants with IN, variables
//! without IN, then everything) so the cost of each regime is known and
//! the join-order search can weigh them against each other.

use lodestone_ast::Expr;
use lodestone_types::{Bitmask, Cost};
use tracing::trace;

use crate::clause::{tf, wo, TermRef};
use crate::loops::{loop_insert, BuildCx, LoopPayload, OrSet, VtabLoop, WhereLoop};
use crate::scan::ScanLink;
use lodestone_error::{PlanError, Result};

// ---------------------------------------------------------------------------
// The best_index exchange structure
// ---------------------------------------------------------------------------

/// Constraint operators surfaced to a virtual table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
}

/// One WHERE constraint on the virtual table.
#[derive(Debug, Clone)]
pub struct IndexConstraint {
    /// Column the constraint applies to.
    pub column: i32,
    pub op: ConstraintOp,
    /// Whether the constraint's RHS is available in the current phase.
    pub usable: bool,
    pub(crate) term: TermRef,
}

/// One ORDER BY term, when the whole ORDER BY refers to this table.
#[derive(Debug, Clone, Copy)]
pub struct IndexOrderBy {
    pub column: i32,
    pub desc: bool,
}

/// The module's answer for one constraint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintUsage {
    /// 1-based argument slot the constraint's RHS should be passed in;
    /// 0 leaves the constraint to the generic filter.
    pub argv_index: i32,
    /// The module fully enforces the constraint; the emitter may skip
    /// re-checking it.
    pub omit: bool,
}

/// The structure exchanged with `best_index`.
#[derive(Debug)]
pub struct BestIndexInfo {
    pub constraints: Vec<IndexConstraint>,
    pub order_by: Vec<IndexOrderBy>,
    /// Filled in by the module, parallel to `constraints`.
    pub usage: Vec<ConstraintUsage>,
    pub idx_num: i32,
    pub idx_str: Option<String>,
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
}

impl BestIndexInfo {
    fn reset(&mut self) {
        self.usage = vec![ConstraintUsage::default(); self.constraints.len()];
        self.idx_num = 0;
        self.idx_str = None;
        self.order_by_consumed = false;
        self.estimated_cost = f64::MAX / 2.0;
    }
}

/// The planning entry point a virtual-table module implements.
pub trait VirtualTable {
    /// Choose a plan for the given constraints; errors surface as
    /// compile-time failures of the statement.
    fn best_index(&self, info: &mut BestIndexInfo) -> std::result::Result<(), String>;
}

// ---------------------------------------------------------------------------
// Building the exchange structure
// ---------------------------------------------------------------------------

fn constraint_op(e_operator: u16) -> Option<ConstraintOp> {
    // IN probes are presented as equalities; the emitter drives the
    // module once per element.
    match e_operator & wo::ALL & !wo::EQUIV {
        x if x & (wo::EQ | wo::IN) != 0 => Some(ConstraintOp::Eq),
        x if x & wo::LT != 0 => Some(ConstraintOp::Lt),
        x if x & wo::LE != 0 => Some(ConstraintOp::Le),
        x if x & wo::GT != 0 => Some(ConstraintOp::Gt),
        x if x & wo::GE != 0 => Some(ConstraintOp::Ge),
        x if x & wo::MATCH != 0 => Some(ConstraintOp::Match),
        _ => None,
    }
}

fn collect_constraints(
    cx: &BuildCx<'_, '_>,
    chain_head: ScanLink,
    cursor: lodestone_types::CursorId,
) -> Vec<IndexConstraint> {
    let term_refs: Vec<TermRef> = match chain_head {
        ScanLink::Clause(c) => (0..cx.cs.clause(c).terms.len())
            .map(|i| TermRef { clause: c, term: i })
            .collect(),
        ScanLink::Single(t) => vec![t],
    };
    let mut out = Vec::new();
    for tr in term_refs {
        let t = cx.cs.term(tr);
        if t.left_cursor != Some(cursor) {
            continue;
        }
        if t.e_operator & wo::ISNULL != 0 || t.flags & tf::VNULL != 0 {
            continue;
        }
        let Some(op) = constraint_op(t.e_operator) else {
            continue;
        };
        out.push(IndexConstraint {
            column: t.left_column,
            op,
            usable: false,
            term: tr,
        });
    }
    out
}

fn collect_order_by(cx: &BuildCx<'_, '_>, cursor: lodestone_types::CursorId) -> Vec<IndexOrderBy> {
    let Some(order_by) = cx.order_by else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(order_by.len());
    for term in order_by {
        let Expr::Column { cursor: c, column, .. } = term.expr.skip_collate() else {
            return Vec::new();
        };
        if *c != cursor {
            return Vec::new();
        }
        out.push(IndexOrderBy {
            column: *column,
            desc: term.sort_order == lodestone_ast::SortOrder::Desc,
        });
    }
    out
}

// ---------------------------------------------------------------------------
// The loop builder
// ---------------------------------------------------------------------------

/// Add candidate loops for a virtual table by interrogating its
/// `best_index` method across the usability phases.
pub(crate) fn add_virtual_loops(
    cx: &BuildCx<'_, '_>,
    chain: &[ScanLink],
    loops: &mut Vec<WhereLoop>,
    mut or_set: Option<&mut OrSet>,
    tab_pos: usize,
) -> Result<()> {
    let fi = &cx.from[tab_pos];
    let crate::catalog::TableKind::Virtual(module) = &fi.table.kind else {
        debug_assert!(false, "add_virtual_loops on a b-tree table");
        return Ok(());
    };

    let mut info = BestIndexInfo {
        constraints: collect_constraints(cx, chain[0], fi.cursor),
        order_by: collect_order_by(cx, fi.cursor),
        usage: Vec::new(),
        idx_num: 0,
        idx_str: None,
        order_by_consumed: false,
        estimated_cost: f64::MAX / 2.0,
    };
    let n_constraint = info.constraints.len();

    let mut seen_in = false;
    let mut seen_var = false;
    for c in &info.constraints {
        let t = cx.cs.term(c.term);
        if t.e_operator & wo::IN != 0 {
            seen_in = true;
        }
        if !t.prereq_right.is_empty() {
            seen_var = true;
        }
    }

    for phase in 0..=3u8 {
        if !seen_in && phase & 1 != 0 {
            continue;
        }
        if !seen_var && phase > 1 {
            break;
        }
        for i in 0..n_constraint {
            let t = cx.cs.term(info.constraints[i].term);
            let is_in = t.e_operator & wo::IN != 0;
            let is_const = t.prereq_right.is_empty();
            info.constraints[i].usable = match phase {
                0 => is_const && !is_in,
                1 => is_const,
                2 => !is_in,
                _ => true,
            };
        }
        info.reset();

        trace!(
            target: "lodestone.planner",
            table = %fi.table.name,
            phase,
            "best_index probe"
        );
        module.best_index(&mut info).map_err(|message| {
            PlanError::BestIndexFailed {
                table: fi.table.name.clone(),
                message,
            }
        })?;

        // A module may not claim an argument slot for a constraint it was
        // told is unusable.
        for i in 0..n_constraint {
            if !info.constraints[i].usable && info.usage[i].argv_index > 0 {
                return Err(PlanError::BestIndexMalfunction {
                    table: fi.table.name.clone(),
                });
            }
        }

        let mut new = WhereLoop::template(tab_pos, cx.masks.mask_of(fi.cursor));
        new.flags = crate::loops::wf::VIRTUALTABLE;
        new.r_setup = Cost::ZERO;
        new.terms = smallvec::smallvec![None; n_constraint];
        let mut prereq = Bitmask::EMPTY;
        let mut omit_mask = 0u16;
        let mut mx_term: i32 = -1;
        let mut order_by_consumed = info.order_by_consumed;
        let mut ok = true;

        for i in 0..n_constraint {
            let i_term = info.usage[i].argv_index - 1;
            if i_term < 0 {
                continue;
            }
            let i_term = i_term as usize;
            if i_term >= n_constraint || new.terms[i_term].is_some() {
                return Err(PlanError::BestIndexMalfunction {
                    table: fi.table.name.clone(),
                });
            }
            let tr = info.constraints[i].term;
            let t = cx.cs.term(tr);
            prereq |= t.prereq_right;
            new.terms[i_term] = Some(tr);
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            {
                mx_term = mx_term.max(i_term as i32);
            }
            if i_term < 16 && info.usage[i].omit {
                omit_mask |= 1 << i_term;
            }
            if t.e_operator & wo::IN != 0 {
                if !info.usage[i].omit {
                    // An IN constraint the module cannot fully enforce
                    // would repeat rows; discard this plan.
                    ok = false;
                    break;
                }
                // IN probes deliver values in no particular order and
                // never merge runs, so the ORDER BY is not consumed.
                order_by_consumed = false;
            }
        }

        if ok {
            new.terms.truncate((mx_term + 1).max(0) as usize);
            new.prereq = prereq;
            new.payload = LoopPayload::Vtab(VtabLoop {
                idx_num: info.idx_num,
                idx_str: info.idx_str.clone(),
                ordered: !info.order_by.is_empty() && order_by_consumed,
                omit_mask,
            });
            new.r_run = Cost::from_f64(info.estimated_cost);
            // Every virtual table query is assumed to return ~25 rows.
            new.n_out = Cost(46);
            loop_insert(loops, or_set.as_deref_mut(), &new);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_ops_map_one_hot_codes() {
        assert_eq!(constraint_op(wo::EQ), Some(ConstraintOp::Eq));
        assert_eq!(constraint_op(wo::IN), Some(ConstraintOp::Eq));
        assert_eq!(constraint_op(wo::EQ | wo::EQUIV), Some(ConstraintOp::Eq));
        assert_eq!(constraint_op(wo::LT), Some(ConstraintOp::Lt));
        assert_eq!(constraint_op(wo::MATCH), Some(ConstraintOp::Match));
        assert_eq!(constraint_op(0), None);
        assert_eq!(constraint_op(wo::EQUIV), None);
    }
}
