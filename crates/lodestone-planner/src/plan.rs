//! The finished plan handed to the code emitter.
//!
//! Planning ends here: one [`PlanLevel`] per join level, outermost first,
//! each naming the table to open, the scan strategy, the terms the scan
//! consumes (so the emitter will not re-test them), and the reverse flag.
//! The emitter walks this structure and produces the actual nested scan
//! loops; everything it needs to know is in the plan, and nothing about
//! opcode generation leaks back into the planner.

use std::fmt;

use lodestone_types::{Bitmask, Cost, CursorId, BMS};
use serde::{Deserialize, Serialize};

use crate::catalog::FromItem;
use crate::clause::{wo, ClauseId, ClauseSet, TermRef};
use crate::expr::binary_compare_collation;
use crate::loops::{wf, LoopIndex, LoopPayload, WhereLoop};
use lodestone_ast::Expr;

// ---------------------------------------------------------------------------
// Distinct handling
// ---------------------------------------------------------------------------

/// How the emitter must treat a DISTINCT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistinctMode {
    /// No DISTINCT was requested.
    Noop,
    /// The output is provably duplicate-free; skip deduplication.
    Unique,
    /// Duplicates arrive adjacent; a one-row comparison suffices.
    Ordered,
    /// Duplicates may arrive anywhere; a dedup structure is required.
    Unordered,
}

// ---------------------------------------------------------------------------
// Scan strategies
// ---------------------------------------------------------------------------

/// Descriptor of a transient index the emitter must build before the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoIndexPlan {
    /// Columns constrained by equalities, in probe order.
    pub eq_columns: Vec<i32>,
    /// Collation per equality column.
    pub collations: Vec<String>,
    /// Additional columns appended so the index covers the query.
    pub extra_columns: Vec<i32>,
}

/// How one join level scans its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPlan {
    /// Read every row.
    FullScan,
    /// Drive a catalog index.
    IndexScan {
        /// Position in the table's index list.
        index: usize,
        index_name: String,
        /// Leading key fields constrained by equality (or IN / IS NULL).
        n_eq: u16,
        /// Term supplying the lower range bound, if any.
        range_btm: Option<TermRef>,
        /// Term supplying the upper range bound, if any.
        range_top: Option<TermRef>,
        /// The index covers every column the query reads.
        covering: bool,
        /// At most one row matches.
        one_row: bool,
    },
    /// Build a transient index, then drive it.
    AutoIndex { descriptor: AutoIndexPlan },
    /// Delegate to the virtual table with the module's chosen plan.
    VirtualScan {
        idx_num: i32,
        idx_str: Option<String>,
        /// Terms per argument slot; `None` slots stay unbound.
        arg_map: Vec<Option<TermRef>>,
        /// Constraints the module fully enforces.
        omit_mask: u16,
    },
    /// Union of per-operand index scans for an OR term, deduplicated
    /// through a row-set.
    OrUnion {
        /// The OR term being implemented.
        term: TermRef,
        /// Its operands, each to be planned as a one-table subquery.
        branches: Vec<TermRef>,
    },
}

/// One nesting level of the chosen plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLevel {
    /// Position in the FROM list.
    pub from_pos: usize,
    /// Cursor to open.
    pub cursor: CursorId,
    /// Scan in descending key order to satisfy the ORDER BY.
    pub reversed: bool,
    /// Terms this level consumes; the emitter must not re-test them.
    pub consumed_terms: Vec<TermRef>,
    pub scan: ScanPlan,
}

/// The complete product of planning.
#[derive(Debug)]
pub struct WherePlan {
    /// One entry per join level, outermost first.
    pub levels: Vec<PlanLevel>,
    /// The output already satisfies the ORDER BY; no sort pass needed.
    pub order_by_satisfied: bool,
    /// Per-level reverse-scan bits (bit i = level i).
    pub rev_mask: Bitmask,
    /// Estimated output rows, log-encoded.
    pub n_row_out: Cost,
    pub distinct: DistinctMode,
    /// An UPDATE or DELETE may operate directly on the visited rows.
    pub ok_one_pass: bool,
    /// The analyzed WHERE terms, owned by the plan so the emitter can
    /// resolve [`TermRef`]s and evaluate residue terms.
    pub clauses: ClauseSet,
    /// The main conjunction within `clauses`.
    pub main_clause: ClauseId,
}

impl WherePlan {
    /// Estimated output rows as an ordinary integer.
    #[must_use]
    pub fn estimated_rows(&self) -> u64 {
        self.n_row_out.to_rows()
    }

    /// Terms of the main clause the chosen plan does not consume; the
    /// emitter applies them as filters inside the innermost loop.
    #[must_use]
    pub fn residue_terms(&self) -> Vec<TermRef> {
        let consumed: Vec<TermRef> = self
            .levels
            .iter()
            .flat_map(|l| l.consumed_terms.iter().copied())
            .collect();
        let n = self.clauses.clause(self.main_clause).terms.len();
        (0..n)
            .map(|i| TermRef {
                clause: self.main_clause,
                term: i,
            })
            .filter(|tr| !consumed.contains(tr))
            .collect()
    }

    /// A serializable one-line-per-level summary for logging.
    #[must_use]
    pub fn summary(&self, from: &[FromItem<'_>]) -> PlanSummary {
        PlanSummary {
            levels: self
                .levels
                .iter()
                .map(|l| {
                    let table = from[l.from_pos].table.name.clone();
                    let (scan, index) = match &l.scan {
                        ScanPlan::FullScan => ("scan".to_owned(), None),
                        ScanPlan::IndexScan {
                            index_name, n_eq, ..
                        } => (format!("search eq={n_eq}"), Some(index_name.clone())),
                        ScanPlan::AutoIndex { .. } => {
                            ("auto-index".to_owned(), Some("auto-index".to_owned()))
                        }
                        ScanPlan::VirtualScan { idx_num, .. } => {
                            (format!("virtual idx={idx_num}"), None)
                        }
                        ScanPlan::OrUnion { branches, .. } => {
                            (format!("or-union of {}", branches.len()), None)
                        }
                    };
                    LevelSummary {
                        table,
                        scan,
                        index,
                        reversed: l.reversed,
                    }
                })
                .collect(),
            estimated_rows: self.estimated_rows(),
            order_by_satisfied: self.order_by_satisfied,
            distinct: self.distinct,
        }
    }
}

/// Serializable plan summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub levels: Vec<LevelSummary>,
    pub estimated_rows: u64,
    pub order_by_satisfied: bool,
    pub distinct: DistinctMode,
}

/// One level of a [`PlanSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelSummary {
    pub table: String,
    pub scan: String,
    pub index: Option<String>,
    pub reversed: bool,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "QUERY PLAN (~{} rows):", self.estimated_rows)?;
        for (i, l) in self.levels.iter().enumerate() {
            let idx = l
                .index
                .as_deref()
                .map_or(String::new(), |n| format!(" USING INDEX {n}"));
            let rev = if l.reversed { " REVERSE" } else { "" };
            writeln!(f, "  {i}: {} {}{idx}{rev}", l.scan.to_uppercase(), l.table)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Building levels out of the chosen loops
// ---------------------------------------------------------------------------

fn peel(e: &Expr) -> &Expr {
    match e.skip_collate() {
        Expr::FromJoin { expr, .. } => expr.skip_collate(),
        other => other,
    }
}

fn term_operands(e: &Expr) -> (Option<&Expr>, Option<&Expr>) {
    match peel(e) {
        Expr::Compare { left, right, .. } => (Some(left.as_ref()), Some(right.as_ref())),
        Expr::In { lhs, .. } => (Some(lhs.as_ref()), None),
        Expr::IsNull { expr, .. } => (Some(expr.as_ref()), None),
        _ => (None, None),
    }
}

fn auto_index_descriptor(
    cs: &ClauseSet,
    fi: &FromItem<'_>,
    wl: &WhereLoop,
) -> AutoIndexPlan {
    let mut eq_columns = Vec::new();
    let mut collations = Vec::new();
    for tr in wl.consumed_terms() {
        let t = cs.term(tr);
        if eq_columns.contains(&t.left_column) {
            continue;
        }
        eq_columns.push(t.left_column);
        let (left, right) = term_operands(&t.expr);
        let coll = left.map_or_else(
            || "BINARY".to_owned(),
            |l| binary_compare_collation(l, right, std::slice::from_ref(fi)),
        );
        collations.push(coll);
    }
    // The transient index must cover the query: it cannot be kept in sync
    // with the table, so the table is never consulted.
    let mut extra_columns = Vec::new();
    let n_col = fi.table.columns.len();
    for c in 0..n_col.min(BMS - 1) {
        #[allow(clippy::cast_possible_wrap)]
        let ci = c as i32;
        if Bitmask::bit(c).is_subset_of(fi.columns_used) && !eq_columns.contains(&ci) {
            extra_columns.push(ci);
        }
    }
    if n_col > BMS - 1 && Bitmask::bit(BMS - 1).is_subset_of(fi.columns_used) {
        for c in (BMS - 1)..n_col {
            #[allow(clippy::cast_possible_wrap)]
            extra_columns.push(c as i32);
        }
    }
    AutoIndexPlan {
        eq_columns,
        collations,
        extra_columns,
    }
}

/// Translate the solver's chosen loops into emitter-facing levels.
pub(crate) fn build_levels(
    cs: &ClauseSet,
    from: &[FromItem<'_>],
    loops: &[WhereLoop],
    chosen: &[usize],
    rev_mask: Bitmask,
) -> Vec<PlanLevel> {
    let mut levels = Vec::with_capacity(chosen.len());
    for (i, &li) in chosen.iter().enumerate() {
        let wl = &loops[li];
        let fi = &from[wl.tab_pos];
        let scan = if wl.flags & wf::MULTI_OR != 0 {
            match wl.consumed_terms().next() {
                Some(term) => {
                    let branches =
                        cs.term(term).or_info.as_ref().map_or_else(Vec::new, |info| {
                            (0..cs.clause(info.clause).terms.len())
                                .map(|t| TermRef {
                                    clause: info.clause,
                                    term: t,
                                })
                                .collect()
                        });
                    ScanPlan::OrUnion { term, branches }
                }
                None => ScanPlan::FullScan,
            }
        } else if wl.flags & wf::VIRTUALTABLE != 0 {
            match &wl.payload {
                LoopPayload::Vtab(v) => ScanPlan::VirtualScan {
                    idx_num: v.idx_num,
                    idx_str: v.idx_str.clone(),
                    arg_map: wl.terms.to_vec(),
                    omit_mask: v.omit_mask,
                },
                LoopPayload::BTree { .. } => ScanPlan::FullScan,
            }
        } else {
            match &wl.payload {
                LoopPayload::BTree {
                    index: Some(LoopIndex::Auto),
                    ..
                } => ScanPlan::AutoIndex {
                    descriptor: auto_index_descriptor(cs, fi, wl),
                },
                LoopPayload::BTree {
                    n_eq,
                    index: Some(LoopIndex::Catalog(pos)),
                } => {
                    let mut range_btm = None;
                    let mut range_top = None;
                    for tr in wl.consumed_terms() {
                        let eop = cs.term(tr).e_operator;
                        if eop & (wo::GT | wo::GE) != 0 {
                            range_btm = Some(tr);
                        } else if eop & (wo::LT | wo::LE) != 0 {
                            range_top = Some(tr);
                        }
                    }
                    ScanPlan::IndexScan {
                        index: *pos,
                        index_name: fi.table.indexes[*pos].name.clone(),
                        n_eq: *n_eq,
                        range_btm,
                        range_top,
                        covering: wl.flags & wf::IDX_ONLY != 0,
                        one_row: wl.flags & wf::ONEROW != 0,
                    }
                }
                _ => ScanPlan::FullScan,
            }
        };
        levels.push(PlanLevel {
            from_pos: wl.tab_pos,
            cursor: fi.cursor,
            reversed: Bitmask::bit(i).is_subset_of(rev_mask),
            consumed_terms: wl.consumed_terms().collect(),
            scan,
        });
    }
    levels
}
