//! Candidate loop enumeration.
//!
//! For each FROM-list entry the builder enumerates every potentially
//! useful way of scanning that one table: the full scan, each index with
//! zero or more leading equalities plus an optional range, a transient
//! automatic index, the virtual-table module's own plans, and unions of
//! index scans implementing an OR term. Each candidate carries a cost
//! vector (one-time setup, per-scan run cost, estimated output rows) and a
//! prerequisite mask of tables that must already be positioned.
//!
//! Planning then reduces to choosing one loop per table such that all
//! prerequisites are met and the combined cost is minimal; that part lives
//! in the solver.

use lodestone_ast::{Expr, InSet, Literal, OrderingTerm};
use lodestone_types::{Bitmask, Cost};
use smallvec::SmallVec;
use tracing::trace;

use crate::catalog::{FromItem, IndexKind, IndexProbe, JoinKind};
use crate::clause::{tf, wo, ClauseId, ClauseSet, TermRef};
use crate::expr::index_affinity_ok;
use crate::masks::MaskSet;
use crate::scan::{chain_from, ScanLink, TermScan};
use crate::stats::{equal_scan_est, in_scan_est, literal_to_sample, range_scan_est, RangeBound};
use crate::vtab::add_virtual_loops;
use crate::PlannerOptions;
use lodestone_error::Result;

// ---------------------------------------------------------------------------
// Loop flags
// ---------------------------------------------------------------------------

/// Bits of [`WhereLoop::flags`] describing the shape of the plan.
pub mod wf {
    /// `x = EXPR`
    pub const COLUMN_EQ: u32 = 0x0000_0001;
    /// `x < EXPR` and/or `x > EXPR`
    pub const COLUMN_RANGE: u32 = 0x0000_0002;
    /// `x IN (...)`
    pub const COLUMN_IN: u32 = 0x0000_0004;
    /// `x IS NULL`
    pub const COLUMN_NULL: u32 = 0x0000_0008;
    /// Any of the constraint shapes above.
    pub const CONSTRAINT: u32 = 0x0000_000f;
    /// `x < EXPR` or `x <= EXPR` bounds the scan from above.
    pub const TOP_LIMIT: u32 = 0x0000_0010;
    /// `x > EXPR` or `x >= EXPR` bounds the scan from below.
    pub const BTM_LIMIT: u32 = 0x0000_0020;
    /// The index alone satisfies the query; the table is never read.
    pub const IDX_ONLY: u32 = 0x0000_0040;
    /// The index is the table's primary key.
    pub const PRIMARY_KEY: u32 = 0x0000_0100;
    /// A catalog or automatic index drives the scan.
    pub const INDEXED: u32 = 0x0000_0200;
    /// The loop comes from a virtual table's planning method.
    pub const VIRTUALTABLE: u32 = 0x0000_0400;
    /// Selects no more than one row.
    pub const ONEROW: u32 = 0x0000_1000;
    /// Union of index scans implementing an OR term.
    pub const MULTI_OR: u32 = 0x0000_2000;
    /// The scan builds and probes a transient index.
    pub const AUTO_INDEX: u32 = 0x0000_4000;
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Which index a b-tree loop uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopIndex {
    /// Position within the table's index list.
    Catalog(usize),
    /// A transient index synthesized for this statement. The descriptor is
    /// derived from the loop's driving terms at hand-off time and owned by
    /// the plan.
    Auto,
}

/// Payload of a virtual-table loop, as returned by `best_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtabLoop {
    pub idx_num: i32,
    pub idx_str: Option<String>,
    /// The module promises output in ORDER BY order.
    pub ordered: bool,
    /// Constraints the emitter need not re-check. Capped at 16 argument
    /// slots.
    pub omit_mask: u16,
}

/// Union-typed payload: a loop is either a b-tree scan or a virtual-table
/// scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopPayload {
    BTree {
        /// Number of leading equality constraints on the index.
        n_eq: u16,
        index: Option<LoopIndex>,
    },
    Vtab(VtabLoop),
}

/// One candidate algorithm for scanning one FROM-list table.
#[derive(Debug, Clone)]
pub struct WhereLoop {
    /// Tables that must be positioned before this loop can run.
    pub prereq: Bitmask,
    /// The single bit identifying this loop's own table.
    pub mask_self: Bitmask,
    /// Position in the FROM list.
    pub tab_pos: usize,
    /// Distinguishes loops kept for their ordering; 0 when the loop does
    /// not help ORDER BY.
    pub sort_idx: u8,
    /// One-time setup cost (e.g. building a transient index).
    pub r_setup: Cost,
    /// Cost of one full execution of the loop.
    pub r_run: Cost,
    /// Estimated number of output rows.
    pub n_out: Cost,
    /// `wf::*` bits.
    pub flags: u32,
    /// Terms consumed by this loop. For virtual-table loops the position
    /// is the argument slot and unused slots are `None`.
    pub terms: SmallVec<[Option<TermRef>; 4]>,
    pub payload: LoopPayload,
}

impl WhereLoop {
    pub(crate) fn template(tab_pos: usize, mask_self: Bitmask) -> Self {
        Self {
            prereq: Bitmask::EMPTY,
            mask_self,
            tab_pos,
            sort_idx: 0,
            r_setup: Cost::ZERO,
            r_run: Cost::ZERO,
            n_out: Cost::ZERO,
            flags: 0,
            terms: SmallVec::new(),
            payload: LoopPayload::BTree {
                n_eq: 0,
                index: None,
            },
        }
    }

    /// Leading-equality count of a b-tree loop; 0 for virtual tables.
    #[must_use]
    pub fn n_eq(&self) -> u16 {
        match &self.payload {
            LoopPayload::BTree { n_eq, .. } => *n_eq,
            LoopPayload::Vtab(_) => 0,
        }
    }

    fn set_n_eq(&mut self, v: u16) {
        if let LoopPayload::BTree { n_eq, .. } = &mut self.payload {
            *n_eq = v;
        }
    }

    /// Catalog index position, when this loop scans one.
    #[must_use]
    pub fn catalog_index(&self) -> Option<usize> {
        match &self.payload {
            LoopPayload::BTree {
                index: Some(LoopIndex::Catalog(i)),
                ..
            } => Some(*i),
            _ => None,
        }
    }

    /// Consumed terms, skipping unused virtual-table argument slots.
    pub fn consumed_terms(&self) -> impl Iterator<Item = TermRef> + '_ {
        self.terms.iter().filter_map(|t| *t)
    }
}

// ---------------------------------------------------------------------------
// OR-cost sets
// ---------------------------------------------------------------------------

/// Maximum number of (prereq, cost, rows) triples retained per OR operand.
const N_OR_COST: usize = 3;

/// Cost of running one OR operand as a subquery.
#[derive(Debug, Clone, Copy)]
pub struct OrCost {
    pub prereq: Bitmask,
    pub r_run: Cost,
    pub n_out: Cost,
}

/// The best few ways of running one OR operand.
#[derive(Debug, Default)]
pub struct OrSet {
    entries: SmallVec<[OrCost; N_OR_COST]>,
}

impl OrSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrCost> {
        self.entries.iter()
    }

    /// Try to add an entry, keeping only the best few: an entry that is
    /// no cheaper and no less dependent than an existing one is dropped,
    /// an entry that dominates an existing one overwrites it, and when
    /// the set is full the costliest entry gives way.
    pub fn insert(&mut self, prereq: Bitmask, r_run: Cost, n_out: Cost) -> bool {
        let mut slot = None;
        for (i, p) in self.entries.iter().enumerate() {
            if r_run <= p.r_run && prereq.is_subset_of(p.prereq) {
                slot = Some(i);
                break;
            }
            if p.r_run <= r_run && p.prereq.is_subset_of(prereq) {
                return false;
            }
        }
        let i = match slot {
            Some(i) => i,
            None => {
                if self.entries.len() < N_OR_COST {
                    self.entries.push(OrCost {
                        prereq,
                        r_run,
                        n_out,
                    });
                    self.entries.len() - 1
                } else {
                    let mut worst = 0;
                    for i in 1..self.entries.len() {
                        if self.entries[i].r_run > self.entries[worst].r_run {
                            worst = i;
                        }
                    }
                    if self.entries[worst].r_run <= r_run {
                        return false;
                    }
                    worst
                }
            }
        };
        let e = &mut self.entries[i];
        e.prereq = prereq;
        e.r_run = r_run;
        if e.n_out > n_out {
            e.n_out = n_out;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Loop insertion
// ---------------------------------------------------------------------------

fn same_catalog_index(a: &WhereLoop, b: &WhereLoop) -> bool {
    a.flags & wf::INDEXED != 0
        && b.flags & wf::INDEXED != 0
        && a.catalog_index().is_some()
        && a.catalog_index() == b.catalog_index()
}

/// Insert or replace a candidate loop.
///
/// A new loop is measured against each existing loop on the same table
/// and sort-index: if an existing loop is at least as good in
/// dependencies, setup cost, and run cost, the new one is dropped,
/// unless it uses strictly more terms of the same index with identical
/// prerequisites, in which case it replaces the old. Conversely a new
/// loop that dominates an existing one overwrites it in place.
///
/// When `or_set` is given only the (prereq, cost, rows) triple is
/// recorded; this mode is used while costing OR operands.
pub(crate) fn loop_insert(
    loops: &mut Vec<WhereLoop>,
    or_set: Option<&mut OrSet>,
    template: &WhereLoop,
) {
    if let Some(os) = or_set {
        os.insert(template.prereq, template.r_run, template.n_out);
        return;
    }
    for i in 0..loops.len() {
        let p = &loops[i];
        if p.tab_pos != template.tab_pos || p.sort_idx != template.sort_idx {
            continue;
        }
        // Automatic-index loops are enumerated first, so an existing
        // compatible loop never has smaller setup cost.
        debug_assert!(p.r_setup >= template.r_setup);
        if p.prereq.is_subset_of(template.prereq)
            && p.r_setup <= template.r_setup
            && p.r_run <= template.r_run
        {
            if p.terms.len() < template.terms.len()
                && same_catalog_index(p, template)
                && p.prereq == template.prereq
            {
                trace!(target: "lodestone.planner", tab = p.tab_pos, "loop widened in place");
                loops[i] = template.clone();
            } else {
                trace!(target: "lodestone.planner", tab = p.tab_pos, "loop insert no-op");
            }
            return;
        }
        if template.prereq.is_subset_of(p.prereq)
            && p.r_run >= template.r_run
            && p.r_setup >= template.r_setup
        {
            trace!(target: "lodestone.planner", tab = p.tab_pos, "loop replaced");
            loops[i] = template.clone();
            return;
        }
    }
    loops.push(template.clone());
}

// ---------------------------------------------------------------------------
// Builder context
// ---------------------------------------------------------------------------

/// Read-only state shared by the loop builders.
#[derive(Clone, Copy)]
pub(crate) struct BuildCx<'a, 'f> {
    pub cs: &'a ClauseSet,
    pub from: &'a [FromItem<'f>],
    pub masks: &'a MaskSet,
    pub opts: &'a PlannerOptions,
    pub order_by: Option<&'a [OrderingTerm]>,
    pub main_clause: ClauseId,
}

/// Terms of the first (innermost) link of a scan chain. Used where the
/// original clause (not its enclosing conjunctions) supplies the
/// candidate terms.
fn link_terms(cs: &ClauseSet, link: ScanLink) -> Vec<TermRef> {
    match link {
        ScanLink::Clause(c) => (0..cs.clause(c).terms.len())
            .map(|i| TermRef { clause: c, term: i })
            .collect(),
        ScanLink::Single(t) => vec![t],
    }
}

/// Whether `term` could drive an index on `fi` if a suitable one existed.
fn term_can_drive_index(
    cx: &BuildCx<'_, '_>,
    term_ref: TermRef,
    fi: &FromItem<'_>,
    not_ready: Bitmask,
) -> bool {
    let term = cx.cs.term(term_ref);
    if term.left_cursor != Some(fi.cursor) {
        return false;
    }
    if term.e_operator & wo::EQ == 0 {
        return false;
    }
    if term.prereq_right.overlaps(not_ready) {
        return false;
    }
    if term.left_column < 0 {
        return false;
    }
    let aff = fi.table.column_affinity(term.left_column);
    index_affinity_ok(peel(&term.expr), aff, cx.from)
}

fn peel(e: &Expr) -> &Expr {
    match e.skip_collate() {
        Expr::FromJoin { expr, .. } => expr.skip_collate(),
        other => other,
    }
}

/// Whether `index` could be useful in implementing the ORDER BY clause.
fn index_might_help_order_by(cx: &BuildCx<'_, '_>, probe: &IndexProbe<'_>, fi: &FromItem<'_>) -> bool {
    if probe.index.unordered {
        return false;
    }
    let Some(order_by) = cx.order_by else {
        return false;
    };
    for term in order_by {
        let e = peel(&term.expr);
        let Expr::Column { cursor, column, .. } = e else {
            return false;
        };
        if *cursor == fi.cursor
            && probe
                .index
                .columns
                .iter()
                .any(|ic| ic.column == *column)
        {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// B-tree loops
// ---------------------------------------------------------------------------

/// The literal RHS of a term, if it has one the histogram can place.
fn term_rhs_literal(cs: &ClauseSet, tr: TermRef) -> Option<Literal> {
    match peel(&cs.term(tr).expr) {
        Expr::Compare { right, .. } => match right.skip_collate() {
            Expr::Literal(l, _) => Some(l.clone()),
            _ => None,
        },
        Expr::IsNull { .. } => Some(Literal::Null),
        _ => None,
    }
}

fn range_bound(cs: &ClauseSet, tr: TermRef) -> RangeBound {
    let t = cs.term(tr);
    RangeBound {
        value: term_rhs_literal(cs, tr).map(|l| literal_to_sample(&l)),
        eop: t.e_operator,
        vnull: t.flags & tf::VNULL != 0,
    }
}

/// Having matched `new.n_eq()` leading key fields of the probe index, try
/// to match one more. Each usable term against the next field yields a
/// candidate loop, and equality matches recurse to extend further.
#[allow(clippy::too_many_lines)]
fn add_btree_index(
    cx: &BuildCx<'_, '_>,
    chain: &[ScanLink],
    loops: &mut Vec<WhereLoop>,
    mut or_set: Option<&mut OrSet>,
    fi: &FromItem<'_>,
    probe_pos: usize,
    new: &mut WhereLoop,
    n_in_mul: Cost,
) {
    let probe = IndexProbe::new(fi.table, probe_pos);
    let idx = probe.index;

    let mut op_mask = if new.flags & wf::BTM_LIMIT != 0 {
        wo::LT | wo::LE
    } else if fi.join == JoinKind::Left {
        wo::EQ | wo::IN | wo::GT | wo::GE | wo::LT | wo::LE
    } else {
        wo::EQ | wo::IN | wo::ISNULL | wo::GT | wo::GE | wo::LT | wo::LE
    };
    if idx.unordered {
        op_mask &= !(wo::GT | wo::GE | wo::LT | wo::LE);
    }

    let n_eq0 = new.n_eq() as usize;
    let (i_col, n_row_est) = if n_eq0 < idx.columns.len() {
        let c = idx.columns[n_eq0].column;
        let mut est = Cost::of(idx.row_est[n_eq0 + 1]);
        if est == Cost::ZERO && !idx.is_unique() {
            est = Cost(1);
        }
        (c, est)
    } else if idx.kind != IndexKind::PrimaryKey {
        match probe.column_number(n_eq0) {
            Some(c) => (c, Cost::ZERO),
            None => return,
        }
    } else {
        return;
    };

    let saved_prereq = new.prereq;
    let saved_n_term = new.terms.len();
    let saved_n_eq = new.n_eq();
    let saved_flags = new.flags;
    let saved_n_out = new.n_out;
    new.r_setup = Cost::ZERO;
    let r_log_size = Cost::of(idx.row_est[0]).est_log();

    let found: Vec<TermRef> = TermScan::new(
        cx.cs,
        cx.from,
        chain,
        fi.cursor,
        i_col,
        op_mask,
        Some(&probe),
    )
    .collect();

    for tr in found {
        let term = cx.cs.term(tr);
        if term.prereq_right.overlaps(new.mask_self) {
            continue;
        }
        // A manufactured x>NULL range on a NOT NULL column adds nothing.
        if term.flags & tf::VNULL != 0 && fi.table.column_not_null(i_col) {
            continue;
        }
        new.flags = saved_flags;
        new.set_n_eq(saved_n_eq);
        new.terms.truncate(saved_n_term);
        new.terms.push(Some(tr));
        new.prereq = (saved_prereq | term.prereq_right).minus(new.mask_self);
        new.n_out = saved_n_out;
        // Baseline cost is one binary search of the index.
        new.r_run = r_log_size;
        let mut n_in = Cost::ZERO;
        let mut btm = None;
        let mut top = None;

        if term.e_operator & wo::IN != 0 {
            new.flags |= wf::COLUMN_IN;
            n_in = match peel(&term.expr) {
                Expr::In {
                    set: InSet::Subquery(_),
                    ..
                } => Cost(46), // a subquery on the IN RHS returns ~25 rows
                Expr::In {
                    set: InSet::List(items),
                    ..
                } => Cost::of(items.len() as u64),
                _ => Cost::ZERO,
            };
            new.r_run += n_in;
            new.set_n_eq(saved_n_eq + 1);
            new.n_out = n_row_est + n_in_mul + n_in;
        } else if term.e_operator & wo::EQ != 0 {
            new.flags |= wf::COLUMN_EQ;
            if i_col < 0
                || (idx.is_unique()
                    && n_in_mul == Cost::ZERO
                    && new.n_eq() as usize == idx.columns.len() - 1)
            {
                new.flags |= wf::ONEROW;
            }
            new.set_n_eq(saved_n_eq + 1);
            new.n_out = n_row_est + n_in_mul;
        } else if term.e_operator & wo::ISNULL != 0 {
            new.flags |= wf::COLUMN_NULL;
            new.set_n_eq(saved_n_eq + 1);
            n_in = Cost(10); // IS NULL selects ~2 rows
            new.n_out = n_row_est + n_in_mul + n_in;
        } else if term.e_operator & (wo::GT | wo::GE) != 0 {
            new.flags |= wf::COLUMN_RANGE | wf::BTM_LIMIT;
            btm = Some(tr);
            top = None;
        } else {
            debug_assert!(term.e_operator & (wo::LT | wo::LE) != 0);
            new.flags |= wf::COLUMN_RANGE | wf::TOP_LIMIT;
            top = Some(tr);
            btm = if new.flags & wf::BTM_LIMIT != 0 {
                new.terms[new.terms.len() - 2]
            } else {
                None
            };
        }

        if new.flags & wf::COLUMN_RANGE != 0 {
            let lo = btm.map(|t| range_bound(cx.cs, t));
            let hi = top.map(|t| range_bound(cx.cs, t));
            let r_div = range_scan_est(cx.opts.stat3, idx, new.n_eq(), lo.as_ref(), hi.as_ref());
            new.n_out = if saved_n_out > r_div + 10 {
                saved_n_out.saturating_sub(r_div)
            } else {
                Cost(10)
            };
        }

        // Histogram refinement for constraints on the left-most field.
        if cx.opts.stat3 && new.n_eq() == 1 && !idx.samples.is_empty() {
            if term.e_operator & (wo::EQ | wo::ISNULL) != 0 {
                if let Some(lit) = term_rhs_literal(cx.cs, tr) {
                    let est = equal_scan_est(idx, &literal_to_sample(&lit));
                    new.n_out = Cost::of(est);
                }
            } else if term.e_operator & wo::IN != 0 {
                if let Expr::In {
                    set: InSet::List(items),
                    ..
                } = peel(&term.expr)
                {
                    let vals: Option<Vec<_>> = items
                        .iter()
                        .map(|e| match e.skip_collate() {
                            Expr::Literal(l, _) => Some(literal_to_sample(l)),
                            _ => None,
                        })
                        .collect();
                    if let Some(vals) = vals {
                        new.n_out = Cost::of(in_scan_est(idx, &vals));
                    }
                }
            }
        }

        if new.flags & (wf::IDX_ONLY | wf::PRIMARY_KEY) == 0 {
            // Each row steps the index, then binary-searches the table.
            let probe_cost = if r_log_size > Cost(27) {
                r_log_size - 17
            } else {
                Cost(10)
            };
            new.r_run = new.r_run.plus(probe_cost);
        }
        new.r_run = new.r_run.plus(new.n_out);

        loop_insert(loops, or_set.as_deref_mut(), new);

        if new.flags & wf::TOP_LIMIT == 0 && (new.n_eq() as usize) < idx.columns.len() + 1 {
            add_btree_index(
                cx,
                chain,
                loops,
                or_set.as_deref_mut(),
                fi,
                probe_pos,
                new,
                n_in_mul + n_in,
            );
        }
    }

    new.prereq = saved_prereq;
    new.terms.truncate(saved_n_term);
    new.set_n_eq(saved_n_eq);
    new.flags = saved_flags;
    new.n_out = saved_n_out;
}

/// Add every candidate loop for a b-tree table: automatic indexes, the
/// full scan, and each index with its constraint extensions.
pub(crate) fn add_btree_loops(
    cx: &BuildCx<'_, '_>,
    chain: &[ScanLink],
    loops: &mut Vec<WhereLoop>,
    mut or_set: Option<&mut OrSet>,
    tab_pos: usize,
    m_extra: Bitmask,
) -> Result<()> {
    let fi = &cx.from[tab_pos];
    let table = fi.table;
    let mask_self = cx.masks.mask_of(fi.cursor);
    let mut new = WhereLoop::template(tab_pos, mask_self);

    let pk = table.primary_key();
    // An INDEXED BY clause restricts the candidate set to one index; a
    // NOT INDEXED clause to the primary key. Name resolution happened
    // before loop building, so the unwrap-by-lookup cannot fail here.
    let probes: Vec<usize> = if let Some(name) = &fi.indexed_by {
        table.index_position(name).into_iter().collect()
    } else if fi.not_indexed {
        pk.into_iter().collect()
    } else {
        (0..table.indexes.len()).collect()
    };

    let r_size = Cost::of(table.row_est);
    let r_log_size = r_size.est_log();

    // Automatic indexes are proposed first, so every later compatible
    // loop sees the SETUP-INVARIANT hold.
    if or_set.is_none()
        && cx.opts.auto_index
        && fi.indexed_by.is_none()
        && !fi.not_indexed
        && !fi.correlated
    {
        for tr in link_terms(cx.cs, chain[0]) {
            let term = cx.cs.term(tr);
            if term.prereq_right.overlaps(mask_self) {
                continue;
            }
            if term_can_drive_index(cx, tr, fi, Bitmask::EMPTY) {
                new.payload = LoopPayload::BTree {
                    n_eq: 1,
                    index: Some(LoopIndex::Auto),
                };
                new.terms.clear();
                new.terms.push(Some(tr));
                new.sort_idx = 0;
                // One-time cost to build the transient index, then one
                // index lookup per scan yielding ~20 rows.
                new.r_setup = r_log_size.plus(r_size) + Cost::of(7);
                new.n_out = Cost::of(20);
                new.r_run = r_log_size.plus(new.n_out);
                new.flags = wf::AUTO_INDEX;
                new.prereq = m_extra | cx.cs.term(tr).prereq_right;
                loop_insert(loops, or_set.as_deref_mut(), &new);
            }
        }
    }

    // A table with no primary key at all (a materialized view or an
    // ephemeral table) still gets its full scan.
    if pk.is_none() {
        new.payload = LoopPayload::BTree {
            n_eq: 0,
            index: None,
        };
        new.terms.clear();
        new.sort_idx = 0;
        new.r_setup = Cost::ZERO;
        new.prereq = m_extra;
        new.n_out = r_size;
        new.flags = 0;
        new.r_run = r_size.plus(r_log_size) + 16;
        loop_insert(loops, or_set.as_deref_mut(), &new);
    }

    for (i_sort, &probe_pos) in probes.iter().enumerate() {
        let probe = IndexProbe::new(table, probe_pos);
        let is_pk = probe.index.kind == IndexKind::PrimaryKey;
        let covering = !is_pk && fi.columns_used.is_subset_of(probe.columns_covered());

        new.payload = LoopPayload::BTree {
            n_eq: 0,
            index: Some(LoopIndex::Catalog(probe_pos)),
        };
        new.terms.clear();
        new.r_setup = Cost::ZERO;
        new.prereq = m_extra;
        new.n_out = r_size;
        new.flags = wf::INDEXED;
        if covering {
            new.flags |= wf::IDX_ONLY;
        }
        if is_pk {
            new.flags |= wf::PRIMARY_KEY;
        }

        let helps_order = index_might_help_order_by(cx, &probe, fi);
        #[allow(clippy::cast_possible_truncation)]
        {
            new.sort_idx = if helps_order { (i_sort + 1) as u8 } else { 0 };
        }

        if is_pk
            || helps_order
            || (covering && !probe.index.unordered && cx.opts.covering_index_scan)
        {
            if is_pk {
                // Full table scan: 3*(N + log2(N)); the factor biases the
                // search toward indexed lookups.
                new.r_run = r_size.plus(r_log_size) + 16;
            } else if covering {
                // Covering index scan: 2*(N + log2(N)), nudged lower when
                // it can also satisfy the ORDER BY.
                new.r_run = r_size.plus(r_log_size) + 10 - u16::from(helps_order);
            } else {
                // Scanning a non-covering index visits the table per row:
                // N*log2(N).
                new.r_run = r_size + r_log_size;
            }
            loop_insert(loops, or_set.as_deref_mut(), &new);
        }

        add_btree_index(
            cx,
            chain,
            loops,
            or_set.as_deref_mut(),
            fi,
            probe_pos,
            &mut new,
            Cost::ZERO,
        );

        if fi.indexed_by.is_some() || fi.not_indexed {
            break;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// OR loops
// ---------------------------------------------------------------------------

/// Add loops implementing indexable OR terms against this table: each OR
/// operand is costed as a little subquery, and the operands' best costs
/// are combined into a union-of-index-scans loop.
pub(crate) fn add_or_loops(
    cx: &BuildCx<'_, '_>,
    loops: &mut Vec<WhereLoop>,
    tab_pos: usize,
    m_extra: Bitmask,
) -> Result<()> {
    let fi = &cx.from[tab_pos];
    let mask_self = cx.masks.mask_of(fi.cursor);
    let main_terms = link_terms(cx.cs, ScanLink::Clause(cx.main_clause));

    for tr in main_terms {
        let (indexable, or_clause) = {
            let t = cx.cs.term(tr);
            if t.e_operator & wo::OR == 0 {
                continue;
            }
            let Some(info) = &t.or_info else { continue };
            (info.indexable, info.clause)
        };
        if !indexable.overlaps(mask_self) {
            continue;
        }

        let mut sum = OrSet::new();
        let mut cur = OrSet::new();
        let mut once = true;
        let mut viable = true;

        let n_or = cx.cs.clause(or_clause).terms.len();
        for i in 0..n_or {
            let or_tr = TermRef {
                clause: or_clause,
                term: i,
            };
            let or_term = cx.cs.term(or_tr);
            let sub_chain: Vec<ScanLink> = if or_term.e_operator & wo::AND != 0 {
                let Some(ai) = &or_term.and_info else { continue };
                chain_from(cx.cs, ai.clause)
            } else if or_term.left_cursor == Some(fi.cursor) {
                let mut c = vec![ScanLink::Single(or_tr)];
                c.extend(chain_from(cx.cs, cx.main_clause));
                c
            } else {
                continue;
            };

            cur.clear();
            let mut sub_cx = *cx;
            sub_cx.order_by = None;
            if fi.table.is_virtual() {
                add_virtual_loops(&sub_cx, &sub_chain, loops, Some(&mut cur), tab_pos)?;
                // Sub-plans inherit the LEFT/CROSS ordering dependency.
                let extra: Vec<OrCost> = cur
                    .iter()
                    .map(|e| OrCost {
                        prereq: e.prereq | m_extra,
                        r_run: e.r_run,
                        n_out: e.n_out,
                    })
                    .collect();
                cur.clear();
                for e in extra {
                    cur.insert(e.prereq, e.r_run, e.n_out);
                }
            } else {
                add_btree_loops(&sub_cx, &sub_chain, loops, Some(&mut cur), tab_pos, m_extra)?;
            }

            if cur.is_empty() {
                viable = false;
                break;
            } else if once {
                std::mem::swap(&mut sum, &mut cur);
                once = false;
            } else {
                let prev: Vec<OrCost> = sum.iter().copied().collect();
                sum.clear();
                for a in &prev {
                    for b in cur.iter() {
                        sum.insert(
                            a.prereq | b.prereq,
                            a.r_run.plus(b.r_run),
                            a.n_out.plus(b.n_out),
                        );
                    }
                }
            }
        }

        if !viable {
            continue;
        }

        let mut new = WhereLoop::template(tab_pos, mask_self);
        new.terms.push(Some(tr));
        new.flags = wf::MULTI_OR;
        new.r_setup = Cost::ZERO;
        new.sort_idx = 0;
        new.payload = LoopPayload::BTree {
            n_eq: 0,
            index: None,
        };
        let entries: Vec<OrCost> = sum.iter().copied().collect();
        for e in entries {
            // The constant covers the row-set probe that deduplicates
            // candidates across the operand scans.
            new.r_run = e.r_run + 18;
            new.n_out = e.n_out;
            new.prereq = e.prereq;
            loop_insert(loops, None, &new);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// All loops
// ---------------------------------------------------------------------------

/// Enumerate candidate loops for every table of the join, left to right.
pub(crate) fn add_all_loops(cx: &BuildCx<'_, '_>, loops: &mut Vec<WhereLoop>) -> Result<()> {
    let chain = chain_from(cx.cs, cx.main_clause);
    let mut m_extra = Bitmask::EMPTY;
    let mut m_prior = Bitmask::EMPTY;
    let mut prior_join = JoinKind::Inner;

    for tab_pos in 0..cx.from.len() {
        let fi = &cx.from[tab_pos];
        // LEFT and CROSS joins may not be reordered across the join
        // boundary: everything to the left becomes a prerequisite.
        if matches!(fi.join, JoinKind::Left | JoinKind::Cross)
            || matches!(prior_join, JoinKind::Left | JoinKind::Cross)
        {
            m_extra = m_prior;
        }
        prior_join = fi.join;

        if fi.table.is_virtual() {
            add_virtual_loops(cx, &chain, loops, None, tab_pos)?;
        } else {
            add_btree_loops(cx, &chain, loops, None, tab_pos, m_extra)?;
        }
        add_or_loops(cx, loops, tab_pos, m_extra)?;

        m_prior |= cx.masks.mask_of(fi.cursor);
    }
    Ok(())
}
