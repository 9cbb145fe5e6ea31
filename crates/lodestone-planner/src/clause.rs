//! WHERE-clause decomposition and term analysis.
//!
//! The WHERE expression is split on AND into an array of terms, each term
//! classified into the canonical `column <op> expr` form where possible,
//! and a family of *virtual* terms is synthesized: commuted copies of
//! column=column comparisons, the two inequalities implied by BETWEEN,
//! range bounds for LIKE prefixes, `col > NULL` stand-ins for IS NOT NULL,
//! and IN or indexable-OR rewrites of OR terms.
//!
//! All clause storage lives in a [`ClauseSet`] arena and every
//! cross-reference is an index ([`TermRef`]), never a pointer: term arrays
//! grow while analysis runs, so anything held across an insertion must be
//! re-resolved through the arena.

use lodestone_ast::{CompareOp, Expr, Span};
use lodestone_types::{Bitmask, CursorId};
use tracing::trace;

use crate::catalog::FromItem;
use crate::expr::{
    commute_comparison, expr_usage, in_set_usage, like_probe, match_of_column, operator_mask,
};
use crate::masks::MaskSet;
use crate::PlannerOptions;

// ---------------------------------------------------------------------------
// Operator bits
// ---------------------------------------------------------------------------

/// One-hot operator codes for [`WhereTerm::e_operator`]. A mask of several
/// codes selects terms matching any of them in one comparison.
pub mod wo {
    pub const IN: u16 = 0x001;
    pub const EQ: u16 = 0x002;
    pub const LT: u16 = 0x004;
    pub const LE: u16 = 0x008;
    pub const GT: u16 = 0x010;
    pub const GE: u16 = 0x020;
    pub const MATCH: u16 = 0x040;
    pub const ISNULL: u16 = 0x080;
    /// Two or more subterms connected by OR.
    pub const OR: u16 = 0x100;
    /// Two or more subterms connected by AND, inside an OR clause.
    pub const AND: u16 = 0x200;
    /// Of the form A==B where both A and B are columns.
    pub const EQUIV: u16 = 0x400;
    /// The term no longer restricts the search space.
    pub const NOOP: u16 = 0x800;

    pub const ALL: u16 = 0xfff;
    /// Mask of all non-compound codes.
    pub const SINGLE: u16 = 0x0ff;
}

/// Term state bits for [`WhereTerm::flags`].
pub mod tf {
    /// The expression was synthesized by the planner (it owns the tree).
    pub const DYNAMIC: u8 = 0x01;
    /// Added by the analyzer; the emitter must not evaluate it directly.
    pub const VIRTUAL: u8 = 0x02;
    /// Already tested by emitted code; skip as residue.
    pub const CODED: u8 = 0x04;
    /// Has a virtual child term.
    pub const COPIED: u8 = 0x08;
    /// Scratch bit for OR-to-IN conversion.
    pub const OR_OK: u8 = 0x40;
    /// Manufactured `x > NULL` standing in for `x IS NOT NULL`; suppresses
    /// the implicit null filter at the start of the scan.
    pub const VNULL: u8 = 0x80;
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Index of a clause within a [`ClauseSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClauseId(pub usize);

/// Stable reference to one term: clause index plus term index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermRef {
    pub clause: ClauseId,
    pub term: usize,
}

/// The operator a clause was split on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitOp {
    And,
    Or,
}

// ---------------------------------------------------------------------------
// Terms and clauses
// ---------------------------------------------------------------------------

/// Auxiliary data for a term whose subterms are connected by OR.
#[derive(Debug, Clone)]
pub struct OrInfo {
    /// The sub-clause holding the OR operands.
    pub clause: ClauseId,
    /// Tables on which every OR operand could be driven by some index.
    pub indexable: Bitmask,
}

/// Auxiliary data for an AND compound inside an OR clause.
#[derive(Debug, Clone)]
pub struct AndInfo {
    pub clause: ClauseId,
}

/// One AND-factor (or OR-operand) of the WHERE clause.
#[derive(Debug)]
pub struct WhereTerm {
    /// The subexpression this term stands for. Owned: input subtrees are
    /// deep-cloned in, synthesized trees are built here.
    pub expr: Expr,
    /// When set, disabling the parent term cascades from this one.
    pub parent: Option<TermRef>,
    /// Cursor of X when the term has the shape `X <op> expr`.
    pub left_cursor: Option<CursorId>,
    /// Column of X; meaningful only when `left_cursor` is set.
    pub left_column: i32,
    /// One-hot `wo::*` operator code, or 0 for residue terms.
    pub e_operator: u16,
    /// `tf::*` state bits.
    pub flags: u8,
    /// Number of child terms that must be disabled before this one is.
    pub n_child: u8,
    /// Tables referenced by the right-hand side.
    pub prereq_right: Bitmask,
    /// Tables referenced anywhere in the term.
    pub prereq_all: Bitmask,
    pub or_info: Option<OrInfo>,
    pub and_info: Option<AndInfo>,
}

impl WhereTerm {
    fn new(expr: Expr, flags: u8) -> Self {
        Self {
            expr,
            parent: None,
            left_cursor: None,
            left_column: -1,
            e_operator: 0,
            flags,
            n_child: 0,
            prereq_right: Bitmask::EMPTY,
            prereq_all: Bitmask::EMPTY,
            or_info: None,
            and_info: None,
        }
    }

    /// Whether the term still has a usable left column.
    #[must_use]
    pub fn has_left(&self) -> bool {
        self.left_cursor.is_some()
    }
}

/// An ordered sequence of terms produced by splitting one expression.
#[derive(Debug)]
pub struct WhereClause {
    pub op: SplitOp,
    /// Enclosing conjunction, for scans that widen out of an OR operand.
    pub outer: Option<ClauseId>,
    pub terms: Vec<WhereTerm>,
}

/// Arena owning every clause of one planning call: the main conjunction
/// plus any OR/AND sub-clauses discovered during analysis.
#[derive(Debug, Default)]
pub struct ClauseSet {
    clauses: Vec<WhereClause>,
}

impl ClauseSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an empty clause and return its id.
    pub fn add_clause(&mut self, op: SplitOp, outer: Option<ClauseId>) -> ClauseId {
        self.clauses.push(WhereClause {
            op,
            outer,
            terms: Vec::new(),
        });
        ClauseId(self.clauses.len() - 1)
    }

    #[must_use]
    pub fn clause(&self, id: ClauseId) -> &WhereClause {
        &self.clauses[id.0]
    }

    pub fn clause_mut(&mut self, id: ClauseId) -> &mut WhereClause {
        &mut self.clauses[id.0]
    }

    #[must_use]
    pub fn term(&self, r: TermRef) -> &WhereTerm {
        &self.clauses[r.clause.0].terms[r.term]
    }

    pub fn term_mut(&mut self, r: TermRef) -> &mut WhereTerm {
        &mut self.clauses[r.clause.0].terms[r.term]
    }

    /// Mark a term as tested by emitted code. When every child of a parent
    /// term is coded the parent is disabled too, so e.g. satisfying both
    /// halves of a BETWEEN by an index retires the original term.
    pub fn mark_coded(&mut self, r: TermRef) {
        let parent = {
            let t = self.term_mut(r);
            if t.flags & tf::CODED != 0 {
                return;
            }
            t.flags |= tf::CODED;
            t.parent
        };
        if let Some(p) = parent {
            let done = {
                let pt = self.term_mut(p);
                pt.n_child = pt.n_child.saturating_sub(1);
                pt.n_child == 0
            };
            if done {
                self.mark_coded(p);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Splitting
// ---------------------------------------------------------------------------

/// Split `expr` on `op` into individual terms of `clause`. Subtrees are
/// cloned into the terms; the input expression is unaltered. A LEFT-JOIN
/// marking around a conjunction distributes over its factors.
pub(crate) fn split(cs: &mut ClauseSet, clause: ClauseId, expr: &Expr, op: SplitOp) {
    cs.clause_mut(clause).op = op;
    split_owned(cs, clause, expr.clone(), op);
}

fn split_owned(cs: &mut ClauseSet, clause: ClauseId, e: Expr, op: SplitOp) {
    match e {
        Expr::And { left, right, .. } if op == SplitOp::And => {
            split_owned(cs, clause, *left, op);
            split_owned(cs, clause, *right, op);
        }
        Expr::Or { left, right, .. } if op == SplitOp::Or => {
            split_owned(cs, clause, *left, op);
            split_owned(cs, clause, *right, op);
        }
        Expr::FromJoin {
            right_table,
            expr,
            span,
        } => match *expr {
            Expr::And { left, right, .. } if op == SplitOp::And => {
                split_owned(cs, clause, left.from_join(right_table), op);
                split_owned(cs, clause, right.from_join(right_table), op);
            }
            Expr::Or { left, right, .. } if op == SplitOp::Or => {
                split_owned(cs, clause, left.from_join(right_table), op);
                split_owned(cs, clause, right.from_join(right_table), op);
            }
            other => {
                insert_term(
                    cs,
                    clause,
                    Expr::FromJoin {
                        right_table,
                        expr: Box::new(other),
                        span,
                    },
                    0,
                );
            }
        },
        other => {
            insert_term(cs, clause, other, 0);
        }
    }
}

/// Append a term to a clause. Any COLLATE wrapper at the expression root
/// is stripped; collations inside comparison operands are kept.
fn insert_term(cs: &mut ClauseSet, clause: ClauseId, expr: Expr, flags: u8) -> TermRef {
    let expr = match expr {
        Expr::Collate { .. } => expr.skip_collate().clone(),
        other => other,
    };
    let terms = &mut cs.clause_mut(clause).terms;
    terms.push(WhereTerm::new(expr, flags));
    TermRef {
        clause,
        term: terms.len() - 1,
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Shared read-only context for term analysis.
pub(crate) struct AnalyzeCx<'a, 'f> {
    pub from: &'a [FromItem<'f>],
    pub masks: &'a MaskSet,
    pub opts: &'a PlannerOptions,
}

/// Unwrap a LEFT-JOIN marking and any root collation, returning the
/// marking (if present) and the operative node.
fn peel(e: &Expr) -> (Option<CursorId>, &Expr) {
    match e.skip_collate() {
        Expr::FromJoin {
            right_table, expr, ..
        } => (Some(*right_table), expr.skip_collate()),
        other => (None, other),
    }
}

fn allowed_root(e: &Expr) -> bool {
    matches!(
        peel(e).1,
        Expr::Compare { .. } | Expr::In { .. } | Expr::IsNull { .. }
    )
}

/// Analyze every term currently in `clause`, back to front, so that
/// virtual terms appended along the way are not re-analyzed here (each is
/// analyzed once at its insertion).
pub(crate) fn analyze_all(cs: &mut ClauseSet, clause: ClauseId, cx: &AnalyzeCx<'_, '_>) {
    for i in (0..cs.clause(clause).terms.len()).rev() {
        analyze_term(cs, cx, TermRef { clause, term: i });
    }
}

/// Classify one term and synthesize its derived virtual terms.
#[allow(clippy::too_many_lines)]
pub(crate) fn analyze_term(cs: &mut ClauseSet, cx: &AnalyzeCx<'_, '_>, tref: TermRef) {
    let ms = cx.masks;
    let expr = cs.term(tref).expr.clone();
    let (from_join, root) = peel(&expr);
    let root = root.clone();

    let prereq_left = match &root {
        Expr::Compare { left, .. } => expr_usage(ms, left),
        Expr::In { lhs, .. } => expr_usage(ms, lhs),
        Expr::IsNull { expr, .. } | Expr::NotNull { expr, .. } => expr_usage(ms, expr),
        Expr::Between { expr, .. } => expr_usage(ms, expr),
        Expr::Like { lhs, .. } => expr_usage(ms, lhs),
        _ => Bitmask::EMPTY,
    };
    let prereq_right = match &root {
        Expr::Compare { right, .. } => expr_usage(ms, right),
        Expr::In { set, .. } => in_set_usage(ms, set),
        Expr::IsNull { .. } => Bitmask::EMPTY,
        _ => Bitmask::EMPTY,
    };
    let mut prereq_all = expr_usage(ms, &expr);

    // An ON-clause term of a LEFT JOIN depends on its right table and may
    // not drive an index on any table to the join's left.
    let mut extra_right = Bitmask::EMPTY;
    if let Some(rt) = from_join {
        let x = ms.mask_of(rt);
        if !x.is_empty() {
            prereq_all |= x;
            extra_right = x.below();
        }
    }

    {
        let t = cs.term_mut(tref);
        t.prereq_right = prereq_right;
        t.prereq_all = prereq_all;
        t.left_cursor = None;
        t.left_column = -1;
        t.e_operator = 0;
        t.parent = None;
    }

    if allowed_root(&expr) {
        let op_mask = if (prereq_right & prereq_left).is_empty() {
            wo::ALL
        } else {
            wo::EQUIV
        };
        let left_operand = match &root {
            Expr::Compare { left, .. } => Some(left.skip_collate()),
            Expr::In { lhs, .. } => Some(lhs.skip_collate()),
            Expr::IsNull { expr, .. } => Some(expr.skip_collate()),
            _ => None,
        };
        if let Some(Expr::Column { cursor, column, .. }) = left_operand {
            let op = operator_mask(&root) & op_mask;
            let t = cs.term_mut(tref);
            t.left_cursor = Some(*cursor);
            t.left_column = *column;
            t.e_operator = op;
        }
        if let Expr::Compare { op, right, .. } = &root {
            if matches!(right.skip_collate(), Expr::Column { .. }) {
                let mut extra_op = 0u16;
                if cs.term(tref).has_left() {
                    // Both sides are columns: keep this term and add a
                    // commuted virtual twin.
                    if *op == CompareOp::Eq && from_join.is_none() && cx.opts.transitive {
                        cs.term_mut(tref).e_operator |= wo::EQUIV;
                        extra_op = wo::EQUIV;
                    }
                    let mut dup = expr.clone();
                    commute_in_place(&mut dup, cx);
                    let fields =
                        commuted_fields(&dup, prereq_left | extra_right, prereq_all, op_mask, extra_op);
                    let new_ref = insert_term(cs, tref.clause, dup, tf::VIRTUAL | tf::DYNAMIC);
                    apply_commuted(cs, new_ref, fields);
                    cs.term_mut(new_ref).parent = Some(tref);
                    let t = cs.term_mut(tref);
                    t.n_child = 1;
                    t.flags |= tf::COPIED;
                } else {
                    // Only the right side is a column: commute in place.
                    let mut dup = expr.clone();
                    commute_in_place(&mut dup, cx);
                    let fields =
                        commuted_fields(&dup, prereq_left | extra_right, prereq_all, op_mask, extra_op);
                    cs.term_mut(tref).expr = dup;
                    apply_commuted(cs, tref, fields);
                }
            }
        }
    } else if let Expr::Between {
        expr: x, low, high, ..
    } = &root
    {
        // `a BETWEEN b AND c` implies `a>=b` and `a<=c`. The children are
        // coded in place of the original whenever an index absorbs them.
        if cs.clause(tref.clause).op == SplitOp::And {
            let bounds = [(CompareOp::Ge, low), (CompareOp::Le, high)];
            for (op, bound) in bounds {
                let mut child = Expr::compare(op, (**x).clone(), (**bound).clone());
                if let Some(rt) = from_join {
                    child = child.from_join(rt);
                }
                let new_ref = insert_term(cs, tref.clause, child, tf::VIRTUAL | tf::DYNAMIC);
                analyze_term(cs, cx, new_ref);
                cs.term_mut(new_ref).parent = Some(tref);
            }
            cs.term_mut(tref).n_child = 2;
        }
    } else if matches!(root, Expr::Or { .. }) {
        if cs.clause(tref.clause).op == SplitOp::And {
            analyze_or_term(cs, cx, tref);
        }
    }

    // LIKE prefix: `x LIKE 'abc%'` implies `x>='abc' AND x<'abd'`.
    if cs.clause(tref.clause).op == SplitOp::And {
        if let Some(p) = like_probe(&root, cx.from, cx.opts.like_nocase) {
            let coll = if p.no_case { "NOCASE" } else { "BINARY" };
            let mk = |op: CompareOp, bound: String| {
                Expr::compare(
                    op,
                    Expr::column(p.cursor, p.column).collate(coll),
                    Expr::string(bound),
                )
            };
            let lo = mk(CompareOp::Ge, p.lo);
            let hi = mk(CompareOp::Lt, p.hi);
            let r1 = insert_term(cs, tref.clause, lo, tf::VIRTUAL | tf::DYNAMIC);
            analyze_term(cs, cx, r1);
            let r2 = insert_term(cs, tref.clause, hi, tf::VIRTUAL | tf::DYNAMIC);
            analyze_term(cs, cx, r2);
            if p.is_complete {
                cs.term_mut(r1).parent = Some(tref);
                cs.term_mut(r2).parent = Some(tref);
                cs.term_mut(tref).n_child = 2;
            }
            trace!(
                target: "lodestone.planner",
                complete = p.is_complete,
                "LIKE prefix expanded to range"
            );
        }
    }

    // `column MATCH expr` becomes an auxiliary term surfaced to the
    // virtual-table planning method; the native planner ignores it.
    if let Some((pattern, m_cursor, m_column)) = match_of_column(&root) {
        let prereq_expr = expr_usage(ms, pattern);
        let prereq_col = ms.mask_of(m_cursor);
        if !prereq_expr.overlaps(prereq_col) {
            let new_expr = Expr::Function {
                name: "match".to_owned(),
                args: vec![pattern.clone()],
                span: Span::ZERO,
            };
            let new_ref = insert_term(cs, tref.clause, new_expr, tf::VIRTUAL | tf::DYNAMIC);
            {
                let t = cs.term_mut(new_ref);
                t.prereq_right = prereq_expr;
                t.prereq_all = prereq_all;
                t.left_cursor = Some(m_cursor);
                t.left_column = m_column;
                t.e_operator = wo::MATCH;
                t.parent = Some(tref);
            }
            let t = cs.term_mut(tref);
            t.n_child = 1;
            t.flags |= tf::COPIED;
        }
    }

    // With histogram samples available, `x IS NOT NULL` can be evaluated
    // as the range `x > NULL`.
    if let Expr::NotNull { expr: inner, .. } = &root {
        if let Expr::Column { cursor, column, .. } = inner.skip_collate() {
            if *column >= 0 && cx.opts.stat3 && table_has_samples(cx, *cursor) {
                let new_expr = Expr::compare(
                    CompareOp::Gt,
                    Expr::column(*cursor, *column),
                    Expr::null(),
                );
                let new_ref = insert_term(
                    cs,
                    tref.clause,
                    new_expr,
                    tf::VIRTUAL | tf::DYNAMIC | tf::VNULL,
                );
                {
                    let t = cs.term_mut(new_ref);
                    t.prereq_right = Bitmask::EMPTY;
                    t.prereq_all = prereq_all;
                    t.left_cursor = Some(*cursor);
                    t.left_column = *column;
                    t.e_operator = wo::GT;
                    t.parent = Some(tref);
                }
                let t = cs.term_mut(tref);
                t.n_child = 1;
                t.flags |= tf::COPIED;
            }
        }
    }

    cs.term_mut(tref).prereq_right |= extra_right;
}

fn table_has_samples(cx: &AnalyzeCx<'_, '_>, cursor: CursorId) -> bool {
    crate::expr::find_from(cx.from, cursor)
        .is_some_and(|fi| fi.table.indexes.iter().any(|i| !i.samples.is_empty()))
}

fn commute_in_place(e: &mut Expr, cx: &AnalyzeCx<'_, '_>) {
    match e {
        Expr::FromJoin { expr, .. } => commute_comparison(expr, cx.from),
        other => commute_comparison(other, cx.from),
    }
}

struct CommutedFields {
    left_cursor: CursorId,
    left_column: i32,
    e_operator: u16,
    prereq_right: Bitmask,
    prereq_all: Bitmask,
}

fn commuted_fields(
    dup: &Expr,
    prereq_right: Bitmask,
    prereq_all: Bitmask,
    op_mask: u16,
    extra_op: u16,
) -> CommutedFields {
    let (_, root) = peel(dup);
    let (left_cursor, left_column, base_op) = match root {
        Expr::Compare { left, .. } => match left.skip_collate() {
            Expr::Column { cursor, column, .. } => (*cursor, *column, operator_mask(root)),
            _ => (CursorId(-1), -1, 0),
        },
        _ => (CursorId(-1), -1, 0),
    };
    CommutedFields {
        left_cursor,
        left_column,
        e_operator: (base_op + extra_op) & op_mask,
        prereq_right,
        prereq_all,
    }
}

fn apply_commuted(cs: &mut ClauseSet, r: TermRef, f: CommutedFields) {
    let t = cs.term_mut(r);
    t.left_cursor = Some(f.left_cursor);
    t.left_column = f.left_column;
    t.e_operator = f.e_operator;
    t.prereq_right = f.prereq_right;
    t.prereq_all = f.prereq_all;
}

// ---------------------------------------------------------------------------
// OR-term analysis
// ---------------------------------------------------------------------------

/// Analyze a term of two or more OR-connected subterms. Two rewrites are
/// attempted:
///
/// Case 1: if every subterm is `T.C = expr` for one table and column,
/// append a virtual `T.C IN (...)` term and retire this one to `NOOP`.
///
/// Case 2: otherwise intersect, over the subterms, the sets of tables
/// each could constrain through *some* index; a non-empty result marks the
/// term `WO_OR` with that indexable set, enabling the union-of-index-scans
/// strategy. Case 1 wins when both apply.
#[allow(clippy::too_many_lines)]
fn analyze_or_term(cs: &mut ClauseSet, cx: &AnalyzeCx<'_, '_>, tref: TermRef) {
    let ms = cx.masks;
    let parent_clause = tref.clause;
    let or_clause = cs.add_clause(SplitOp::Or, Some(parent_clause));
    let expr = cs.term(tref).expr.clone();
    split(cs, or_clause, &expr, SplitOp::Or);
    cs.term_mut(tref).or_info = Some(OrInfo {
        clause: or_clause,
        indexable: Bitmask::EMPTY,
    });
    analyze_all(cs, or_clause, cx);

    let mut indexable = Bitmask::ALL;
    let mut chng_to_in = Bitmask::ALL;
    let mut i = 0;
    while i < cs.clause(or_clause).terms.len() && !indexable.is_empty() {
        let (e_op, flags) = {
            let t = &cs.clause(or_clause).terms[i];
            (t.e_operator, t.flags)
        };
        if e_op & wo::SINGLE == 0 {
            // A compound operand (usually an AND). Break it out into its
            // own clause; it is indexable on the tables constrained by any
            // of its factors.
            chng_to_in = Bitmask::EMPTY;
            let and_clause = cs.add_clause(SplitOp::And, Some(parent_clause));
            let sub = cs.clause(or_clause).terms[i].expr.clone();
            split(cs, and_clause, &sub, SplitOp::And);
            analyze_all(cs, and_clause, cx);
            let mut b = Bitmask::EMPTY;
            for at in &cs.clause(and_clause).terms {
                if allowed_root(&at.expr) {
                    if let Some(c) = at.left_cursor {
                        b |= ms.mask_of(c);
                    }
                }
            }
            {
                let t = &mut cs.clause_mut(or_clause).terms[i];
                t.and_info = Some(AndInfo { clause: and_clause });
                t.e_operator = wo::AND;
            }
            indexable &= b;
        } else if flags & tf::COPIED != 0 {
            // Revisited through its commuted virtual twin.
        } else {
            let t = &cs.clause(or_clause).terms[i];
            let mut b = t.left_cursor.map_or(Bitmask::EMPTY, |c| ms.mask_of(c));
            if t.flags & tf::VIRTUAL != 0 {
                if let Some(p) = t.parent {
                    if let Some(c) = cs.term(p).left_cursor {
                        b |= ms.mask_of(c);
                    }
                }
            }
            indexable &= b;
            if e_op & wo::EQ == 0 {
                chng_to_in = Bitmask::EMPTY;
            } else {
                chng_to_in &= b;
            }
        }
        i += 1;
    }

    if let Some(info) = cs.term_mut(tref).or_info.as_mut() {
        info.indexable = indexable;
    }
    cs.term_mut(tref).e_operator = if indexable.is_empty() { 0 } else { wo::OR };
    trace!(
        target: "lodestone.planner",
        indexable = ?indexable,
        in_candidate = !chng_to_in.is_empty(),
        "OR term analyzed"
    );

    // Case 1: try to convert to IN. chng_to_in holds the tables that might
    // qualify: every operand must be an equality on one common column.
    if chng_to_in.is_empty() {
        return;
    }
    let n_term = cs.clause(or_clause).terms.len();
    let mut ok = false;
    let mut i_cursor: Option<CursorId> = None;
    let mut i_column = -1i32;
    for pass in 0..2 {
        if ok {
            break;
        }
        // Find a candidate table+column appearing on the left of an `=`
        // in some operand (skipping, on the second pass, the table tried
        // on the first).
        let mut start = None;
        for i in 0..n_term {
            let (lc, lcol) = {
                let t = &mut cs.clause_mut(or_clause).terms[i];
                t.flags &= !tf::OR_OK;
                (t.left_cursor, t.left_column)
            };
            if lc == i_cursor && pass == 1 {
                continue;
            }
            let mask = lc.map_or(Bitmask::EMPTY, |c| ms.mask_of(c));
            if !chng_to_in.overlaps(mask) {
                // An operand of the form t1.a==t2.b where only t2 remains
                // eligible; its inverted copy is visited instead.
                continue;
            }
            i_cursor = lc;
            i_column = lcol;
            start = Some(i);
            break;
        }
        let Some(start) = start else {
            break;
        };

        // Candidate found: it must be common to every operand.
        ok = true;
        for i in start..n_term {
            if !ok {
                break;
            }
            let (lc, lcol, aff_ok) = {
                let t = &cs.clause(or_clause).terms[i];
                let (_, root) = peel(&t.expr);
                let aff_ok = if let Expr::Compare { left, right, .. } = root {
                    // A column RHS must need no affinity change.
                    let ar = crate::expr::expr_affinity(right, cx.from);
                    let al = crate::expr::expr_affinity(left, cx.from);
                    ar == crate::catalog::Affinity::None || ar == al
                } else {
                    true
                };
                (t.left_cursor, t.left_column, aff_ok)
            };
            let t = &mut cs.clause_mut(or_clause).terms[i];
            if lc != i_cursor {
                t.flags &= !tf::OR_OK;
            } else if lcol != i_column {
                ok = false;
            } else if !aff_ok {
                ok = false;
            } else {
                t.flags |= tf::OR_OK;
            }
        }
    }

    if ok {
        // Build `x IN (e1, e2, ...)` from the approved operands.
        let mut list = Vec::new();
        let mut lhs = None;
        for t in &cs.clause(or_clause).terms {
            if t.flags & tf::OR_OK == 0 {
                continue;
            }
            let (_, root) = peel(&t.expr);
            if let Expr::Compare { left, right, .. } = root {
                list.push((**right).clone());
                lhs = Some((**left).clone());
            }
        }
        let Some(lhs) = lhs else { return };
        let mut new_expr = Expr::In {
            lhs: Box::new(lhs),
            set: lodestone_ast::InSet::List(list),
            span: Span::ZERO,
        };
        if let (Some(rt), _) = peel_marking(&expr) {
            new_expr = new_expr.from_join(rt);
        }
        let new_ref = insert_term(cs, parent_clause, new_expr, tf::VIRTUAL | tf::DYNAMIC);
        analyze_term(cs, cx, new_ref);
        cs.term_mut(new_ref).parent = Some(tref);
        cs.term_mut(tref).n_child = 1;
        cs.term_mut(tref).e_operator = wo::NOOP;
    }
}

/// Like [`peel`] but only reports the LEFT-JOIN marking.
fn peel_marking(e: &Expr) -> (Option<CursorId>, &Expr) {
    match e {
        Expr::FromJoin {
            right_table, expr, ..
        } => (Some(*right_table), expr),
        other => (None, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, FromItem, Table};
    use lodestone_ast::CompareOp;

    fn fixture() -> (Table, Table) {
        let t1 = Table::btree(
            "t1",
            vec![Column::numeric("a"), Column::numeric("b"), Column::text("c")],
            1000,
        );
        let t2 = Table::btree("t2", vec![Column::numeric("p"), Column::numeric("q")], 1000);
        (t1, t2)
    }

    struct Env<'a> {
        from: Vec<FromItem<'a>>,
        masks: MaskSet,
        opts: PlannerOptions,
    }

    impl<'a> Env<'a> {
        fn new(t1: &'a Table, t2: &'a Table) -> Self {
            let from = vec![
                FromItem::new(t1, CursorId(0)),
                FromItem::new(t2, CursorId(1)),
            ];
            let mut masks = MaskSet::new();
            for fi in &from {
                masks.assign(fi.cursor);
            }
            Self {
                from,
                masks,
                opts: PlannerOptions::default(),
            }
        }

        fn analyze(&self, e: &Expr) -> ClauseSet {
            let mut cs = ClauseSet::new();
            let main = cs.add_clause(SplitOp::And, None);
            split(&mut cs, main, e, SplitOp::And);
            let cx = AnalyzeCx {
                from: &self.from,
                masks: &self.masks,
                opts: &self.opts,
            };
            analyze_all(&mut cs, main, &cx);
            cs
        }
    }

    #[test]
    fn splits_on_and() {
        let (t1, t2) = fixture();
        let env = Env::new(&t1, &t2);
        let e = Expr::and(
            Expr::compare(CompareOp::Eq, Expr::column(CursorId(0), 0), Expr::integer(5)),
            Expr::and(
                Expr::compare(CompareOp::Gt, Expr::column(CursorId(0), 1), Expr::integer(2)),
                Expr::compare(CompareOp::Lt, Expr::column(CursorId(0), 1), Expr::integer(9)),
            ),
        );
        let cs = env.analyze(&e);
        assert_eq!(cs.clause(ClauseId(0)).terms.len(), 3);
        let t0 = &cs.clause(ClauseId(0)).terms[0];
        assert_eq!(t0.e_operator, wo::EQ);
        assert_eq!(t0.left_column, 0);
    }

    #[test]
    fn commutes_reversed_comparison() {
        let (t1, t2) = fixture();
        let env = Env::new(&t1, &t2);
        // 5 < a  becomes  a > 5
        let e = Expr::compare(CompareOp::Lt, Expr::integer(5), Expr::column(CursorId(0), 0));
        let cs = env.analyze(&e);
        let t = &cs.clause(ClauseId(0)).terms[0];
        assert_eq!(t.e_operator, wo::GT);
        assert_eq!(t.left_column, 0);
    }

    #[test]
    fn column_equality_gets_equiv_twin() {
        let (t1, t2) = fixture();
        let env = Env::new(&t1, &t2);
        let e = Expr::compare(
            CompareOp::Eq,
            Expr::column(CursorId(0), 0),
            Expr::column(CursorId(1), 0),
        );
        let cs = env.analyze(&e);
        let terms = &cs.clause(ClauseId(0)).terms;
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].e_operator, wo::EQ | wo::EQUIV);
        assert!(terms[0].flags & tf::COPIED != 0);
        assert_eq!(terms[0].n_child, 1);
        assert_eq!(terms[1].e_operator, wo::EQ | wo::EQUIV);
        assert!(terms[1].flags & tf::VIRTUAL != 0);
        assert_eq!(terms[1].left_cursor, Some(CursorId(1)));
        assert_eq!(terms[1].parent, Some(TermRef { clause: ClauseId(0), term: 0 }));
    }

    #[test]
    fn left_join_on_term_is_not_equiv_and_carries_extra_right() {
        let (t1, t2) = fixture();
        let mut env = Env::new(&t1, &t2);
        env.from[1].join = crate::catalog::JoinKind::Left;
        let e = Expr::compare(
            CompareOp::Eq,
            Expr::column(CursorId(0), 0),
            Expr::column(CursorId(1), 0),
        )
        .from_join(CursorId(1));
        let cs = env.analyze(&e);
        let terms = &cs.clause(ClauseId(0)).terms;
        assert_eq!(terms[0].e_operator, wo::EQ);
        // prereq_right picked up every table left of t2.
        assert!(Bitmask::bit(0).is_subset_of(terms[0].prereq_right) || terms.len() > 1);
        // The commuted twin also may not be used against the left table.
        let twin = &terms[1];
        assert!(Bitmask::bit(0).is_subset_of(twin.prereq_right));
        assert!(Bitmask::bit(1).is_subset_of(terms[0].prereq_all));
    }

    #[test]
    fn between_synthesizes_two_children() {
        let (t1, t2) = fixture();
        let env = Env::new(&t1, &t2);
        let e = Expr::Between {
            expr: Box::new(Expr::column(CursorId(0), 1)),
            low: Box::new(Expr::integer(2)),
            high: Box::new(Expr::integer(9)),
            span: Span::ZERO,
        };
        let cs = env.analyze(&e);
        let terms = &cs.clause(ClauseId(0)).terms;
        assert_eq!(terms.len(), 3);
        assert_eq!(terms[0].n_child, 2);
        assert_eq!(terms[1].e_operator, wo::GE);
        assert_eq!(terms[2].e_operator, wo::LE);
        assert_eq!(terms[1].parent, Some(TermRef { clause: ClauseId(0), term: 0 }));
    }

    #[test]
    fn or_of_equalities_becomes_in() {
        let (t1, t2) = fixture();
        let env = Env::new(&t1, &t2);
        let x = || Expr::column(CursorId(0), 0);
        let e = Expr::or(
            Expr::or(
                Expr::compare(CompareOp::Eq, x(), Expr::integer(1)),
                Expr::compare(CompareOp::Eq, x(), Expr::integer(2)),
            ),
            Expr::compare(CompareOp::Eq, x(), Expr::integer(7)),
        );
        let cs = env.analyze(&e);
        let terms = &cs.clause(ClauseId(0)).terms;
        // Original OR term retired to NOOP, virtual IN appended.
        assert_eq!(terms[0].e_operator, wo::NOOP);
        let in_term = terms.iter().find(|t| t.e_operator & wo::IN != 0).unwrap();
        assert_eq!(in_term.left_column, 0);
        let Expr::In { set, .. } = &in_term.expr else {
            panic!("expected IN")
        };
        let lodestone_ast::InSet::List(items) = set else {
            panic!("expected list")
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn mixed_or_is_indexable_but_not_in() {
        let (t1, t2) = fixture();
        let env = Env::new(&t1, &t2);
        let e = Expr::or(
            Expr::compare(CompareOp::Eq, Expr::column(CursorId(0), 0), Expr::integer(1)),
            Expr::compare(CompareOp::Gt, Expr::column(CursorId(0), 1), Expr::integer(5)),
        );
        let cs = env.analyze(&e);
        let t = &cs.clause(ClauseId(0)).terms[0];
        assert_eq!(t.e_operator, wo::OR);
        let info = t.or_info.as_ref().unwrap();
        assert_eq!(info.indexable, Bitmask::bit(0));
    }

    #[test]
    fn or_across_tables_is_not_indexable() {
        let (t1, t2) = fixture();
        let env = Env::new(&t1, &t2);
        let e = Expr::or(
            Expr::compare(CompareOp::Eq, Expr::column(CursorId(0), 0), Expr::integer(1)),
            Expr::compare(CompareOp::Eq, Expr::column(CursorId(1), 0), Expr::integer(2)),
        );
        let cs = env.analyze(&e);
        let t = &cs.clause(ClauseId(0)).terms[0];
        assert_eq!(t.e_operator, 0);
        assert!(t.or_info.as_ref().unwrap().indexable.is_empty());
    }

    #[test]
    fn residue_term_keeps_zero_operator() {
        let (t1, t2) = fixture();
        let env = Env::new(&t1, &t2);
        let e = Expr::Function {
            name: "coalesce".to_owned(),
            args: vec![Expr::column(CursorId(0), 1), Expr::integer(11)],
            span: Span::ZERO,
        };
        let cs = env.analyze(&e);
        let t = &cs.clause(ClauseId(0)).terms[0];
        assert_eq!(t.e_operator, 0);
        assert_eq!(t.prereq_all, Bitmask::bit(0));
    }

    #[test]
    fn mark_coded_cascades_to_parent() {
        let (t1, t2) = fixture();
        let env = Env::new(&t1, &t2);
        let e = Expr::Between {
            expr: Box::new(Expr::column(CursorId(0), 1)),
            low: Box::new(Expr::integer(2)),
            high: Box::new(Expr::integer(9)),
            span: Span::ZERO,
        };
        let mut cs = env.analyze(&e);
        let c = ClauseId(0);
        cs.mark_coded(TermRef { clause: c, term: 1 });
        assert!(cs.term(TermRef { clause: c, term: 0 }).flags & tf::CODED == 0);
        cs.mark_coded(TermRef { clause: c, term: 2 });
        assert!(cs.term(TermRef { clause: c, term: 0 }).flags & tf::CODED != 0);
    }
}
