//! Iterator over WHERE terms usable for index-driven access.
//!
//! Given a target `(cursor, column, operator-mask)` and optionally an
//! index the term must be compatible with, the scanner yields every
//! matching term, widening out through outer clauses and through
//! equivalence classes: if the clause contains `X=Y` then a search for
//! constraints on X also finds constraints on Y. Transitivity is capped so
//! a search follows at most ten equivalence hops.

use lodestone_ast::Expr;
use lodestone_types::{Bitmask, CursorId};

use crate::catalog::{Affinity, FromItem, IndexProbe};
use crate::clause::{wo, ClauseId, ClauseSet, TermRef};
use crate::expr::{binary_compare_collation, index_affinity_ok};

/// Capacity of the equivalence set: the seed plus up to ten equivalents.
const MAX_EQUIV: usize = 11;

/// Strip a LEFT-JOIN marking and collation wrappers from a term root.
fn peel_expr(e: &Expr) -> &Expr {
    match e.skip_collate() {
        Expr::FromJoin { expr, .. } => expr.skip_collate(),
        other => other,
    }
}

/// One step of the clause chain a scan walks: a whole clause, or a single
/// term standing in for one (used when costing one OR operand).
#[derive(Debug, Clone, Copy)]
pub(crate) enum ScanLink {
    Clause(ClauseId),
    Single(TermRef),
}

/// The chain for a scan rooted at `start`: the clause itself, then its
/// enclosing conjunctions outward.
pub(crate) fn chain_from(cs: &ClauseSet, start: ClauseId) -> Vec<ScanLink> {
    let mut chain = vec![ScanLink::Clause(start)];
    let mut cur = cs.clause(start).outer;
    while let Some(c) = cur {
        chain.push(ScanLink::Clause(c));
        cur = cs.clause(c).outer;
    }
    chain
}

/// Iterator state for one term search.
pub(crate) struct TermScan<'a, 'f> {
    cs: &'a ClauseSet,
    from: &'a [FromItem<'f>],
    chain: &'a [ScanLink],
    /// Required collating sequence, when scanning for an index.
    coll_name: Option<String>,
    /// Affinity the term must be compatible with, when `coll_name` is set.
    idx_aff: Affinity,
    op_mask: u16,
    link: usize,
    k: usize,
    equiv: Vec<(CursorId, i32)>,
    i_equiv: usize,
    dead: bool,
}

impl<'a, 'f> TermScan<'a, 'f> {
    pub(crate) fn new(
        cs: &'a ClauseSet,
        from: &'a [FromItem<'f>],
        chain: &'a [ScanLink],
        cursor: CursorId,
        column: i32,
        op_mask: u16,
        probe: Option<&IndexProbe<'_>>,
    ) -> Self {
        let mut coll_name = None;
        let mut idx_aff = Affinity::None;
        let mut dead = false;
        if let Some(p) = probe {
            if column >= 0 {
                idx_aff = p.table.column_affinity(column);
                match p.position_of(column) {
                    Some(j) => coll_name = Some(p.collation(j).to_owned()),
                    // The column is not in the index at all; nothing can
                    // match.
                    None => dead = true,
                }
            }
        }
        Self {
            cs,
            from,
            chain,
            coll_name,
            idx_aff,
            op_mask,
            link: 0,
            k: 0,
            equiv: vec![(cursor, column)],
            i_equiv: 0,
            dead,
        }
    }

    fn link_len(&self, link: usize) -> usize {
        match self.chain[link] {
            ScanLink::Clause(c) => self.cs.clause(c).terms.len(),
            ScanLink::Single(_) => 1,
        }
    }

    fn link_term(&self, link: usize, k: usize) -> TermRef {
        match self.chain[link] {
            ScanLink::Clause(c) => TermRef { clause: c, term: k },
            ScanLink::Single(t) => t,
        }
    }

    /// The operand pair of an index-relevant term, for collation and
    /// affinity checks.
    fn operands(e: &Expr) -> Option<(&Expr, Option<&Expr>)> {
        match peel_expr(e) {
            Expr::Compare { left, right, .. } => Some((left.as_ref(), Some(right.as_ref()))),
            Expr::In { lhs, .. } => Some((lhs.as_ref(), None)),
            Expr::IsNull { expr, .. } => Some((expr.as_ref(), None)),
            _ => None,
        }
    }

    /// The bare column on the RHS of a comparison, if there is one.
    fn rhs_column(e: &Expr) -> Option<(CursorId, i32)> {
        let (_, right) = Self::operands(e)?;
        match right?.skip_collate() {
            Expr::Column { cursor, column, .. } => Some((*cursor, *column)),
            _ => None,
        }
    }
}

impl Iterator for TermScan<'_, '_> {
    type Item = TermRef;

    fn next(&mut self) -> Option<TermRef> {
        if self.dead {
            return None;
        }
        while self.i_equiv < self.equiv.len() {
            let (cur, col) = self.equiv[self.i_equiv];
            while self.link < self.chain.len() {
                while self.k < self.link_len(self.link) {
                    let tr = self.link_term(self.link, self.k);
                    self.k += 1;
                    let t = self.cs.term(tr);
                    if t.left_cursor != Some(cur) || t.left_column != col {
                        continue;
                    }
                    // Feed the equivalence set before any other filtering:
                    // X=Y makes Y's constraints interesting even when this
                    // particular term is not.
                    if t.e_operator & wo::EQUIV != 0 && self.equiv.len() < MAX_EQUIV {
                        if let Some(pair) = Self::rhs_column(&t.expr) {
                            if !self.equiv.contains(&pair) {
                                self.equiv.push(pair);
                            }
                        }
                    }
                    if t.e_operator & self.op_mask == 0 {
                        continue;
                    }
                    if self.coll_name.is_some() && t.e_operator & wo::ISNULL == 0 {
                        if let Some((left, right)) = Self::operands(&t.expr) {
                            if !index_affinity_ok(peel_expr(&t.expr), self.idx_aff, self.from) {
                                continue;
                            }
                            let coll = binary_compare_collation(left, right, self.from);
                            let want = self.coll_name.as_deref().unwrap_or("BINARY");
                            if !coll.eq_ignore_ascii_case(want) {
                                continue;
                            }
                        }
                    }
                    // `X = X'` where X' is the seed itself would loop the
                    // transitivity back onto its origin.
                    if t.e_operator & wo::EQ != 0 {
                        if let Some(pair) = Self::rhs_column(&t.expr) {
                            if pair == self.equiv[0] {
                                continue;
                            }
                        }
                    }
                    return Some(tr);
                }
                self.link += 1;
                self.k = 0;
            }
            self.link = 0;
            self.k = 0;
            self.i_equiv += 1;
        }
        None
    }
}

/// Search for a term of the form `X <op> <expr>` usable against column
/// `column` of `cursor`, where the RHS does not overlap `not_ready`.
///
/// Terms with a constant RHS are preferred: the first equality with no
/// dependencies wins outright, otherwise the first usable term found is
/// returned.
pub(crate) fn find_term(
    cs: &ClauseSet,
    from: &[FromItem<'_>],
    chain: &[ScanLink],
    cursor: CursorId,
    column: i32,
    not_ready: Bitmask,
    op_mask: u16,
    probe: Option<&IndexProbe<'_>>,
) -> Option<TermRef> {
    let mut result = None;
    let scan = TermScan::new(cs, from, chain, cursor, column, op_mask, probe);
    for tr in scan {
        let t = cs.term(tr);
        if (t.prereq_right & not_ready).is_empty() {
            if t.prereq_right.is_empty() && t.e_operator & wo::EQ != 0 {
                return Some(tr);
            }
            if result.is_none() {
                result = Some(tr);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, Table};
    use crate::clause::{analyze_all, split, AnalyzeCx, SplitOp};
    use crate::masks::MaskSet;
    use crate::PlannerOptions;
    use lodestone_ast::CompareOp;

    fn tables() -> Vec<Table> {
        (0..3)
            .map(|i| {
                Table::btree(
                    format!("t{i}"),
                    vec![Column::numeric("x"), Column::numeric("y")],
                    1000,
                )
            })
            .collect()
    }

    fn setup<'a>(
        tables: &'a [Table],
        e: &Expr,
    ) -> (Vec<FromItem<'a>>, MaskSet, ClauseSet, ClauseId) {
        let from: Vec<FromItem<'a>> = tables
            .iter()
            .enumerate()
            .map(|(i, t)| FromItem::new(t, CursorId(i as i32)))
            .collect();
        let mut masks = MaskSet::new();
        for fi in &from {
            masks.assign(fi.cursor);
        }
        let mut cs = ClauseSet::new();
        let main = cs.add_clause(SplitOp::And, None);
        split(&mut cs, main, e, SplitOp::And);
        let opts = PlannerOptions::default();
        let cx = AnalyzeCx {
            from: &from,
            masks: &masks,
            opts: &opts,
        };
        analyze_all(&mut cs, main, &cx);
        (from, masks, cs, main)
    }

    #[test]
    fn finds_direct_constraint() {
        let ts = tables();
        let e = Expr::compare(CompareOp::Eq, Expr::column(CursorId(0), 0), Expr::integer(5));
        let (from, _masks, cs, main) = setup(&ts, &e);
        let chain = chain_from(&cs, main);
        let found: Vec<_> = TermScan::new(&cs, &from, &chain, CursorId(0), 0, wo::EQ, None).collect();
        assert_eq!(found.len(), 1);
        let none: Vec<_> = TermScan::new(&cs, &from, &chain, CursorId(0), 1, wo::EQ, None).collect();
        assert!(none.is_empty());
    }

    #[test]
    fn equivalence_transitivity_reaches_constraints() {
        // t0.x = t1.x AND t1.x = 5: a scan for t0.x equality constraints
        // must surface the constant constraint through the equivalence.
        let ts = tables();
        let e = Expr::and(
            Expr::compare(
                CompareOp::Eq,
                Expr::column(CursorId(0), 0),
                Expr::column(CursorId(1), 0),
            ),
            Expr::compare(CompareOp::Eq, Expr::column(CursorId(1), 0), Expr::integer(5)),
        );
        let (from, _masks, cs, main) = setup(&ts, &e);
        let chain = chain_from(&cs, main);
        let found: Vec<_> = TermScan::new(&cs, &from, &chain, CursorId(0), 0, wo::EQ, None).collect();
        // The direct join term plus the constant term on the equivalent
        // column.
        assert!(found.len() >= 2);
        let consts: Vec<_> = found
            .iter()
            .filter(|&&tr| cs.term(tr).prereq_right.is_empty())
            .collect();
        assert_eq!(consts.len(), 1);
    }

    #[test]
    fn find_term_prefers_constant_rhs() {
        let ts = tables();
        let e = Expr::and(
            Expr::compare(
                CompareOp::Eq,
                Expr::column(CursorId(0), 0),
                Expr::column(CursorId(1), 0),
            ),
            Expr::compare(CompareOp::Eq, Expr::column(CursorId(0), 0), Expr::integer(9)),
        );
        let (from, _masks, cs, main) = setup(&ts, &e);
        let chain = chain_from(&cs, main);
        let tr = find_term(
            &cs,
            &from,
            &chain,
            CursorId(0),
            0,
            Bitmask::EMPTY,
            wo::EQ,
            None,
        )
        .expect("term");
        assert!(cs.term(tr).prereq_right.is_empty());
    }

    #[test]
    fn not_ready_mask_excludes_dependent_terms() {
        let ts = tables();
        let e = Expr::compare(
            CompareOp::Eq,
            Expr::column(CursorId(0), 0),
            Expr::column(CursorId(1), 0),
        );
        let (from, masks, cs, main) = setup(&ts, &e);
        let chain = chain_from(&cs, main);
        let not_ready = masks.mask_of(CursorId(1));
        let tr = find_term(
            &cs,
            &from,
            &chain,
            CursorId(0),
            0,
            not_ready,
            wo::EQ,
            None,
        );
        assert!(tr.is_none());
    }

    #[test]
    fn equivalence_set_is_bounded() {
        // A long chain of equalities x0=x1, x1=x2, ... must terminate.
        let ts: Vec<Table> = (0..16)
            .map(|i| Table::btree(format!("t{i}"), vec![Column::numeric("x")], 100))
            .collect();
        let mut e = Expr::compare(
            CompareOp::Eq,
            Expr::column(CursorId(0), 0),
            Expr::column(CursorId(1), 0),
        );
        for i in 1..15 {
            e = Expr::and(
                e,
                Expr::compare(
                    CompareOp::Eq,
                    Expr::column(CursorId(i), 0),
                    Expr::column(CursorId(i + 1), 0),
                ),
            );
        }
        let (from, _masks, cs, main) = setup(&ts, &e);
        let chain = chain_from(&cs, main);
        let mut scan = TermScan::new(&cs, &from, &chain, CursorId(0), 0, wo::EQ, None);
        let mut n = 0;
        while scan.next().is_some() {
            n += 1;
            assert!(n < 1000, "scan failed to terminate");
        }
        assert!(scan.equiv.len() <= MAX_EQUIV);
    }
}
