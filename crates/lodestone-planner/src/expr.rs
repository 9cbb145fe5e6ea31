//! Expression utilities used by WHERE analysis.
//!
//! Table-usage masks, comparison commuting, collation and affinity
//! resolution, and the LIKE/GLOB and MATCH pattern probes. Nothing here
//! evaluates an expression; these routines only inspect shape.

use lodestone_ast::{CompareOp, Expr, InSet, LikeKind, Literal};
use lodestone_types::{Bitmask, CursorId};

use crate::catalog::{Affinity, FromItem};
use crate::masks::MaskSet;

/// Find the FROM entry for a cursor.
pub(crate) fn find_from<'a, 'f>(
    from: &'a [FromItem<'f>],
    cursor: CursorId,
) -> Option<&'a FromItem<'f>> {
    from.iter().find(|fi| fi.cursor == cursor)
}

// ---------------------------------------------------------------------------
// Table usage
// ---------------------------------------------------------------------------

/// Bitmask of every table referenced anywhere in `e`.
pub(crate) fn expr_usage(ms: &MaskSet, e: &Expr) -> Bitmask {
    match e {
        Expr::Literal(..) | Expr::Placeholder { .. } => Bitmask::EMPTY,
        Expr::Column { cursor, .. } => ms.mask_of(*cursor),
        Expr::Compare { left, right, .. }
        | Expr::And { left, right, .. }
        | Expr::Or { left, right, .. } => expr_usage(ms, left) | expr_usage(ms, right),
        Expr::Between {
            expr, low, high, ..
        } => expr_usage(ms, expr) | expr_usage(ms, low) | expr_usage(ms, high),
        Expr::In { lhs, set, .. } => expr_usage(ms, lhs) | in_set_usage(ms, set),
        Expr::Like {
            lhs,
            pattern,
            escape,
            ..
        } => {
            let mut m = expr_usage(ms, lhs) | expr_usage(ms, pattern);
            if let Some(esc) = escape {
                m |= expr_usage(ms, esc);
            }
            m
        }
        Expr::IsNull { expr, .. }
        | Expr::NotNull { expr, .. }
        | Expr::Collate { expr, .. }
        | Expr::FromJoin { expr, .. } => expr_usage(ms, expr),
        Expr::Function { args, .. } => args
            .iter()
            .fold(Bitmask::EMPTY, |m, a| m | expr_usage(ms, a)),
    }
}

/// Bitmask of every table referenced by the RHS of an IN.
pub(crate) fn in_set_usage(ms: &MaskSet, set: &InSet) -> Bitmask {
    match set {
        InSet::List(items) => items
            .iter()
            .fold(Bitmask::EMPTY, |m, e| m | expr_usage(ms, e)),
        InSet::Subquery(sub) => sub
            .used_cursors
            .iter()
            .fold(Bitmask::EMPTY, |m, &c| m | ms.mask_of(c)),
    }
}

/// Bitmask of every table referenced by a list of expressions.
pub(crate) fn expr_list_usage<'a, I>(ms: &MaskSet, list: I) -> Bitmask
where
    I: IntoIterator<Item = &'a Expr>,
{
    list.into_iter()
        .fold(Bitmask::EMPTY, |m, e| m | expr_usage(ms, e))
}

// ---------------------------------------------------------------------------
// Affinity
// ---------------------------------------------------------------------------

/// Affinity of an expression. Only column references carry affinity;
/// literals and computed expressions have none.
pub(crate) fn expr_affinity(e: &Expr, from: &[FromItem<'_>]) -> Affinity {
    match e {
        Expr::Column { cursor, column, .. } => find_from(from, *cursor)
            .map_or(Affinity::None, |fi| fi.table.column_affinity(*column)),
        Expr::Collate { expr, .. } | Expr::FromJoin { expr, .. } => expr_affinity(expr, from),
        _ => Affinity::None,
    }
}

/// The affinity a comparison applies to its operands before comparing.
pub(crate) fn comparison_affinity(left: &Expr, right: &Expr, from: &[FromItem<'_>]) -> Affinity {
    let al = expr_affinity(left, from);
    let ar = expr_affinity(right, from);
    match (al, ar) {
        (Affinity::None, Affinity::None) => Affinity::None,
        (Affinity::None, a) | (a, Affinity::None) => a,
        (a, b) => {
            if a.is_numeric() || b.is_numeric() {
                Affinity::Numeric
            } else {
                Affinity::None
            }
        }
    }
}

/// Whether a comparison term can be checked against an index key field of
/// affinity `idx_aff` without a type conversion changing its meaning.
pub(crate) fn index_affinity_ok(e: &Expr, idx_aff: Affinity, from: &[FromItem<'_>]) -> bool {
    let Expr::Compare { left, right, .. } = e else {
        return true;
    };
    let aff = comparison_affinity(left, right, from);
    aff == Affinity::None || aff.same_class(idx_aff)
}

// ---------------------------------------------------------------------------
// Collation
// ---------------------------------------------------------------------------

/// The collating sequence an expression supplies, if any: an explicit
/// COLLATE wrapper, or a column's default collation.
pub(crate) fn collation_of(e: &Expr, from: &[FromItem<'_>]) -> Option<String> {
    match e {
        Expr::Collate { collation, .. } => Some(collation.clone()),
        Expr::Column { cursor, column, .. } => {
            find_from(from, *cursor).map(|fi| fi.table.column_collation(*column).to_owned())
        }
        Expr::FromJoin { expr, .. } => collation_of(expr, from),
        _ => None,
    }
}

/// The collating sequence used by a binary comparison: the left operand's
/// collation wins; `BINARY` when neither operand supplies one.
pub(crate) fn binary_compare_collation(
    left: &Expr,
    right: Option<&Expr>,
    from: &[FromItem<'_>],
) -> String {
    collation_of(left, from)
        .or_else(|| right.and_then(|r| collation_of(r, from)))
        .unwrap_or_else(|| "BINARY".to_owned())
}

// ---------------------------------------------------------------------------
// Commuting
// ---------------------------------------------------------------------------

/// Rewrite `X op Y` as `Y op' X` in place.
///
/// The collating sequence of a comparison must not change when the
/// operands swap, and the left-hand side takes precedence. So: if both
/// sides carry an explicit COLLATE the right's is dropped, and if neither
/// does but the old left column has a non-default collation it is pinned
/// with an explicit wrapper before the swap.
pub(crate) fn commute_comparison(e: &mut Expr, from: &[FromItem<'_>]) {
    let Expr::Compare {
        op, left, right, ..
    } = e
    else {
        debug_assert!(false, "commute of non-comparison");
        return;
    };
    let left_explicit = matches!(**left, Expr::Collate { .. });
    let right_explicit = matches!(**right, Expr::Collate { .. });
    if left_explicit == right_explicit {
        if right_explicit {
            let stripped = right.skip_collate().clone();
            **right = stripped;
        } else if let Some(coll) = collation_of(left, from) {
            if coll != "BINARY" {
                let inner = std::mem::replace(&mut **left, Expr::null());
                **left = inner.collate(coll);
            }
        }
    }
    std::mem::swap(left, right);
    *op = op.commuted();
}

// ---------------------------------------------------------------------------
// LIKE / GLOB prefix probe
// ---------------------------------------------------------------------------

/// The result of recognizing an index-optimizable LIKE or GLOB term.
pub(crate) struct LikeProbe {
    pub cursor: CursorId,
    pub column: i32,
    /// Lower range bound: the literal pattern prefix, original case.
    pub lo: String,
    /// Upper range bound: the prefix with its last byte incremented
    /// (lowercased first for case-insensitive matches).
    pub hi: String,
    /// True when the only wildcard is a single trailing `%`; the original
    /// LIKE term is then fully subsumed by the synthesized range.
    pub is_complete: bool,
    pub no_case: bool,
}

/// Check whether `e` is a LIKE or GLOB that can be optimized with
/// inequality constraints: the left side must be a TEXT-affinity column of
/// an ordinary table, and the pattern a string literal that does not begin
/// with a wildcard. The prefix must be ASCII so that incrementing its last
/// byte yields a well-formed upper bound.
pub(crate) fn like_probe(e: &Expr, from: &[FromItem<'_>], like_nocase: bool) -> Option<LikeProbe> {
    let Expr::Like {
        kind,
        lhs,
        pattern,
        escape,
        ..
    } = e
    else {
        return None;
    };
    if escape.is_some() {
        return None;
    }
    let no_case = *kind == LikeKind::Like && like_nocase;
    let wild: &[u8] = match kind {
        LikeKind::Like => b"%_",
        LikeKind::Glob => b"*?[",
    };

    let Expr::Column { cursor, column, .. } = *lhs.skip_collate() else {
        return None;
    };
    let fi = find_from(from, cursor)?;
    if column < 0 || fi.table.is_virtual() || fi.table.column_affinity(column) != Affinity::Text {
        return None;
    }

    let Expr::Literal(Literal::String(z), _) = pattern.skip_collate() else {
        return None;
    };
    let bytes = z.as_bytes();
    let cnt = bytes.iter().take_while(|b| !wild.contains(b)).count();
    if cnt == 0 || !bytes[cnt - 1].is_ascii() {
        return None;
    }

    let mut is_complete = cnt < bytes.len() && bytes[cnt] == wild[0] && cnt + 1 == bytes.len();
    let lo = z[..cnt].to_owned();
    let mut hi_bytes = lo.clone().into_bytes();
    if let Some(last) = hi_bytes.last_mut() {
        // Incrementing '@' would land in the alphabetic range where case
        // conversion breaks the inequality; keep the full LIKE as residue.
        if no_case {
            if *last == b'A' - 1 {
                is_complete = false;
            }
            *last = last.to_ascii_lowercase();
        }
        *last += 1;
    }
    let hi = String::from_utf8(hi_bytes).ok()?;

    Some(LikeProbe {
        cursor,
        column,
        lo,
        hi,
        is_complete,
        no_case,
    })
}

// ---------------------------------------------------------------------------
// MATCH probe
// ---------------------------------------------------------------------------

/// Check for `match(pattern, column)` with a bare column second argument.
/// Returns `(pattern, cursor, column)`.
pub(crate) fn match_of_column(e: &Expr) -> Option<(&Expr, CursorId, i32)> {
    let Expr::Function { name, args, .. } = e else {
        return None;
    };
    if !name.eq_ignore_ascii_case("match") || args.len() != 2 {
        return None;
    }
    let Expr::Column { cursor, column, .. } = args[1].skip_collate() else {
        return None;
    };
    Some((&args[0], *cursor, *column))
}

/// Map an index-relevant expression root to its one-hot operator bit,
/// or 0 when the planner cannot drive an index with it.
pub(crate) fn operator_mask(e: &Expr) -> u16 {
    use crate::clause::wo;
    match e {
        Expr::Compare { op, .. } => match op {
            CompareOp::Eq => wo::EQ,
            CompareOp::Lt => wo::LT,
            CompareOp::Le => wo::LE,
            CompareOp::Gt => wo::GT,
            CompareOp::Ge => wo::GE,
        },
        Expr::In { .. } => wo::IN,
        Expr::IsNull { .. } => wo::ISNULL,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, Table};
    use lodestone_ast::CompareOp;

    fn fixture() -> (Table, Table) {
        let t1 = Table::btree("t1", vec![Column::numeric("a"), Column::text("b")], 100);
        let t2 = Table::btree("t2", vec![Column::numeric("p")], 100);
        (t1, t2)
    }

    #[test]
    fn usage_masks() {
        let (t1, t2) = fixture();
        let from = vec![
            FromItem::new(&t1, CursorId(0)),
            FromItem::new(&t2, CursorId(1)),
        ];
        let mut ms = MaskSet::new();
        for fi in &from {
            ms.assign(fi.cursor);
        }
        let e = Expr::compare(
            CompareOp::Eq,
            Expr::column(CursorId(0), 0),
            Expr::column(CursorId(1), 0),
        );
        assert_eq!(expr_usage(&ms, &e), Bitmask(0b11));
        assert_eq!(expr_usage(&ms, &Expr::integer(3)), Bitmask::EMPTY);
    }

    #[test]
    fn commute_swaps_and_flips() {
        let (t1, _) = fixture();
        let from = vec![FromItem::new(&t1, CursorId(0))];
        let mut e = Expr::compare(
            CompareOp::Lt,
            Expr::integer(5),
            Expr::column(CursorId(0), 0),
        );
        commute_comparison(&mut e, &from);
        let Expr::Compare { op, left, .. } = &e else {
            panic!("not a comparison")
        };
        assert_eq!(*op, CompareOp::Gt);
        assert!(matches!(**left, Expr::Column { column: 0, .. }));
    }

    #[test]
    fn commute_pins_left_collation() {
        let mut t1 = Table::btree("t1", vec![Column::text("a")], 100);
        t1.columns[0].collation = "NOCASE".to_owned();
        let from = vec![FromItem::new(&t1, CursorId(0))];
        let mut e = Expr::compare(
            CompareOp::Eq,
            Expr::column(CursorId(0), 0),
            Expr::string("x"),
        );
        commute_comparison(&mut e, &from);
        let Expr::Compare { right, .. } = &e else {
            panic!("not a comparison")
        };
        // The old LHS moved right but keeps its collation pinned.
        assert!(matches!(**right, Expr::Collate { .. }));
        assert_eq!(binary_compare_collation(right, None, &from), "NOCASE");
    }

    #[test]
    fn like_probe_basics() {
        let (t1, _) = fixture();
        let from = vec![FromItem::new(&t1, CursorId(0))];
        let e = Expr::Like {
            kind: LikeKind::Like,
            lhs: Box::new(Expr::column(CursorId(0), 1)),
            pattern: Box::new(Expr::string("abc%")),
            escape: None,
            span: lodestone_ast::Span::ZERO,
        };
        let p = like_probe(&e, &from, true).expect("probe");
        assert_eq!(p.lo, "abc");
        assert_eq!(p.hi, "abd");
        assert!(p.is_complete);
        assert!(p.no_case);
    }

    #[test]
    fn like_probe_rejects_leading_wildcard_and_non_text() {
        let (t1, _) = fixture();
        let from = vec![FromItem::new(&t1, CursorId(0))];
        let leading = Expr::Like {
            kind: LikeKind::Like,
            lhs: Box::new(Expr::column(CursorId(0), 1)),
            pattern: Box::new(Expr::string("%abc")),
            escape: None,
            span: lodestone_ast::Span::ZERO,
        };
        assert!(like_probe(&leading, &from, true).is_none());
        let numeric_col = Expr::Like {
            kind: LikeKind::Like,
            lhs: Box::new(Expr::column(CursorId(0), 0)),
            pattern: Box::new(Expr::string("abc%")),
            escape: None,
            span: lodestone_ast::Span::ZERO,
        };
        assert!(like_probe(&numeric_col, &from, true).is_none());
    }

    #[test]
    fn like_probe_at_sign_keeps_residue() {
        let (t1, _) = fixture();
        let from = vec![FromItem::new(&t1, CursorId(0))];
        let e = Expr::Like {
            kind: LikeKind::Like,
            lhs: Box::new(Expr::column(CursorId(0), 1)),
            pattern: Box::new(Expr::string("a@%")),
            escape: None,
            span: lodestone_ast::Span::ZERO,
        };
        let p = like_probe(&e, &from, true).expect("probe");
        assert!(!p.is_complete);
        assert_eq!(p.hi, "aA");
    }

    #[test]
    fn glob_is_case_sensitive() {
        let (t1, _) = fixture();
        let from = vec![FromItem::new(&t1, CursorId(0))];
        let e = Expr::Like {
            kind: LikeKind::Glob,
            lhs: Box::new(Expr::column(CursorId(0), 1)),
            pattern: Box::new(Expr::string("AB*")),
            escape: None,
            span: lodestone_ast::Span::ZERO,
        };
        let p = like_probe(&e, &from, true).expect("probe");
        assert!(!p.no_case);
        assert_eq!(p.lo, "AB");
        assert_eq!(p.hi, "AC");
    }
}
