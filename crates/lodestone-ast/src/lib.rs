//! The resolved expression tree consumed by the query planner.
//!
//! The SQL parser and name resolver run upstream of the planner; by the
//! time an expression arrives here, every column reference has been bound
//! to a `(cursor, column)` pair and every subquery has been summarized.
//! The planner never evaluates these trees. It classifies them, splits
//! them on AND/OR, synthesizes derived comparisons, and hands subtrees to
//! the code emitter as part of the finished plan.
//!
//! Every node carries a [`Span`] pointing back into the SQL source text.

use std::fmt;

use lodestone_types::CursorId;

// ---------------------------------------------------------------------------
// Span: source location tracking
// ---------------------------------------------------------------------------

/// A byte-offset range into the original SQL source text.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    /// Byte offset of the first character (inclusive).
    pub start: u32,
    /// Byte offset one past the last character (exclusive).
    pub end: u32,
}

impl Span {
    /// A zero-length span at position 0, used as a placeholder.
    pub const ZERO: Self = Self { start: 0, end: 0 };

    /// Create a new span from start (inclusive) to end (exclusive).
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Literals and operators
// ---------------------------------------------------------------------------

/// A literal constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    Null,
}

/// The comparison operators the planner can drive an index with
/// (together with IN and IS NULL, which have their own node shapes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// The operator for the same comparison with its operands swapped:
    /// `X < Y` is `Y > X`.
    #[must_use]
    pub const fn commuted(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        })
    }
}

/// Pattern-match operator variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LikeKind {
    /// `LIKE`, case-insensitive over ASCII by default.
    Like,
    /// `GLOB`, case-sensitive, with `*` and `?` wildcards.
    Glob,
}

/// Sort direction of an index column or an ORDER BY term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// A resolved expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal constant.
    Literal(Literal, Span),

    /// A resolved column reference. `column` is the position within the
    /// table; negative values name the table's implicit key.
    Column {
        cursor: CursorId,
        column: i32,
        span: Span,
    },

    /// `left op right` for an index-relevant comparison.
    Compare {
        op: CompareOp,
        left: Box<Self>,
        right: Box<Self>,
        span: Span,
    },

    /// Logical conjunction.
    And {
        left: Box<Self>,
        right: Box<Self>,
        span: Span,
    },

    /// Logical disjunction.
    Or {
        left: Box<Self>,
        right: Box<Self>,
        span: Span,
    },

    /// `expr BETWEEN low AND high`.
    Between {
        expr: Box<Self>,
        low: Box<Self>,
        high: Box<Self>,
        span: Span,
    },

    /// `lhs IN (...)`.
    In {
        lhs: Box<Self>,
        set: InSet,
        span: Span,
    },

    /// `lhs LIKE/GLOB pattern [ESCAPE escape]`.
    Like {
        kind: LikeKind,
        lhs: Box<Self>,
        pattern: Box<Self>,
        escape: Option<Box<Self>>,
        span: Span,
    },

    /// `expr IS NULL`.
    IsNull { expr: Box<Self>, span: Span },

    /// `expr IS NOT NULL`.
    NotNull { expr: Box<Self>, span: Span },

    /// `expr COLLATE collation`.
    Collate {
        expr: Box<Self>,
        collation: String,
        span: Span,
    },

    /// A function call the planner treats as opaque, except for the
    /// two-argument `match(pattern, column)` form surfaced to virtual
    /// tables.
    Function {
        name: String,
        args: Vec<Self>,
        span: Span,
    },

    /// A subtree that originated in the ON clause of a LEFT JOIN.
    /// `right_table` is the cursor of the right-hand table of that join.
    /// The statement compiler applies this marking before planning.
    FromJoin {
        right_table: CursorId,
        expr: Box<Self>,
        span: Span,
    },

    /// A bind parameter. Constant for planning purposes.
    Placeholder { index: u32, span: Span },
}

/// The right-hand side of an IN expression.
#[derive(Debug, Clone, PartialEq)]
pub enum InSet {
    /// `IN (expr, expr, ...)`
    List(Vec<Expr>),
    /// `IN (SELECT ...)`, reduced to the summary the planner needs.
    Subquery(SubquerySummary),
}

/// What the planner knows about an IN-subquery: which outer cursors it
/// references. The resolver computes this; the planner does not walk
/// SELECT bodies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubquerySummary {
    pub used_cursors: Vec<CursorId>,
}

impl Expr {
    /// Return the span of this node.
    #[must_use]
    pub const fn span(&self) -> Span {
        match self {
            Self::Literal(_, s) => *s,
            Self::Column { span, .. }
            | Self::Compare { span, .. }
            | Self::And { span, .. }
            | Self::Or { span, .. }
            | Self::Between { span, .. }
            | Self::In { span, .. }
            | Self::Like { span, .. }
            | Self::IsNull { span, .. }
            | Self::NotNull { span, .. }
            | Self::Collate { span, .. }
            | Self::Function { span, .. }
            | Self::FromJoin { span, .. }
            | Self::Placeholder { span, .. } => *span,
        }
    }

    /// Skip over any COLLATE wrappers at the root of an expression.
    #[must_use]
    pub fn skip_collate(&self) -> &Self {
        let mut e = self;
        while let Self::Collate { expr, .. } = e {
            e = expr;
        }
        e
    }

    /// Whether the expression references no table at all. Bind parameters
    /// count as constant: their value is fixed for the life of one run of
    /// the statement.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        match self {
            Self::Literal(..) | Self::Placeholder { .. } => true,
            Self::Column { .. } => false,
            Self::Compare { left, right, .. }
            | Self::And { left, right, .. }
            | Self::Or { left, right, .. } => left.is_constant() && right.is_constant(),
            Self::Between {
                expr, low, high, ..
            } => expr.is_constant() && low.is_constant() && high.is_constant(),
            Self::In { lhs, set, .. } => {
                lhs.is_constant()
                    && match set {
                        InSet::List(items) => items.iter().all(Self::is_constant),
                        InSet::Subquery(sub) => sub.used_cursors.is_empty(),
                    }
            }
            Self::Like {
                lhs,
                pattern,
                escape,
                ..
            } => {
                lhs.is_constant()
                    && pattern.is_constant()
                    && escape.as_deref().map_or(true, Self::is_constant)
            }
            Self::IsNull { expr, .. }
            | Self::NotNull { expr, .. }
            | Self::Collate { expr, .. }
            | Self::FromJoin { expr, .. } => expr.is_constant(),
            Self::Function { args, .. } => args.iter().all(Self::is_constant),
        }
    }

    // --- constructors, mostly for tests and for planner synthesis ---

    /// A resolved column reference with a placeholder span.
    #[must_use]
    pub fn column(cursor: CursorId, column: i32) -> Self {
        Self::Column {
            cursor,
            column,
            span: Span::ZERO,
        }
    }

    /// An integer literal.
    #[must_use]
    pub fn integer(v: i64) -> Self {
        Self::Literal(Literal::Integer(v), Span::ZERO)
    }

    /// A string literal.
    #[must_use]
    pub fn string(v: impl Into<String>) -> Self {
        Self::Literal(Literal::String(v.into()), Span::ZERO)
    }

    /// A NULL literal.
    #[must_use]
    pub fn null() -> Self {
        Self::Literal(Literal::Null, Span::ZERO)
    }

    /// A comparison node.
    #[must_use]
    pub fn compare(op: CompareOp, left: Self, right: Self) -> Self {
        Self::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
            span: Span::ZERO,
        }
    }

    /// Conjoin two expressions.
    #[must_use]
    pub fn and(left: Self, right: Self) -> Self {
        Self::And {
            left: Box::new(left),
            right: Box::new(right),
            span: Span::ZERO,
        }
    }

    /// Disjoin two expressions.
    #[must_use]
    pub fn or(left: Self, right: Self) -> Self {
        Self::Or {
            left: Box::new(left),
            right: Box::new(right),
            span: Span::ZERO,
        }
    }

    /// Wrap in a COLLATE node.
    #[must_use]
    pub fn collate(self, collation: impl Into<String>) -> Self {
        Self::Collate {
            expr: Box::new(self),
            collation: collation.into(),
            span: Span::ZERO,
        }
    }

    /// Mark as originating in a LEFT JOIN ON clause.
    #[must_use]
    pub fn from_join(self, right_table: CursorId) -> Self {
        Self::FromJoin {
            right_table,
            expr: Box::new(self),
            span: Span::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// ORDER BY
// ---------------------------------------------------------------------------

/// One term of an ORDER BY (or GROUP BY, or DISTINCT projection) list.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderingTerm {
    pub expr: Expr,
    pub sort_order: SortOrder,
}

impl OrderingTerm {
    /// An ascending ordering term.
    #[must_use]
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            sort_order: SortOrder::Asc,
        }
    }

    /// A descending ordering term.
    #[must_use]
    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            sort_order: SortOrder::Desc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commuted_ops() {
        assert_eq!(CompareOp::Eq.commuted(), CompareOp::Eq);
        assert_eq!(CompareOp::Lt.commuted(), CompareOp::Gt);
        assert_eq!(CompareOp::Le.commuted(), CompareOp::Ge);
        assert_eq!(CompareOp::Gt.commuted(), CompareOp::Lt);
        assert_eq!(CompareOp::Ge.commuted(), CompareOp::Le);
    }

    #[test]
    fn skip_collate_unwraps_nested() {
        let e = Expr::column(CursorId(0), 1).collate("NOCASE").collate("BINARY");
        assert!(matches!(e.skip_collate(), Expr::Column { column: 1, .. }));
    }

    #[test]
    fn constants() {
        assert!(Expr::integer(5).is_constant());
        assert!(Expr::compare(CompareOp::Eq, Expr::integer(1), Expr::integer(1)).is_constant());
        assert!(!Expr::column(CursorId(0), 0).is_constant());
        assert!(Expr::Placeholder {
            index: 1,
            span: Span::ZERO
        }
        .is_constant());
        let in_list = Expr::In {
            lhs: Box::new(Expr::integer(1)),
            set: InSet::List(vec![Expr::integer(2), Expr::column(CursorId(3), 0)]),
            span: Span::ZERO,
        };
        assert!(!in_list.is_constant());
    }
}
