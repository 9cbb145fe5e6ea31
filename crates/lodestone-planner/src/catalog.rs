//! The slice of the schema catalog the planner consumes.
//!
//! The real catalog (DDL, storage layout, collation registry) lives
//! upstream; planning needs only the shapes below: per-column affinity and
//! NOT NULL flags, per-index column/collation/sort-order lists, row
//! estimates, optional histogram samples, and the virtual-table planning
//! entry point.
//!
//! Secondary-index keys are logically extended by the primary-key columns,
//! so an index on `t1(c)` where `t1` has `PRIMARY KEY(a, b)` exposes three
//! key fields: `c`, `a`, `b`. [`IndexProbe`] resolves field positions
//! across that boundary.

use std::fmt;

use lodestone_ast::SortOrder;
use lodestone_types::{Bitmask, CursorId, BMS};
use serde::{Deserialize, Serialize};

use crate::vtab::VirtualTable;

// ---------------------------------------------------------------------------
// Affinity
// ---------------------------------------------------------------------------

/// Column type affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Affinity {
    /// No affinity; comparisons are exact.
    #[default]
    None,
    Text,
    Numeric,
    Integer,
    Real,
}

impl Affinity {
    /// Whether this affinity coerces operands numerically.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Numeric | Self::Integer | Self::Real)
    }

    /// Whether two affinities are interchangeable for index key comparisons.
    #[must_use]
    pub const fn same_class(self, other: Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Text, Self::Text) => true,
            _ => self.is_numeric() && other.is_numeric(),
        }
    }
}

// ---------------------------------------------------------------------------
// Columns and indexes
// ---------------------------------------------------------------------------

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub affinity: Affinity,
    pub not_null: bool,
    /// Default collating sequence for comparisons against this column.
    pub collation: String,
}

impl Column {
    /// A column with TEXT affinity and BINARY collation.
    #[must_use]
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affinity: Affinity::Text,
            not_null: false,
            collation: "BINARY".to_owned(),
        }
    }

    /// A column with NUMERIC affinity and BINARY collation.
    #[must_use]
    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affinity: Affinity::Numeric,
            not_null: false,
            collation: "BINARY".to_owned(),
        }
    }

    /// Builder-style NOT NULL marker.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Builder-style collation override.
    #[must_use]
    pub fn with_collation(mut self, coll: impl Into<String>) -> Self {
        self.collation = coll.into();
        self
    }
}

/// How an index enforces uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    PrimaryKey,
    Unique,
    Plain,
}

/// One key field of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    /// Column position within the table. Negative values name the
    /// table's implicit key.
    pub column: i32,
    pub collation: String,
    pub sort_order: SortOrder,
}

impl IndexColumn {
    /// An ascending, BINARY-collated key field.
    #[must_use]
    pub fn asc(column: i32) -> Self {
        Self {
            column,
            collation: "BINARY".to_owned(),
            sort_order: SortOrder::Asc,
        }
    }
}

/// A value sampled from the left-most column of an index, with its rank.
///
/// This is the stat3-style histogram: `n_lt` rows sort strictly below the
/// sample, `n_eq` rows equal it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSample {
    pub value: SampleValue,
    pub n_eq: u64,
    pub n_lt: u64,
}

/// A sampled key value. Ordering follows the storage comparison order:
/// numbers, then text, then blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SampleValue {
    /// Type-rank for cross-type comparisons.
    const fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Integer(_) | Self::Real(_) => 1,
            Self::Text(_) => 2,
            Self::Blob(_) => 3,
        }
    }

    /// Total ordering matching the index key sort order.
    #[must_use]
    pub fn compare(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let (ra, rb) = (self.rank(), other.rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Real(a), Self::Real(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            #[allow(clippy::cast_precision_loss)]
            (Self::Integer(a), Self::Real(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            #[allow(clippy::cast_precision_loss)]
            (Self::Real(a), Self::Integer(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Blob(a), Self::Blob(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// An index over one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    pub name: String,
    pub kind: IndexKind,
    pub columns: Vec<IndexColumn>,
    /// `row_est[k]` estimates the number of rows matching any fixed value
    /// of the first `k` key fields; `row_est[0]` is the table row count.
    /// Length is `columns.len() + 1`.
    pub row_est: Vec<u64>,
    /// True for indexes whose entries carry no useful ordering (e.g. a
    /// hash-shaped extension index). Range scans and ORDER BY cannot use
    /// these.
    pub unordered: bool,
    /// Histogram samples over the left-most key field, sorted ascending.
    pub samples: Vec<IndexSample>,
    /// Average `n_eq` over the samples, used for keys falling between them.
    pub avg_eq: u64,
}

impl Index {
    /// An index with default row estimates (10 rows per distinct prefix
    /// narrowing per extra column, from a base of `rows`).
    #[must_use]
    pub fn new(name: impl Into<String>, kind: IndexKind, columns: Vec<IndexColumn>) -> Self {
        let n = columns.len();
        let mut row_est = Vec::with_capacity(n + 1);
        let mut est = 1_000_000u64;
        for _ in 0..=n {
            row_est.push(est);
            est = (est / 10).max(1);
        }
        Self {
            name: name.into(),
            kind,
            columns,
            row_est,
            unordered: false,
            samples: Vec::new(),
            avg_eq: 1,
        }
    }

    /// Builder-style row estimates (must have `columns.len() + 1` entries).
    #[must_use]
    pub fn with_row_est(mut self, row_est: Vec<u64>) -> Self {
        debug_assert_eq!(row_est.len(), self.columns.len() + 1);
        self.row_est = row_est;
        self
    }

    /// Whether this index enforces uniqueness over its declared columns.
    #[must_use]
    pub const fn is_unique(&self) -> bool {
        matches!(self.kind, IndexKind::PrimaryKey | IndexKind::Unique)
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Storage flavor of a table.
pub enum TableKind {
    /// An ordinary b-tree table.
    BTree,
    /// A table whose scan/seek semantics come from an external module.
    Virtual(Box<dyn VirtualTable>),
}

impl fmt::Debug for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BTree => f.write_str("BTree"),
            Self::Virtual(_) => f.write_str("Virtual(..)"),
        }
    }
}

/// A table as the planner sees it.
#[derive(Debug)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    /// All indexes; for b-tree tables the primary key comes first by
    /// convention, but [`Table::primary_key`] does not rely on position.
    pub indexes: Vec<Index>,
    /// Estimated number of rows.
    pub row_est: u64,
    pub kind: TableKind,
}

impl Table {
    /// A b-tree table with no indexes yet.
    #[must_use]
    pub fn btree(name: impl Into<String>, columns: Vec<Column>, row_est: u64) -> Self {
        Self {
            name: name.into(),
            columns,
            indexes: Vec::new(),
            row_est,
            kind: TableKind::BTree,
        }
    }

    /// Whether the table is provided by a virtual-table module.
    #[must_use]
    pub const fn is_virtual(&self) -> bool {
        matches!(self.kind, TableKind::Virtual(_))
    }

    /// Position of the primary-key index, if the table has one.
    #[must_use]
    pub fn primary_key(&self) -> Option<usize> {
        self.indexes
            .iter()
            .position(|i| i.kind == IndexKind::PrimaryKey)
    }

    /// Look up an index position by name (case-insensitive).
    #[must_use]
    pub fn index_position(&self, name: &str) -> Option<usize> {
        self.indexes
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(name))
    }

    /// Affinity of a column; negative positions (the implicit key) have
    /// no affinity.
    #[must_use]
    pub fn column_affinity(&self, column: i32) -> Affinity {
        usize::try_from(column)
            .ok()
            .and_then(|c| self.columns.get(c))
            .map_or(Affinity::None, |c| c.affinity)
    }

    /// NOT NULL flag of a column; the implicit key is never null.
    #[must_use]
    pub fn column_not_null(&self, column: i32) -> bool {
        usize::try_from(column)
            .ok()
            .and_then(|c| self.columns.get(c))
            .map_or(true, |c| c.not_null)
    }

    /// Default collation of a column.
    #[must_use]
    pub fn column_collation(&self, column: i32) -> &str {
        usize::try_from(column)
            .ok()
            .and_then(|c| self.columns.get(c))
            .map_or("BINARY", |c| c.collation.as_str())
    }
}

// ---------------------------------------------------------------------------
// Index probes: secondary index plus appended primary-key fields
// ---------------------------------------------------------------------------

/// A view of one index together with the primary key whose columns extend
/// its key, resolving field positions across the boundary.
#[derive(Clone, Copy)]
pub struct IndexProbe<'a> {
    pub table: &'a Table,
    pub index: &'a Index,
    /// The table's primary key, when `index` is not itself the PK.
    pub pk: Option<&'a Index>,
}

impl<'a> IndexProbe<'a> {
    /// Build a probe for index `pos` of `table`.
    #[must_use]
    pub fn new(table: &'a Table, pos: usize) -> Self {
        let index = &table.indexes[pos];
        let pk = if index.kind == IndexKind::PrimaryKey {
            None
        } else {
            table.primary_key().map(|p| &table.indexes[p])
        };
        Self { table, index, pk }
    }

    /// Total number of key fields, including appended PK fields.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.index.columns.len() + self.pk.map_or(0, |pk| pk.columns.len())
    }

    /// Table column number of the `i`-th key field, or None past the end.
    #[must_use]
    pub fn column_number(&self, i: usize) -> Option<i32> {
        if i < self.index.columns.len() {
            Some(self.index.columns[i].column)
        } else {
            self.pk
                .and_then(|pk| pk.columns.get(i - self.index.columns.len()))
                .map(|c| c.column)
        }
    }

    /// Collation of the `i`-th key field.
    #[must_use]
    pub fn collation(&self, i: usize) -> &str {
        if i < self.index.columns.len() {
            &self.index.columns[i].collation
        } else {
            self.pk
                .and_then(|pk| pk.columns.get(i - self.index.columns.len()))
                .map_or("BINARY", |c| c.collation.as_str())
        }
    }

    /// Sort order of the `i`-th key field. Appended PK fields sort
    /// ascending.
    #[must_use]
    pub fn sort_order(&self, i: usize) -> SortOrder {
        if i < self.index.columns.len() {
            self.index.columns[i].sort_order
        } else {
            SortOrder::Asc
        }
    }

    /// Key-field position of table column `column`, if indexed.
    #[must_use]
    pub fn position_of(&self, column: i32) -> Option<usize> {
        (0..self.column_count()).find(|&i| self.column_number(i) == Some(column))
    }

    /// Bitmask of table columns available from this index's entries
    /// (declared key fields plus appended PK fields). Only the first 63
    /// column positions are tracked; higher positions share the top bit.
    #[must_use]
    pub fn columns_covered(&self) -> Bitmask {
        let mut m = Bitmask::EMPTY;
        for i in 0..self.column_count() {
            if let Some(c) = self.column_number(i) {
                if c >= 0 {
                    let bit = usize::try_from(c).unwrap_or(BMS - 1).min(BMS - 1);
                    m |= Bitmask::bit(bit);
                }
            }
        }
        m
    }
}

// ---------------------------------------------------------------------------
// FROM-list entries
// ---------------------------------------------------------------------------

/// How a FROM entry joins to the entries before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
    Cross,
}

/// One entry of the FROM list handed to the planner.
#[derive(Debug)]
pub struct FromItem<'a> {
    pub table: &'a Table,
    pub cursor: CursorId,
    pub join: JoinKind,
    /// `INDEXED BY name` forces one specific index.
    pub indexed_by: Option<String>,
    /// `NOT INDEXED` restricts access to the primary key.
    pub not_indexed: bool,
    /// Bitmask of table columns the query reads (column n -> bit n, with
    /// bit 63 standing in for all higher columns).
    pub columns_used: Bitmask,
    /// True when this entry belongs to a correlated subquery; automatic
    /// indexes are not built for those.
    pub correlated: bool,
}

impl<'a> FromItem<'a> {
    /// A plain inner-joined FROM entry reading every column.
    #[must_use]
    pub fn new(table: &'a Table, cursor: CursorId) -> Self {
        Self {
            table,
            cursor,
            join: JoinKind::Inner,
            indexed_by: None,
            not_indexed: false,
            columns_used: Bitmask::ALL,
            correlated: false,
        }
    }

    /// Builder-style join kind.
    #[must_use]
    pub fn with_join(mut self, join: JoinKind) -> Self {
        self.join = join;
        self
    }

    /// Builder-style used-column mask.
    #[must_use]
    pub fn with_columns_used(mut self, used: Bitmask) -> Self {
        self.columns_used = used;
        self
    }
}
