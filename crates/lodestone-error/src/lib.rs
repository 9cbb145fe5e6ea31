//! Error types for the lodestone query planner.
//!
//! The planner has exactly three failure outcomes, all reported through
//! [`PlanError`], never through panics: schema/contract violations,
//! the no-valid-plan condition, and resource exhaustion. A WHERE term the
//! planner cannot use is *not* an error; it is retained as post-filter
//! residue. Missing statistics merely fall back to default cost factors.

use thiserror::Error;

/// Primary error type for planning operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The FROM clause joins more tables than a dependency bitmask can hold.
    #[error("at most {max} tables in a join")]
    TooManyTables { max: usize },

    /// An INDEXED BY clause named an index that does not exist on the table.
    #[error("no such index: {index} on table {table}")]
    NoSuchIndex { table: String, index: String },

    /// A virtual table's planning method claimed an argument slot for a
    /// constraint that was marked unusable, or otherwise returned a
    /// malformed plan.
    #[error("{table}.best_index() malfunction")]
    BestIndexMalfunction { table: String },

    /// A virtual table's planning method failed outright.
    #[error("best_index error on {table}: {message}")]
    BestIndexFailed { table: String, message: String },

    /// Every candidate access path was forbidden. Only reachable when an
    /// INDEXED BY constraint excludes the sole usable path.
    #[error("no query solution")]
    NoQuerySolution,

    /// Working memory for planning could not be obtained.
    #[error("out of memory")]
    OutOfMemory,
}

impl PlanError {
    /// Whether the statement could succeed if re-planned after a schema or
    /// statistics change, as opposed to a hard contract violation.
    #[must_use]
    pub const fn is_schema_dependent(&self) -> bool {
        matches!(
            self,
            Self::NoSuchIndex { .. } | Self::NoQuerySolution | Self::TooManyTables { .. }
        )
    }
}

/// Result type alias using [`PlanError`].
pub type Result<T> = std::result::Result<T, PlanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PlanError::TooManyTables { max: 64 };
        assert_eq!(err.to_string(), "at most 64 tables in a join");

        let err = PlanError::NoSuchIndex {
            table: "t1".to_owned(),
            index: "i9".to_owned(),
        };
        assert_eq!(err.to_string(), "no such index: i9 on table t1");

        let err = PlanError::BestIndexMalfunction {
            table: "vt".to_owned(),
        };
        assert_eq!(err.to_string(), "vt.best_index() malfunction");

        assert_eq!(PlanError::NoQuerySolution.to_string(), "no query solution");
    }

    #[test]
    fn schema_dependent_classification() {
        assert!(PlanError::NoQuerySolution.is_schema_dependent());
        assert!(PlanError::TooManyTables { max: 64 }.is_schema_dependent());
        assert!(!PlanError::OutOfMemory.is_schema_dependent());
        assert!(!PlanError::BestIndexMalfunction {
            table: "vt".to_owned()
        }
        .is_schema_dependent());
    }
}
