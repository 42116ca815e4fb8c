//! Error types shared by every stage of the neighbor search.

use std::fmt;

/// A distance evaluation that produced NaN or an infinity for a candidate pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceFault {
    /// The query point whose heap was being filled.
    pub point: usize,
    /// The candidate whose distance to `point` was not finite.
    pub candidate: usize,
    pub distance: f32,
}

impl fmt::Display for DistanceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d({}, {}) = {}", self.point, self.candidate, self.distance)
    }
}

/// Error type for matrix construction, input validation and search.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("All rows must have the same number of columns: row {row} has {found}, expected {expected}")]
    RaggedRows { row: usize, expected: usize, found: usize },

    #[error("Matrix must have at least one row and one column")]
    EmptyMatrix,

    #[error("Matrix data length {len} does not match {rows} x {cols}")]
    ShapeMismatch { rows: usize, cols: usize, len: usize },

    #[error("k must be between 1 and {max}, got {k}")]
    InvalidK { k: usize, max: usize },

    #[error("Dimension mismatch: expected {expected} columns, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Input matrix contains NaN or infinite values")]
    NonFiniteInput,

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Precomputed distances must form a square matrix, got {rows} x {cols}")]
    PrecomputedNotSquare { rows: usize, cols: usize },

    #[error("Malformed random projection tree: {0}")]
    MalformedTree(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Metric returned non-finite distances for {} candidate pair(s)", .0.len())]
    NonFiniteDistances(Vec<DistanceFault>),
}

/// Result type for neighbor search operations.
pub type Result<T> = std::result::Result<T, SearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_finite_message_counts_faults() {
        let err = SearchError::NonFiniteDistances(vec![
            DistanceFault { point: 3, candidate: 7, distance: f32::NAN },
            DistanceFault { point: 4, candidate: 1, distance: f32::INFINITY },
        ]);
        let message = err.to_string();
        assert!(message.contains("2 candidate pair(s)"), "Message should carry the fault count: {}", message);
        if let SearchError::NonFiniteDistances(faults) = &err {
            assert_eq!(faults[0].to_string(), "d(3, 7) = NaN");
        }
    }
}
