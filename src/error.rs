use thiserror::Error;

/// Errors surfaced by index construction and querying
///
/// All of them are fatal at the call that triggers them: no partially built
/// index and no partial query result is ever returned alongside an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NNDescentError {
    /// The metric name is unknown or its parameters are unusable
    #[error("unsupported metric: {name}")]
    UnsupportedMetric { name: String },

    /// Point dimensionality does not match the trained dataset
    #[error("dimension mismatch: expected {expected} features, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Neighbour count is zero or too large for the dataset
    #[error("invalid k = {k} for a dataset of {n} points: {reason}")]
    InvalidK {
        k: usize,
        n: usize,
        reason: &'static str,
    },

    /// Construction was attempted on zero points
    #[error("cannot build an index over an empty dataset")]
    EmptyDataset,

    /// Input holding a NaN or infinite value
    #[error("non-finite value in row {row}")]
    NonFiniteValue { row: usize },

    /// More points than the 32-bit neighbour indices can address
    #[error("{n} points exceed the maximum of {max}")]
    TooManyPoints { n: usize, max: usize },

    /// CSR input whose pointers, indices or values are inconsistent
    #[error("malformed sparse input: {0}")]
    MalformedSparse(String),
}

pub type Result<T> = std::result::Result<T, NNDescentError>;

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = NNDescentError::UnsupportedMetric {
            name: "braycurtis".to_string(),
        };
        assert_eq!(err.to_string(), "unsupported metric: braycurtis");

        let err = NNDescentError::DimensionMismatch {
            expected: 5,
            got: 3,
        };
        assert_eq!(
            err.to_string(),
            "dimension mismatch: expected 5 features, got 3"
        );

        let err = NNDescentError::InvalidK {
            k: 20,
            n: 10,
            reason: "k exceeds the number of trained points",
        };
        assert!(err.to_string().contains("k = 20"));

        let err = NNDescentError::NonFiniteValue { row: 7 };
        assert_eq!(err.to_string(), "non-finite value in row 7");
    }
}
