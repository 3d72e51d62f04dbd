/// Errors reported while constructing a transpose plan.
///
/// All failures are synchronous and surface from [`crate::create_plan`] or
/// the re-targeting setters; execution itself cannot fail once a plan
/// exists.
#[derive(Debug, thiserror::Error)]
pub enum TransposeError {
    #[error("rank must be at least 1")]
    InvalidRank,

    #[error("perm is not a permutation of 0..{0}")]
    InvalidPermutation(usize),

    #[error("invalid extent at axis {axis}: size {size} exceeds outer extent {outer}")]
    InvalidExtent {
        axis: usize,
        size: usize,
        outer: usize,
    },

    #[error("buffer too small: need {needed} elements, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("const-stride-1 blocking factor {0} is not supported (must be 1)")]
    UnsupportedConfiguration(usize),

    /// No plan candidate could be timed during the measurement phase.
    ///
    /// Never escapes `create_plan`: the planner swallows it and keeps the
    /// heuristic winner.
    #[error("measurement phase could not time any candidate")]
    MeasurementFailure,
}

/// Convenience alias for `Result<T, TransposeError>`.
pub type Result<T> = std::result::Result<T, TransposeError>;
