/// All errors the optimization core can report.
///
/// Residual evaluation never produces one of these: blocks that hit a
/// degenerate or non-finite configuration emit zero rows instead of failing.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A matrix, layout, or residual block was assembled incorrectly.
    /// This always indicates a caller bug.
    #[error("invalid construction: {0}")]
    InvalidConstruction(String),
    /// A vector length does not match the matrix shape it is used with.
    /// This always indicates a caller bug.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// The solver detected numbers it cannot recover from by damping
    /// (for example a gradient norm beyond the bail-out threshold).
    /// The solve is abandoned and entities are left untouched.
    #[error("numerical divergence: {0}")]
    NumericalDivergence(String),
    /// The problem cannot be optimized at all (no cameras, every variable
    /// locked, and so on). Reported by the readiness check.
    #[error("degenerate problem: {0}")]
    DegenerateProblem(String),
}
