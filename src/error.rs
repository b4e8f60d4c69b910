//! Error types for the calculation engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CalcError>;

#[derive(Debug, Error)]
pub enum CalcError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid matrix file: {0}")]
    MatrixFormat(String),

    /// The technology matrix is singular or the iterative solver did not converge.
    #[error("the linear system ({size}x{size}) is not solvable: {reason}")]
    Unsolvable { size: usize, reason: String },

    #[error("library {library} does not match the store: {reason}")]
    LibraryMismatch { library: String, reason: String },

    #[error("calculation aborted")]
    Aborted,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{0}")]
    InvalidInput(String),
}

/// A data-quality problem that was absorbed instead of failing the calculation.
#[derive(Debug, Clone, PartialEq)]
pub enum DataWarning {
    /// A process referenced by the index has no exchange rows in the store.
    MissingProcess { process_id: i64 },
    /// A provider has no reference exchange for its product; its column stays zero.
    MissingProduct { process_id: i64, flow_id: i64 },
    /// A cache load failed; the key was answered with an empty list.
    LoadFailed { cache: &'static str, keys: Vec<i64>, message: String },
}

impl std::fmt::Display for DataWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataWarning::MissingProcess { process_id } => {
                write!(f, "process {} has no exchanges in the store", process_id)
            }
            DataWarning::MissingProduct { process_id, flow_id } => write!(
                f,
                "process {} has no output of product {}",
                process_id, flow_id
            ),
            DataWarning::LoadFailed { cache, keys, message } => write!(
                f,
                "{} cache failed to load {:?}: {}",
                cache, keys, message
            ),
        }
    }
}
