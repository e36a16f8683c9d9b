use std::fmt;

/// Result type for pallas operations
pub type Result<T> = std::result::Result<T, PallasError>;

/// Main error type for the pallas library
#[derive(Debug, Clone)]
pub enum PallasError {
    /// Invalid dimensions for operations
    DimensionMismatch {
        expected: String,
        actual: String,
    },

    /// Invalid parameter value
    InvalidParameter {
        name: String,
        reason: String,
    },

    /// IO errors (file operations, worker pipes)
    IoError(String),

    /// Serialization/deserialization errors
    SerializationError(String),

    /// Numerical computation errors
    NumericalError(String),

    /// Empty batch or container
    EmptyBatch(String),

    /// Sampling more records than the buffer holds
    BufferUnderrun {
        requested: usize,
        available: usize,
    },

    /// `step_async` called while a step is already in flight
    StepPending,

    /// `step_wait` called with no step in flight
    NoPendingStep,

    /// Malformed or unexpected message between supervisor and worker
    Protocol(String),

    /// A worker stopped responding
    WorkerCrashed {
        worker: usize,
        reason: String,
    },

    /// The pool was closed
    PoolClosed,

    /// A worker crashed earlier; the pool cannot be used anymore
    PoolDegraded,

    /// Observation or action space the models cannot handle
    UnsupportedSpace {
        role: String,
        space: String,
    },

    /// Error raised by an environment
    Environment(String),

    /// Stored checkpoint does not match the state template
    RestoreMismatch(String),

    /// No checkpoint to restore from
    CheckpointNotFound(String),

    /// Training error
    TrainingError(String),
}

impl fmt::Display for PallasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PallasError::DimensionMismatch { expected, actual } => {
                write!(f, "Dimension mismatch: expected {}, got {}", expected, actual)
            }
            PallasError::InvalidParameter { name, reason } => {
                write!(f, "Invalid parameter '{}': {}", name, reason)
            }
            PallasError::IoError(msg) => write!(f, "IO error: {}", msg),
            PallasError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            PallasError::NumericalError(msg) => write!(f, "Numerical error: {}", msg),
            PallasError::EmptyBatch(msg) => write!(f, "Empty batch: {}", msg),
            PallasError::BufferUnderrun { requested, available } => {
                write!(f, "Buffer underrun: requested {} records, {} stored", requested, available)
            }
            PallasError::StepPending => {
                write!(f, "Protocol error: step_async called while a step is pending")
            }
            PallasError::NoPendingStep => {
                write!(f, "Protocol error: step_wait called without a pending step")
            }
            PallasError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PallasError::WorkerCrashed { worker, reason } => {
                write!(f, "Worker {} crashed: {}", worker, reason)
            }
            PallasError::PoolClosed => write!(f, "Environment pool is closed"),
            PallasError::PoolDegraded => {
                write!(f, "Environment pool is degraded after a worker crash")
            }
            PallasError::UnsupportedSpace { role, space } => {
                write!(f, "Unsupported {} space: {}", role, space)
            }
            PallasError::Environment(msg) => write!(f, "Environment error: {}", msg),
            PallasError::RestoreMismatch(msg) => write!(f, "Checkpoint mismatch: {}", msg),
            PallasError::CheckpointNotFound(msg) => write!(f, "Checkpoint not found: {}", msg),
            PallasError::TrainingError(msg) => write!(f, "Training error: {}", msg),
        }
    }
}

impl std::error::Error for PallasError {}

// Conversion from std::io::Error
impl From<std::io::Error> for PallasError {
    fn from(err: std::io::Error) -> Self {
        PallasError::IoError(err.to_string())
    }
}

// Conversion from bincode::Error
impl From<bincode::Error> for PallasError {
    fn from(err: bincode::Error) -> Self {
        PallasError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for PallasError {
    fn from(err: serde_json::Error) -> Self {
        PallasError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for PallasError {
    fn from(err: ndarray::ShapeError) -> Self {
        PallasError::DimensionMismatch {
            expected: "compatible shapes".to_string(),
            actual: err.to_string(),
        }
    }
}

// Helper functions for common error patterns
impl PallasError {
    pub fn dimension_mismatch<S: Into<String>>(expected: S, actual: S) -> Self {
        PallasError::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid_parameter<S: Into<String>>(name: S, reason: S) -> Self {
        PallasError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_space<S: Into<String>>(role: S, space: S) -> Self {
        PallasError::UnsupportedSpace {
            role: role.into(),
            space: space.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = PallasError::BufferUnderrun { requested: 8, available: 3 };
        assert_eq!(err.to_string(), "Buffer underrun: requested 8 records, 3 stored");

        let err = PallasError::invalid_parameter("tau", "must be in (0, 1]");
        assert_eq!(err.to_string(), "Invalid parameter 'tau': must be in (0, 1]");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "pipe closed");
        let err: PallasError = io.into();
        assert!(matches!(err, PallasError::IoError(_)));
    }
}
