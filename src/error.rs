use thiserror::Error;

/// Errors that abort an estimation run.
///
/// Everything else is absorbed where it happens: a failed black-box call
/// becomes an [`EvaluationFailure`] attached to that result, a rank-deficient
/// normal-equations solve is regularized and flagged on the iteration, and a
/// line search without an improving step ends the run as a stall.
#[derive(Error, Debug)]
pub enum EstimationError {
    /// Bad parameter, bounds or evaluator setup. Raised before any
    /// evaluation starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persisted optimizer state could not be written or read back.
    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: String, reason: String },
}

/// Failure of a single black-box evaluation.
///
/// Attached to the affected [`Evaluation`](crate::Evaluation); one failed
/// call never invalidates the other evaluations of the same batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationFailure {
    /// The evaluation working directory or parameter file could not be set up.
    #[error("evaluation setup failed: {0}")]
    Setup(String),

    /// The model process could not be started.
    #[error("failed to start model process: {0}")]
    Spawn(String),

    /// The model process exited unsuccessfully.
    #[error("model process exited with {status}")]
    ProcessExit { status: String },

    /// The model process was killed after exceeding the configured timeout.
    #[error("model process exceeded the {limit_ms} ms timeout")]
    Timeout { limit_ms: u64 },

    /// No measurement file was produced.
    #[error("no measurement file at {path}")]
    MissingOutput { path: String },

    /// The measurement file could not be parsed.
    #[error("malformed measurement file: {0}")]
    MalformedOutput(String),

    /// The measurement file is missing its end-of-run marker.
    #[error("measurement file is incomplete, the model did not finish")]
    Unfinished,

    /// The model produced a different number of series than the target has.
    #[error("model produced {found} measurement series, target has {expected}")]
    SeriesCountMismatch { expected: usize, found: usize },
}
