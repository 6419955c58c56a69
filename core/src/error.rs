use thiserror::Error;

/// Error taxonomy for the reconciliation engine.
///
/// Scope matters more than type here: only `Connectivity` at the start
/// of a run aborts the run. `Config` skips one report, `ExprParse` and
/// `Eval` skip one record, and persistence failures are counted without
/// aborting the batch. A record with no derivable mapping key carries no
/// error at all — it is counted as skipped. The job runner enforces the
/// scoping; the variants just name the failure.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unreachable: {0}")]
    Connectivity(String),

    #[error("Invalid formula document '{report}': {reason}")]
    Config { report: String, reason: String },

    #[error("Cannot parse expression '{expr}': {reason}")]
    ExprParse { expr: String, reason: String },

    #[error("Evaluation failed: {0}")]
    Eval(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
