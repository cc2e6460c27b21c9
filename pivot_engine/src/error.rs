use polars::prelude::PolarsError;
use thiserror::Error;

/// Failure of a single transform step.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("column '{0}' not found")]
    MissingColumn(String),

    #[error("no inflation factor for dollar year {0}")]
    MissingDeflator(i32),

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

/// Registry and runner failures. Each one aborts a single result only.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unknown result '{0}'")]
    UnknownResult(String),

    #[error("result '{result}': failed to load table '{table}': {source}")]
    TableLoad {
        result: String,
        table: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("result '{result}': column '{column}' missing from table '{table}'")]
    MissingColumn {
        result: String,
        table: String,
        column: String,
    },

    #[error("result '{result}': step {step} ({kind}) failed on table '{table}': {source}")]
    Step {
        result: String,
        table: String,
        step: usize,
        kind: &'static str,
        #[source]
        source: TransformError,
    },

    #[error("result '{result}': index column '{column}' did not survive the pipeline")]
    IndexLost { result: String, column: String },

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

impl PipelineError {
    /// Name of the result the error belongs to, if any.
    pub fn result_name(&self) -> Option<&str> {
        match self {
            PipelineError::UnknownResult(name) => Some(name),
            PipelineError::TableLoad { result, .. }
            | PipelineError::MissingColumn { result, .. }
            | PipelineError::Step { result, .. }
            | PipelineError::IndexLost { result, .. } => Some(result),
            PipelineError::Polars(_) => None,
        }
    }
}
