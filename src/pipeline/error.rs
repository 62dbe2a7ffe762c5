use thiserror::Error;

use super::format::FormatError;
use crate::db::ExecutionError;
use crate::intent::guard::IntentError;
use crate::llm::LlmError;
use crate::query::QueryBuildError;

/// Why a stage failed. Only classification, build and execution abort the
/// pipeline; the others degrade.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("classification failed: {0}")]
    Classification(String),
    #[error("query build failed: {0}")]
    QueryBuild(#[from] QueryBuildError),
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),
    #[error("formatting failed: {0}")]
    Formatting(#[from] FormatError),
    #[error("generation failed: {0}")]
    Generation(#[from] LlmError),
}

impl From<IntentError> for StageError {
    fn from(err: IntentError) -> Self {
        StageError::Classification(err.to_string())
    }
}
