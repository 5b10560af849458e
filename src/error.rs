use thiserror::Error;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BenchError {
    #[error("invalid run configuration: {0}")]
    Config(String),

    #[error("inference backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("call timed out after {0}s")]
    Timeout(u64),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("unparseable judge output: {0}")]
    JudgeParse(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl BenchError {
    pub fn code(&self) -> &'static str {
        match self {
            BenchError::Config(_) => "config_error",
            BenchError::BackendUnavailable(_) => "backend_unavailable",
            BenchError::Inference(_) => "inference_error",
            BenchError::Timeout(_) => "timeout",
            BenchError::Persistence(_) => "persistence_error",
            BenchError::JudgeParse(_) => "judge_parse_error",
            BenchError::InvalidState(_) => "invalid_state",
            BenchError::Dataset(_) => "dataset_error",
            BenchError::NotFound(_) => "not_found",
        }
    }

    /// Errors that abort the whole run rather than a single result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BenchError::Persistence(_))
    }
}

impl From<reqwest::Error> for BenchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            BenchError::BackendUnavailable(e.to_string())
        } else if e.is_timeout() {
            BenchError::Inference(format!("request timed out: {}", e))
        } else {
            BenchError::Inference(e.to_string())
        }
    }
}
