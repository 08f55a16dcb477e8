use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("risk model not ready: {0}")]
    NotReady(String),
    #[error("storage error: {0}")]
    TransientStorage(String),
    #[error("a training run is already in progress")]
    TrainingInProgress,
    #[error("training cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::TransientStorage(message.into())
    }

    /// Only storage failures are safe to replay; every operation recomputes
    /// from freshly read state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::TransientStorage(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::TransientStorage(format!("snapshot encoding failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_errors_are_retryable() {
        assert!(CoreError::storage("connection reset").is_retryable());
        assert!(!CoreError::validation("bad prior").is_retryable());
        assert!(!CoreError::NotReady("empty".into()).is_retryable());
        assert!(!CoreError::TrainingInProgress.is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
    }

    #[test]
    fn messages_name_the_category() {
        let err = CoreError::validation("prior 1.2 outside [0, 1]");
        assert_eq!(err.to_string(), "validation error: prior 1.2 outside [0, 1]");
    }
}
