use thiserror::Error;

/// Failure of one of the backing stores.
///
/// Detection layers never fail on their own; every violation is a classification
/// outcome. The only errors that reach a caller are infrastructure failures of the
/// TTL cache or the durable log, or a maintenance task that died.
#[derive(Debug, Error)]
pub enum TrapError {
    #[error("TTL cache error: {0}")]
    Cache(String),

    #[error("Durable log error: {0}")]
    Log(#[from] rusqlite::Error),

    #[error("Failed to acquire lock (poisoned): {0}")]
    LockPoisoned(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<redis::RedisError> for TrapError {
    fn from(err: redis::RedisError) -> Self {
        TrapError::Cache(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TrapError {
    fn from(err: tokio::task::JoinError) -> Self {
        TrapError::Task(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for TrapError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TrapError::LockPoisoned(err.to_string())
    }
}

pub type TrapResult<T> = Result<T, TrapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrapError::Cache("connection refused".to_string());
        assert_eq!(err.to_string(), "TTL cache error: connection refused");

        let err = TrapError::LockPoisoned("ban log".to_string());
        assert!(err.to_string().contains("poisoned"));
    }

    #[tokio::test]
    async fn test_from_join_error() {
        let join_err = tokio::task::spawn_blocking(|| -> u64 { panic!("sweep blew up") })
            .await
            .unwrap_err();
        let err: TrapError = join_err.into();
        assert!(matches!(err, TrapError::Task(_)));
        assert!(err.to_string().starts_with("Background task failed"));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let err: TrapError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, TrapError::Log(_)));
    }
}
