//! Error types for alert history backends

/// Result type alias for history operations
pub type HistoryResult<T> = Result<T, HistoryError>;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("failed to open alert history: {0}")]
    ConnectionFailed(String),

    #[error("alert history query failed: {0}")]
    QueryFailed(String),

    #[error("alert history migration failed: {0}")]
    MigrationFailed(String),

    #[error("alert serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt history row: {0}")]
    CorruptRow(String),
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for HistoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => HistoryError::QueryFailed("no rows found".to_string()),
            _ => HistoryError::QueryFailed(err.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for HistoryError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        HistoryError::MigrationFailed(err.to_string())
    }
}
