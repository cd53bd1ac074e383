use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("printer not ready: {0}")]
    PrinterOffline(String),

    #[error("printer error: {0}")]
    Printer(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("print job error: {0}")]
    PrintJob(String),

    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    #[error("retry budget exhausted: {0}")]
    RetryExhausted(String),

    #[error("recovery error: {0}")]
    Recovery(String),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
