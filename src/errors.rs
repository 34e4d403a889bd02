use std::io;

use thiserror::Error;

use crate::places::PlaceValidationError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    InvalidPlace(#[from] PlaceValidationError),
    #[error("{0}")]
    Config(String),
    #[error("channel `{0}` is closed")]
    ChannelClosed(&'static str),
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
}

/// Errors that end a single worker for good. Everything else a worker meets is
/// absorbed into "task complete, zero results".
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{worker}: credential {credential} exhausted its quota after {total_requests} requests")]
    QuotaExhausted {
        worker: String,
        credential: String,
        total_requests: u64,
    },
    #[error("{worker}: too many critical errors encountered ({count} > {threshold})")]
    TooManyCriticalErrors {
        worker: String,
        count: u32,
        threshold: u32,
    },
    #[error("{worker}: credential {credential} failed the startup check with {status}")]
    CredentialRejected {
        worker: String,
        credential: String,
        status: String,
    },
    #[error("{worker}: task ended abnormally: {source}")]
    Aborted {
        worker: String,
        #[source]
        source: tokio::task::JoinError,
    },
    #[error("{worker}: {source}")]
    Internal {
        worker: String,
        #[source]
        source: AppError,
    },
}
