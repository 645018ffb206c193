use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("{0} not found")]
    NotFound(&'static str),
}

/// Raised by the progress sync path; nothing is persisted when one is returned.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid commit payload: {0}")]
    Validation(String),
    #[error("session {0} belongs to a different learner or unit")]
    SessionConflict(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn status(&self) -> StatusCode {
        match self {
            SyncError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::SessionConflict(_) => StatusCode::CONFLICT,
            SyncError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StoreError {
    pub fn status(&self) -> StatusCode {
        match self {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
