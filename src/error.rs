use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A referenced entity is absent.
    #[error("{0} not found")]
    NotFound(String),
    /// Duplicate enrollment or record, or a transition out of a terminal state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Role check failed.
    #[error("forbidden: {0}")]
    Authorization(String),
    /// Malformed status, grade or configuration value.
    #[error("invalid {0}")]
    Validation(String),
    /// The backing store failed; the only variant worth retrying.
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Authorization(_) => StatusCode::FORBIDDEN,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("record".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(db.message().to_string())
            }
            other => Error::Store(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::Store(e.to_string())
    }
}

// Handlers reject with (StatusCode, String) the same way for every route.
impl From<Error> for (StatusCode, String) {
    fn from(e: Error) -> Self {
        let status = e.status();
        if status.is_server_error() {
            tracing::error!(error = %e, "internal error");
        } else {
            tracing::debug!(error = %e, status = %status, "request rejected");
        }
        (status, e.to_string())
    }
}
