//! Conversions from external infrastructure errors into port errors.
//!
//! Both target types live in `sheetgate-core`, so the conversions are
//! expressed as extension traits rather than `From` impls.

use reqwest::Error as HttpError;
use rusqlite::Error as SqlError;
use sheetgate_core::{StoreError, UpstreamError, UpstreamErrorKind};

/// Convert an adapter error into a [`StoreError`]
pub(crate) trait IntoStoreError {
    fn into_store_error(self) -> StoreError;
}

/// Convert an adapter error into an [`UpstreamError`]
pub(crate) trait IntoUpstreamError {
    fn into_upstream_error(self) -> UpstreamError;
}

/* -------------------------------------------------------------------------- */
/* rusqlite::Error → StoreError */
/* -------------------------------------------------------------------------- */

impl IntoStoreError for SqlError {
    fn into_store_error(self) -> StoreError {
        use rusqlite::ffi::ErrorCode;
        use rusqlite::Error as RE;

        match self {
            RE::SqliteFailure(err, maybe_message) => {
                let message = maybe_message.unwrap_or_default();
                match err.code {
                    ErrorCode::DatabaseBusy => StoreError::unavailable("database is busy"),
                    ErrorCode::DatabaseLocked => StoreError::unavailable("database is locked"),
                    ErrorCode::CannotOpen => {
                        StoreError::unavailable(format!("cannot open database: {message}"))
                    }
                    ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                        StoreError::Corrupt {
                            message: format!("database file is unusable: {message}"),
                        }
                    }
                    code => StoreError::backend(format!(
                        "sqlite failure {code:?} (code {}): {message}",
                        err.extended_code
                    )),
                }
            }
            RE::FromSqlConversionFailure(_, _, cause) => {
                StoreError::Corrupt { message: format!("failed to convert sqlite value: {cause}") }
            }
            RE::InvalidColumnType(_, _, ty) => {
                StoreError::Corrupt { message: format!("invalid column type: {ty}") }
            }
            RE::InvalidPath(path) => StoreError::InvalidRequest {
                message: format!("invalid database path: {}", path.to_string_lossy()),
            },
            other => StoreError::backend(other.to_string()),
        }
    }
}

impl IntoStoreError for r2d2::Error {
    fn into_store_error(self) -> StoreError {
        StoreError::unavailable(format!("connection pool: {self}"))
    }
}

impl IntoStoreError for serde_json::Error {
    fn into_store_error(self) -> StoreError {
        StoreError::Corrupt {
            message: format!("stored circuit snapshot is not valid JSON: {self}"),
        }
    }
}

impl IntoStoreError for tokio::task::JoinError {
    fn into_store_error(self) -> StoreError {
        StoreError::backend(format!("blocking state store task failed: {self}"))
    }
}

/* -------------------------------------------------------------------------- */
/* reqwest::Error → UpstreamError */
/* -------------------------------------------------------------------------- */

impl IntoUpstreamError for HttpError {
    fn into_upstream_error(self) -> UpstreamError {
        if self.is_timeout() {
            return UpstreamError::timeout("HTTP request timed out");
        }

        if let Some(status) = self.status() {
            let code = status.as_u16();
            let reason = status.canonical_reason().unwrap_or("unknown status");
            let message = format!("HTTP {code} {reason}");
            return UpstreamError::from_status(code, message);
        }

        if self.is_connect() {
            let message = format!("HTTP connection failure: {self}");
            return UpstreamError::new(UpstreamErrorKind::Unavailable, message);
        }

        // Broken bodies and resets mid-response surface as request/body errors
        if self.is_body() || self.is_request() || self.is_decode() {
            return UpstreamError::stream_reset(self.to_string());
        }

        UpstreamError::new(UpstreamErrorKind::Other, self.to_string())
    }
}

/* -------------------------------------------------------------------------- */
/* Tests */
/* -------------------------------------------------------------------------- */
