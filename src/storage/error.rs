use std::io;
use std::path::PathBuf;

use rusqlite::ErrorCode;

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("counter store at {path} is unavailable")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: UnavailableCause,
    },
    #[error("counter store is busy")]
    Busy(#[source] rusqlite::Error),
    #[error("invalid counter: {0}")]
    InvalidCounter(String),
    #[error("encoding counter field")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlite(rusqlite::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum UnavailableCause {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    /// Lock contention that is worth one more attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }

    pub(crate) fn from_sqlite(path: &std::path::Path, err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => StorageError::Busy(err),
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::ReadOnly
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied,
            ) => StorageError::Unavailable {
                path: path.to_path_buf(),
                source: UnavailableCause::Sqlite(err),
            },
            _ => StorageError::Sqlite(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sqlite_failure(code: ErrorCode) -> rusqlite::Error {
        let extended = match code {
            ErrorCode::DatabaseBusy => 5,
            ErrorCode::CannotOpen => 14,
            _ => 1,
        };
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code,
                extended_code: extended,
            },
            None,
        )
    }

    fn db() -> &'static Path {
        Path::new("x.db")
    }

    #[test]
    fn classifies_busy_as_transient() {
        let err = StorageError::from_sqlite(db(), sqlite_failure(ErrorCode::DatabaseBusy));
        assert!(err.is_transient());
        assert!(!err.is_unavailable());
    }

    #[test]
    fn classifies_cannot_open_as_unavailable() {
        let err = StorageError::from_sqlite(db(), sqlite_failure(ErrorCode::CannotOpen));
        assert!(err.is_unavailable());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("x.db"));
    }

    #[test]
    fn other_sqlite_errors_pass_through() {
        let err = StorageError::from_sqlite(db(), rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, StorageError::Sqlite(_)));
    }
}
