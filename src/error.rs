use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification used by callers that only care about how to react,
/// not which operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputValidation,
    IoFailure,
    IntegrityFailure,
    ConcurrencyConflict,
    Timeout,
    CryptoFailure,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("secret rejected by strength policy: {0}")]
    WeakSecret(String),

    #[error("key derivation failed: {0}")]
    DerivationFailure(String),

    #[error("no keystore initialised; set up a secret before requesting recovery")]
    RecoveryUnavailable,

    #[error("insufficient disk space for {needed} byte snapshot")]
    InsufficientDiskSpace { needed: u64 },

    #[error("backup io failed after {attempts} attempts: {source}")]
    BackupIo {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("migration failed on table '{table}': {cause}")]
    MigrationFailed { table: String, cause: String },

    #[error("{0} is already running")]
    ConcurrencyConflict(&'static str),

    #[error("'{check}' exceeded its {timeout_ms} ms bound")]
    Timeout { check: String, timeout_ms: u64 },

    #[error("health check failed: {0}")]
    Health(String),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("cannot {op} while in phase {phase}")]
    IllegalTransition { phase: &'static str, op: &'static str },

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("invalid version '{0}'; expected x.y.z")]
    InvalidVersion(String),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WeakSecret(_) | Error::UnknownTable(_) | Error::InvalidVersion(_) => {
                ErrorKind::InputValidation
            }
            Error::InsufficientDiskSpace { .. } | Error::BackupIo { .. } | Error::Io(_) => {
                ErrorKind::IoFailure
            }
            Error::ChecksumMismatch { .. } | Error::MigrationFailed { .. } | Error::Health(_) => {
                ErrorKind::IntegrityFailure
            }
            Error::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::DerivationFailure(_) | Error::CryptoFailure(_) => ErrorKind::CryptoFailure,
            Error::RecoveryUnavailable
            | Error::IllegalTransition { .. }
            | Error::Store(_)
            | Error::Serde(_) => ErrorKind::Internal,
        }
    }
}
