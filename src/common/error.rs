//! Error types for chunkshift

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordinator Document Errors ===
    #[error("ConflictError: migration {existing} already covers {namespace} {range}")]
    Conflict {
        namespace: String,
        range: String,
        existing: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("CorruptStateError for migration {migration_id}: {reason}")]
    CorruptState {
        migration_id: String,
        reason: String,
    },

    #[error("Decision for migration {migration_id} is already {existing}, refusing {attempted}")]
    DecisionConflict {
        migration_id: String,
        existing: String,
        attempted: String,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // === Protocol Errors ===
    #[error("VersionConflict: {0}")]
    VersionConflict(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not primary: {0}")]
    NotPrimary(String),

    #[error("Interrupted at {0}")]
    Interrupted(String),

    // === Shard Data Errors ===
    #[error("Duplicate key in index {index}: {key}")]
    DuplicateKey { index: String, key: String },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    // === Storage Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::Timeout(_) | Error::ConnectionFailed(_)
        )
    }

    /// Short machine-readable code used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            Error::Conflict { .. } => "ConflictError",
            Error::NotFound(_) => "NotFound",
            Error::CorruptState { .. } => "CorruptStateError",
            Error::DecisionConflict { .. } => "DecisionConflict",
            Error::VersionConflict(_) => "VersionConflict",
            Error::Transient(_) | Error::Timeout(_) | Error::ConnectionFailed(_) => {
                "TransientError"
            }
            Error::NotPrimary(_) => "NotPrimary",
            Error::Interrupted(_) => "Interrupted",
            Error::DuplicateKey { .. } => "DuplicateKey",
            Error::InvalidDocument(_) | Error::InvalidRange(_) | Error::InvalidConfig(_) => {
                "BadValue"
            }
            _ => "InternalError",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict { .. }
            | Error::VersionConflict(_)
            | Error::DecisionConflict { .. }
            | Error::DuplicateKey { .. } => StatusCode::CONFLICT,
            Error::InvalidDocument(_) | Error::InvalidRange(_) | Error::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotPrimary(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Transient(_) | Error::ConnectionFailed(_) | Error::Interrupted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rebuild an error from a wire code and message
    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "NotFound" => Error::NotFound(message),
            "VersionConflict" => Error::VersionConflict(message),
            "TransientError" | "Interrupted" | "NotPrimary" => Error::Transient(message),
            "DuplicateKey" => Error::DuplicateKey {
                index: "unknown".into(),
                key: message,
            },
            "BadValue" => Error::InvalidDocument(message),
            "CorruptStateError" => Error::CorruptState {
                migration_id: "unknown".into(),
                reason: message,
            },
            _ => Error::Http(format!("{}: {}", code, message)),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else if e.status().is_some_and(|s| s.is_server_error()) {
            Error::Transient(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "code": self.code(), "error": self.to_string() });
        (self.to_http_status(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transient("peer unavailable".into()).is_retryable());
        assert!(Error::Timeout("commitChunk".into()).is_retryable());
        assert!(Error::ConnectionFailed("refused".into()).is_retryable());
        assert!(!Error::VersionConflict("stale epoch".into()).is_retryable());
        assert!(!Error::CorruptState {
            migration_id: "m".into(),
            reason: "bad crc".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_wire_code_round_trip_keeps_classification() {
        let err = Error::from_code("TransientError", "shard down".into());
        assert!(err.is_retryable());
        let err = Error::from_code("VersionConflict", "expected 3".into());
        assert!(matches!(err, Error::VersionConflict(_)));
        let err = Error::from_code("CorruptStateError", "abort after commit".into());
        assert!(matches!(err, Error::CorruptState { .. }));
        assert!(!err.is_retryable());
    }
}
