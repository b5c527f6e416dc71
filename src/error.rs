//! Error types for recur
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, bad config, unknown template or task)
//! - 4: Operation failed (storage, serialization, lock contention)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the recur CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for recur operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("No template or occurrence with id {0}")]
    NotFound(String),

    #[error("Invalid template id '{id}': {reason}")]
    InvalidTemplateId { id: String, reason: String },

    #[error("Occurrence {occurrence_id} does not belong to template {template_id}")]
    ForeignOccurrence {
        occurrence_id: String,
        template_id: String,
    },

    // Operation failures (exit code 4)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Task store has been disposed")]
    Disposed,

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::TemplateNotFound(_)
            | Error::NotFound(_)
            | Error::InvalidTemplateId { .. }
            | Error::ForeignOccurrence { .. } => exit_codes::USER_ERROR,

            // Operation failures
            Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_)
            | Error::Store(_)
            | Error::Disposed
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured details for machine-readable output
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::InvalidTemplateId { id, reason } => Some(serde_json::json!({
                "template_id": id,
                "reason": reason,
            })),
            Error::ForeignOccurrence {
                occurrence_id,
                template_id,
            } => Some(serde_json::json!({
                "occurrence_id": occurrence_id,
                "template_id": template_id,
            })),
            Error::NotFound(id) | Error::TemplateNotFound(id) => {
                Some(serde_json::json!({ "id": id }))
            }
            Error::InvalidConfig(message) => Some(serde_json::json!({ "message": message })),
            Error::LockFailed(path) => Some(serde_json::json!({
                "path": path.to_string_lossy(),
            })),
            _ => None,
        }
    }

    /// Whether the failure concerns the caller's input rather than storage
    pub fn is_user_error(&self) -> bool {
        self.exit_code() == exit_codes::USER_ERROR
    }
}

/// Result type alias for recur operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
            details: err.details(),
        }
    }
}
