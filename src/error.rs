//! Error types for the dataflow worker
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - Classification into recoverable, caller-attributable and fatal faults
//! - User-friendly suggestions and exit codes for the CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Reference errors (3xx)
    ReferenceUnavailable = 300,
    DoubleFetchFailure = 301,
    ErrorReference = 302,
    DecodeFailed = 303,

    // Request errors (4xx)
    MalformedRequest = 400,
    UnknownHandler = 401,
    ProtocolMalformed = 402,
    PackageKeyMissing = 403,

    // Execution errors (5xx)
    ComputationFault = 500,
    ExecutionAborted = 502,
    UnknownProgram = 503,

    // Coordinator errors (6xx)
    CoordinatorFailed = 600,

    // Internal errors (9xx)
    InternalError = 900,
    NotSupported = 902,
}

impl ErrorCode {
    /// Get the string code (e.g., "E300")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the worker
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Reference Errors
    // ─────────────────────────────────────────────────────────────

    /// The value behind a reference is not (yet) known to this worker
    #[error("Reference unavailable: {id}")]
    ReferenceUnavailable { id: String },

    /// A reference was still unavailable after one suspend/resume cycle
    #[error("Double failure trying to dereference {id}")]
    DoubleFetchFailure { id: String },

    /// The reference is an error marker produced upstream
    #[error("Reference {id} is an error marker: {reason}")]
    ErrorReference { id: String, reason: String },

    #[error("Failed to decode reference {id}: {message}")]
    Decode { id: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────

    /// A task or spawn request the caller got wrong
    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    #[error("No execution strategy registered for handler '{handler}'")]
    UnknownHandler { handler: String },

    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Package lookup for a key that is not configured
    #[error("Package key not found: {key}")]
    PackageKeyMissing { key: String },

    // ─────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────

    /// A user computation halted with a fault
    #[error("Computation in task {task_id} failed: {message}")]
    ComputationFault {
        task_id: String,
        message: String,
        trace: String,
    },

    #[error("Task {task_id} was aborted")]
    Aborted { task_id: String },

    #[error("Unknown program: {name}")]
    UnknownProgram { name: String },

    // ─────────────────────────────────────────────────────────────
    // Coordinator / Internal Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Coordinator error: {0}")]
    Coordinator(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::ReferenceUnavailable { .. } => ErrorCode::ReferenceUnavailable,
            Error::DoubleFetchFailure { .. } => ErrorCode::DoubleFetchFailure,
            Error::ErrorReference { .. } => ErrorCode::ErrorReference,
            Error::Decode { .. } => ErrorCode::DecodeFailed,

            Error::MalformedRequest { .. } => ErrorCode::MalformedRequest,
            Error::UnknownHandler { .. } => ErrorCode::UnknownHandler,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::PackageKeyMissing { .. } => ErrorCode::PackageKeyMissing,

            Error::ComputationFault { .. } => ErrorCode::ComputationFault,
            Error::Aborted { .. } => ErrorCode::ExecutionAborted,
            Error::UnknownProgram { .. } => ErrorCode::UnknownProgram,

            Error::Coordinator(_) => ErrorCode::CoordinatorFailed,
            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is recoverable by suspending and retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ReferenceUnavailable { .. }
                | Error::Io(_)
                | Error::IoRead { .. }
                | Error::Coordinator(_)
        )
    }

    /// Check if the fault is attributable to whoever built the request
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            Error::MalformedRequest { .. }
                | Error::UnknownHandler { .. }
                | Error::UnknownProgram { .. }
        )
    }

    /// Check if the error is fatal (worker should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Internal(_)
        )
    }

    /// Package lookups report a missing key distinctly so callers can default
    pub fn is_key_missing(&self) -> bool {
        matches!(self, Error::PackageKeyMissing { .. })
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'dataflow-worker config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'dataflow-worker config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::UnknownHandler { .. } => Some(
                "Run 'dataflow-worker handlers' to list the execution strategies this worker provides."
            ),
            Error::UnknownProgram { .. } => Some(
                "The script handler only runs programs compiled into this worker. Run 'dataflow-worker handlers'."
            ),
            Error::ProtocolMalformed { .. } | Error::Json(_) => Some(
                "Each input line must be a JSON object with a \"type\" field (EXECUTE_TASK, ABORT_TASK, STREAMS_DONE)."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    pub fn config_parse(message: impl Into<String>, source: Option<toml::de::Error>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source,
        }
    }

    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn unavailable(id: impl Into<String>) -> Self {
        Error::ReferenceUnavailable { id: id.into() }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedRequest {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    pub fn decode(id: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Decode {
            id: id.into(),
            message: message.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
