// TV3 Downloader - Catalog Sync and Media Download Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Error types for the TV3 download engine
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are grouped by the stage that raises them (catalog, transfer,
//! filesystem, external engine, configuration) so that callers can decide
//! whether to retry, skip, or report.
//!
//! ## Propagation Policy
//!
//! - Transport failures (`NetworkError`, `Timeout`, 5xx `ApiRequestFailed`) are
//!   retried locally with bounded attempts and backoff before surfacing.
//! - Everything else is surfaced immediately to the task or caller.
//! - `SizeMismatch` makes the transfer engine restart from offset zero; it
//!   only surfaces if the restarted transfer mismatches again.
//! - Only `InvalidConfiguration` (raised by `EngineConfig::validate` and
//!   `RunOptions::validate_outputs`) is process-fatal; once tasks start,
//!   failures are collected per task.

use std::path::Path;
use thiserror::Error;

/// Result type alias using our Tv3Error type
pub type Result<T> = std::result::Result<T, Tv3Error>;

/// Main error type for the download engine
#[derive(Error, Debug)]
pub enum Tv3Error {
    // ===== Catalog / API Errors =====

    /// Transport failure or timeout talking to a remote endpoint
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// No catalog data exists for the identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Response could not be decoded into the expected record shape
    #[error("Parse error: {message}")]
    ParseError {
        message: String,
        /// Response body snippet for debugging
        response_body: Option<String>,
    },

    /// Remote endpoint answered with a non-success status
    #[error("API request failed: {message}")]
    ApiRequestFailed {
        message: String,
        /// HTTP status code if available
        status_code: Option<u16>,
        /// Endpoint that failed
        endpoint: Option<String>,
    },

    /// API rate limiting (HTTP 429)
    #[error("API rate limit exceeded. Retry after {retry_after_seconds} seconds")]
    RateLimitExceeded {
        retry_after_seconds: u64,
        endpoint: String,
    },

    // ===== Transfer Errors =====

    /// Server-declared total size conflicts with the partial-state record
    #[error("Transfer size mismatch: expected {expected} bytes, server reports {actual} bytes")]
    SizeMismatch {
        expected: u64,
        actual: u64,
    },

    /// Stream ended before the declared size was reached
    #[error("Transfer incomplete: {written}/{expected} bytes")]
    IncompleteTransfer {
        written: u64,
        expected: u64,
    },

    /// Server rejected the requested byte range (HTTP 416)
    #[error("Range not satisfiable at offset {offset}")]
    RangeNotSatisfiable {
        offset: u64,
    },

    /// Another in-flight task already owns the destination path
    #[error("Target already owned by another transfer: {0}")]
    TargetInUse(String),

    /// Invalid download URL format or protocol
    #[error("Invalid download URL: {0}")]
    InvalidDownloadUrl(String),

    // ===== External Engine Errors =====

    /// External download engine exited abnormally
    #[error("{engine} failed: {message}")]
    EngineError {
        engine: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// External download engine binary could not be executed
    #[error("External download engine not found: {0}")]
    EngineNotFound(String),

    // ===== Filesystem Errors =====

    /// Cannot create, read, or write a destination, marker, cache, or export path
    #[error("Filesystem error at {path}: {message}")]
    FilesystemError {
        path: String,
        message: String,
    },

    // ===== Configuration / Input Errors =====

    /// Configuration is invalid or the environment cannot satisfy it
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ===== General Errors =====

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<std::num::ParseIntError> for Tv3Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Tv3Error::InvalidInput(format!("Failed to parse integer: {}", err))
    }
}

impl From<url::ParseError> for Tv3Error {
    fn from(err: url::ParseError) -> Self {
        Tv3Error::InvalidInput(format!("Invalid URL: {}", err))
    }
}

// Helper methods for creating common errors
impl Tv3Error {
    /// Create a NotFound error with a resource name
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Tv3Error::NotFound(resource.into())
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Tv3Error::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Tv3Error::InternalError(message.into())
    }

    /// Create an ApiRequestFailed error
    pub fn api_failed<S: Into<String>>(
        message: S,
        status_code: Option<u16>,
        endpoint: Option<String>,
    ) -> Self {
        Tv3Error::ApiRequestFailed {
            message: message.into(),
            status_code,
            endpoint,
        }
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        Tv3Error::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Create a ParseError
    pub fn parse_error<S: Into<String>>(message: S, response_body: Option<String>) -> Self {
        Tv3Error::ParseError {
            message: message.into(),
            response_body,
        }
    }

    /// Wrap an I/O failure with the path it happened on
    pub fn fs<P: AsRef<Path>>(path: P, err: std::io::Error) -> Self {
        Tv3Error::FilesystemError {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    /// Create an EngineError
    pub fn engine_failed<E: Into<String>, M: Into<String>>(
        engine: E,
        message: M,
        exit_code: Option<i32>,
    ) -> Self {
        Tv3Error::EngineError {
            engine: engine.into(),
            message: message.into(),
            exit_code,
        }
    }

    /// Check if error is retryable (network errors, timeouts, etc.)
    ///
    /// Returns `true` for transient errors that might succeed on retry:
    /// - Network errors marked as transient
    /// - Timeouts
    /// - 5xx API failures
    /// - Rate limiting
    /// - Streams that ended early (the next attempt resumes from the offset)
    pub fn is_retryable(&self) -> bool {
        match self {
            Tv3Error::NetworkError { is_transient, .. } => *is_transient,
            Tv3Error::Timeout(_)
            | Tv3Error::ApiRequestFailed { status_code: Some(500..=599), .. }
            | Tv3Error::RateLimitExceeded { .. }
            | Tv3Error::IncompleteTransfer { .. } => true,
            Tv3Error::ReqwestError(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            _ => false,
        }
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            Tv3Error::FilesystemError { .. } | Tv3Error::IoError(_) | Tv3Error::TargetInUse(_)
        )
    }

    /// Check if the error stops the whole run rather than a single task
    pub fn is_fatal(&self) -> bool {
        matches!(self, Tv3Error::InvalidConfiguration(_))
    }

    /// Get retry delay in seconds for retryable errors
    ///
    /// Returns `Some(seconds)` if the error includes retry timing information,
    /// `None` otherwise.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Tv3Error::RateLimitExceeded { retry_after_seconds, .. } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Get user-friendly error message suitable for a failure report
    pub fn user_message(&self) -> String {
        match self {
            Tv3Error::NotFound(what) => {
                format!("Nothing found in the catalog for '{}'.", what)
            }
            Tv3Error::EngineNotFound(binary) => {
                format!(
                    "External download engine '{}' is not installed or not in PATH.",
                    binary
                )
            }
            Tv3Error::EngineError { engine, exit_code: Some(code), .. } => {
                format!("{} exited with status {}. Run again to resume.", engine, code)
            }
            Tv3Error::IncompleteTransfer { written, expected } => {
                format!(
                    "Transfer stopped at {} of {} MB. Run again to resume.",
                    written / 1_000_000,
                    expected / 1_000_000
                )
            }
            Tv3Error::RateLimitExceeded { retry_after_seconds, .. } => {
                format!(
                    "The catalog is rate limiting requests. Wait {} seconds before trying again.",
                    retry_after_seconds
                )
            }
            Tv3Error::Cancelled => "Interrupted. Partial progress was saved.".to_string(),
            _ => self.to_string(),
        }
    }
}

// ===== IMPLEMENTATION NOTES =====
//
// ## Error Categories
//
// - **Catalog**: NetworkError, NotFound, ParseError, ApiRequestFailed, RateLimitExceeded
// - **Transfer**: SizeMismatch, IncompleteTransfer, RangeNotSatisfiable, TargetInUse
// - **External engine**: EngineError, EngineNotFound
// - **Filesystem**: FilesystemError, IoError
// - **Configuration**: InvalidConfiguration, InvalidInput
//
// ## Logging
//
// Log failures with structured fields so failure reports can be matched to log lines:
//
// ```rust
// if let Err(e) = operation().await {
//     tracing::warn!(error = %e, retryable = e.is_retryable(), path = %target.display(), "transfer failed");
// }
// ```
