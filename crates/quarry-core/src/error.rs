// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the federation layer
//!
//! Backend-specific failures (sqlx, HTTP, RPC transport) are mapped to these
//! variants before they leave a handler or client, so callers only ever see
//! this taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all federation operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum FederationError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connectivity error: {message}")]
    Connectivity { message: String },

    #[error("Unsupported query construct: {construct}")]
    UnsupportedQuery { construct: String },

    #[error("Unknown column: {column}")]
    UnknownColumn { column: String },

    #[error("Backend unavailable after {attempts} attempt(s): {message}")]
    BackendUnavailable { attempts: u32, message: String },

    #[error("Query execution error: {message}")]
    Execution { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Handler not found: {name}")]
    HandlerNotFound { name: String },

    #[error("Unknown action: {action}")]
    UnknownAction { action: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FederationError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration { message: msg.into() }
    }

    /// Builds the error raised when mandatory connection fields are absent.
    pub fn missing_fields(handler: &str, fields: &[&str]) -> Self {
        Self::Configuration {
            message: format!(
                "{handler}: required connection parameters missing: {}",
                fields.join(", ")
            ),
        }
    }

    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity { message: msg.into() }
    }

    pub fn unsupported(construct: impl Into<String>) -> Self {
        Self::UnsupportedQuery {
            construct: construct.into(),
        }
    }

    pub fn unknown_column(column: impl Into<String>) -> Self {
        Self::UnknownColumn {
            column: column.into(),
        }
    }

    pub fn backend_unavailable(attempts: u32, msg: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            attempts,
            message: msg.into(),
        }
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution { message: msg.into() }
    }

    pub fn handler_not_found(name: impl Into<String>) -> Self {
        Self::HandlerNotFound { name: name.into() }
    }

    pub fn unknown_action(action: impl Into<String>) -> Self {
        Self::UnknownAction {
            action: action.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol { message: msg.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Errors that keep their type when crossing a handler boundary.
    ///
    /// Misconfiguration and malformed requests are raised before any I/O,
    /// so callers must be able to tell them apart from a failed query.
    /// Everything else is folded into an `ERROR` response.
    pub fn propagates_at_boundary(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::UnsupportedQuery { .. }
                | Self::UnknownColumn { .. }
                | Self::Validation { .. }
        )
    }

    /// True for failures that mean the backend connection is no longer usable.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Timeout { .. })
    }
}

/// Result type alias for federation operations
pub type FederationResult<T> = Result<T, FederationError>;
