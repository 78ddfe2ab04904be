//! Normalized handler responses

use serde::{Deserialize, Serialize};

use crate::error::{FederationError, FederationResult};
use crate::types::DataFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    Ok,
    Table,
    Error,
}

/// Result envelope returned by every handler operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerResponse {
    Ok,
    Table { data: DataFrame },
    Error { message: String },
}

impl HandlerResponse {
    pub fn table(data: DataFrame) -> Self {
        Self::Table { data }
    }

    /// Error response; an empty message is replaced so the payload is never blank.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "unknown backend error".to_string()
        } else {
            message
        };
        Self::Error { message }
    }

    pub fn kind(&self) -> ResponseKind {
        match self {
            Self::Ok => ResponseKind::Ok,
            Self::Table { .. } => ResponseKind::Table,
            Self::Error { .. } => ResponseKind::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn frame(&self) -> Option<&DataFrame> {
        match self {
            Self::Table { data } => Some(data),
            _ => None,
        }
    }

    pub fn into_frame(self) -> Option<DataFrame> {
        match self {
            Self::Table { data } => Some(data),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { message } => Some(message),
            _ => None,
        }
    }

    /// Applies the boundary policy to a handler result.
    ///
    /// Typed errors that callers must distinguish are returned as `Err`;
    /// every other failure is folded into an `ERROR` response.
    pub fn at_boundary(result: FederationResult<HandlerResponse>) -> FederationResult<Self> {
        match result {
            Ok(response) => Ok(response),
            Err(err) if err.propagates_at_boundary() => Err(err),
            Err(err) => Ok(Self::error(err.to_string())),
        }
    }
}

impl From<FederationError> for HandlerResponse {
    fn from(err: FederationError) -> Self {
        Self::error(err.to_string())
    }
}

/// Health-check result, separate from query responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub error_message: Option<String>,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
        }
    }
}
