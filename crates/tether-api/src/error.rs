//! Error types for the resource synchronization layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::ResourceName;

/// An application-level error reported by the server.
///
/// Carried in `{ "error": { "title", "message", "code" } }` bodies of 4xx
/// responses. The `code` selects a registered `handle_error` callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationError {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl std::fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.title, code, self.message),
            None => write!(f, "{}: {}", self.title, self.message),
        }
    }
}

/// Errors raised while composing a request descriptor.
///
/// These indicate programming mistakes at the call site and are never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Two option fragments both set the same scalar option.
    #[error("request option `{option}` set more than once for {resource}")]
    DuplicateOption {
        resource: ResourceName,
        option: &'static str,
    },

    /// A resource-specific completion hook required a parameter nobody supplied.
    #[error("request for {resource} is missing required parameter `{parameter}`")]
    MissingParameter {
        resource: ResourceName,
        parameter: &'static str,
    },
}

/// Errors raised while decomposing a response envelope.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The response body was not a JSON object.
    #[error("response envelope is not an object")]
    NotAnObject,

    /// A resource array held something other than objects.
    #[error("malformed {resource} record: {reason}")]
    MalformedRecord {
        resource: ResourceName,
        reason: String,
    },

    /// A `deleted`/`invalid` section was malformed.
    #[error("malformed `{section}` section: {reason}")]
    MalformedSection {
        section: &'static str,
        reason: String,
    },

    /// A record could not be constructed from its props.
    #[error("failed to construct {resource} record: {source}")]
    Construct {
        resource: ResourceName,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur when talking to the resource API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request composition failed.
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),

    /// Transport-level failure (network unreachable, connection reset).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The response could not be normalized into records.
    #[error("invalid response: {0}")]
    Normalize(#[from] NormalizeError),

    /// Unhandled application error, for callers that opted into raising.
    #[error("application error: {0}")]
    Application(ApplicationError),

    /// Server fault or a status the caller did not expect.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Anything else (e.g. a misbehaving in-memory transport).
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Whether this error came from the server rather than the caller.
    pub fn is_server_fault(&self) -> bool {
        matches!(self, ApiError::Server { status, .. } if *status >= 500)
    }
}
