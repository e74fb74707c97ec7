//! Error types for the SIS bridge resilience core.
//!
//! `SisApiError` is the structured failure shape handed to us by the HTTP
//! transport layer (which is an external collaborator). Everything the
//! classifier needs (status code, response headers, body) rides on it.
//! The remaining types are the crate's own failure taxonomy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// A failure reported by the underlying SIS API transport.
///
/// Constructed by the transport layer; this crate only classifies it.
/// Unrecognized or garbage responses belong in `Malformed`. The classifier
/// accepts every variant without panicking.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum SisApiError {
    /// Transport-level failure: connection refused, DNS resolution, TLS reset.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The request did not complete within the transport or caller deadline.
    #[error("Timeout after {timeout:?}: {message}")]
    Timeout { message: String, timeout: Duration },

    /// The server answered with a non-success HTTP status.
    #[error("HTTP {status} from SIS API")]
    Http {
        status: u16,
        headers: HashMap<String, String>,
        body: Option<String>,
    },

    /// The transport produced something we could not interpret at all.
    #[error("Malformed response: {detail}")]
    Malformed { detail: String },

    /// Anything else the transport chose to surface as a string.
    #[error("{0}")]
    Other(String),
}

impl SisApiError {
    /// Convenience constructor for an HTTP failure without headers or body.
    pub fn http_status(status: u16) -> Self {
        SisApiError::Http {
            status,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// The HTTP status code, when this failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            SisApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors raised by dead letter queue operations.
#[derive(Debug, Error)]
pub enum DlqError {
    /// The queue is at capacity and cannot accept another item.
    #[error("Queue is full: capacity {capacity}")]
    QueueFull { capacity: usize },

    /// No item with the given operation id exists in the queue.
    #[error("Operation {operation_id} not found in queue")]
    NotFound { operation_id: String },

    /// Reading or writing the durable snapshot failed.
    #[error("Storage error during {operation}: {reason}")]
    Storage { operation: String, reason: String },

    /// A persisted snapshot could not be decoded.
    #[error("Snapshot decode error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for DlqError {
    fn from(err: serde_json::Error) -> Self {
        DlqError::Decode(err.to_string())
    }
}

/// Result alias for dead letter queue operations.
pub type DlqResult<T> = Result<T, DlqError>;
