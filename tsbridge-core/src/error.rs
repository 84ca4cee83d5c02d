//! Error taxonomy shared by the query model, the capability gate and drivers.
//!
//! Construction and compilation failures are returned to the caller
//! immediately. Transport failures never show up here: adapters fold them
//! into a failed [`CommandResponse`](crate::connection::CommandResponse) so a
//! batch of independent queries can report partial failure.

use crate::query::Query;
use thiserror::Error;

/// Errors raised by the core and its drivers.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input to a value-object constructor.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Fields are jointly insufficient to resolve a range, query or connection.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The target driver does not declare a capability the query needs.
    #[error("unsupported operation: driver does not support {feature}")]
    UnsupportedOperation {
        /// Capability flag (or feature name) that was missing
        feature: String,
    },

    /// A command was attempted while the adapter was disconnected.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The transport failed outside of a command round-trip.
    #[error("transport error: {0}")]
    Transport(String),

    /// Compilation failed; carries the offending query for diagnostics.
    #[error("query error: {message}")]
    Query {
        /// What went wrong
        message: String,
        /// The query that failed to compile
        query: Box<Query>,
    },
}

impl Error {
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            feature: feature.into(),
        }
    }

    pub fn query(message: impl Into<String>, query: &Query) -> Self {
        Error::Query {
            message: message.into(),
            query: Box::new(query.clone()),
        }
    }

    /// Returns the query attached to a compilation failure.
    pub fn offending_query(&self) -> Option<&Query> {
        match self {
            Error::Query { query, .. } => Some(query.as_ref()),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
