//! Error taxonomy shared by the registry, importer and orchestrator.
//!
//! Every failure maps onto a coarse [`ErrorKind`] and an HTTP status so an
//! outer request layer can translate results without matching on variants.

use reqwest::StatusCode;
use thiserror::Error;

use crate::latency::ProbeError;
use crate::model::ConnectionState;
use crate::protocols::HandlerError;
use crate::store::StoreError;

/// Coarse error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, user-correctable.
    Validation,
    /// Unknown id.
    NotFound,
    /// Duplicate id, already connected, transition already in flight.
    Conflict,
    /// Handler-reported connect/disconnect failure.
    Protocol,
    /// Subscription or link decoding failure.
    Parse,
    /// Persistence I/O failure.
    Storage,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("already connected or connecting to a server")]
    AlreadyConnected,

    #[error("not connected to any server")]
    NotConnected,

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: ConnectionState,
    },

    #[error("connection attempt was cancelled by a disconnect request")]
    Cancelled,

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("no enabled servers available")]
    NoEnabledServers,

    #[error("{protocol} handler failed: {source}")]
    Protocol {
        protocol: String,
        #[source]
        source: HandlerError,
    },

    #[error("ping to server {id} failed: {source}")]
    Probe {
        id: String,
        #[source]
        source: ProbeError,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(#[source] StoreError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub(crate) fn server_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "server",
            id: id.into(),
        }
    }

    pub(crate) fn subscription_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "subscription",
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::NoEnabledServers => ErrorKind::Validation,
            Self::NotFound { .. } | Self::NotConnected => ErrorKind::NotFound,
            Self::DuplicateId(_)
            | Self::AlreadyConnected
            | Self::InvalidTransition { .. }
            | Self::Cancelled => ErrorKind::Conflict,
            Self::UnsupportedProtocol(_) | Self::Protocol { .. } | Self::Probe { .. } => {
                ErrorKind::Protocol
            }
            Self::Parse(_) => ErrorKind::Parse,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Status an HTTP layer should answer with for this error.
    ///
    /// `NotConnected` is a bad request rather than a 404: the caller asked to
    /// disconnect nothing. Duplicate ids are reported as validation failures,
    /// and so are parse failures: the link or feed URL came from the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation(_)
            | Self::DuplicateId(_)
            | Self::NotConnected
            | Self::NoEnabledServers
            | Self::Parse(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyConnected | Self::InvalidTransition { .. } | Self::Cancelled => {
                StatusCode::CONFLICT
            }
            Self::UnsupportedProtocol(_)
            | Self::Protocol { .. }
            | Self::Probe { .. }
            | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey(id) => Self::DuplicateId(id),
            StoreError::MissingKey { collection, id } => Self::NotFound {
                kind: collection,
                id,
            },
            other => Self::Storage(other),
        }
    }
}
