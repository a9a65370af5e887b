//! Service error taxonomy.
//!
//! Every externally observable failure maps onto one of the status kinds
//! below; the HTTP layer translates them into response codes. Internal
//! plumbing uses [`anyhow`] and is absorbed by [`Status::Internal`] at the
//! boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Status {
    /// The named index is not known to the catalog.
    #[error("{0}")]
    NotFound(String),

    /// createIndex collision on an existing name.
    #[error("{0}")]
    AlreadyExists(String),

    /// The index is not in a state that permits the requested operation.
    #[error("{0}")]
    FailedPrecondition(String),

    /// Malformed client input, e.g. a vector of the wrong dimensionality.
    #[error("{0}")]
    InvalidArgument(String),

    /// The uploader budget is exhausted.
    #[error("{0}")]
    ResourceExhausted(String),

    /// The active mode does not support the operation.
    #[error("{0}")]
    PermissionDenied(String),

    /// The service is shut down, draining, or refusing in the current mode.
    #[error("{0}")]
    Unavailable(String),

    /// Unexpected failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Status {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Status::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Status::AlreadyExists(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Status::FailedPrecondition(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Status::InvalidArgument(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Status::ResourceExhausted(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Status::PermissionDenied(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Status::Unavailable(msg.into())
    }

    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            Status::NotFound(_) => "not_found",
            Status::AlreadyExists(_) => "already_exists",
            Status::FailedPrecondition(_) => "failed_precondition",
            Status::InvalidArgument(_) => "invalid_argument",
            Status::ResourceExhausted(_) => "resource_exhausted",
            Status::PermissionDenied(_) => "permission_denied",
            Status::Unavailable(_) => "unavailable",
            Status::Internal(_) => "internal",
        }
    }
}

pub type OpResult<T> = Result<T, Status>;
