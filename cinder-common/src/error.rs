//! The six-kind error taxonomy from the design spec. Every fallible
//! operation at a component boundary returns a [`Result`] whose error
//! carries exactly one [`ErrorKind`] plus a free-text reason; callers
//! must not parse the reason string.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The six error kinds. Ordering here is the severity/escalation order
/// used by `tracing` targets, not a priority a caller should rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request, unknown partition/feature, oversize key/value.
    /// Never retried.
    Validation,
    /// User not permitted, job exceeds partition limits, dependency
    /// unsatisfiable. Job transitions to FAILED.
    Policy,
    /// `NoFit`, `Busy`. Job stays PENDING and is retried next pass.
    TransientResource,
    /// Node `NO_RESPOND`, controller unreachable. Retried with backoff
    /// up to `max_retries` before being surfaced.
    Unavailable,
    /// Bad credential, protocol violation, barrier peer loss. Fatal
    /// for the affected step.
    Integrity,
    /// Invariant violation. Logged at ERROR, state reconciled, retried
    /// once; a second occurrence aborts the process.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Policy => "policy",
            ErrorKind::TransientResource => "transient_resource",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("{kind}: {reason}")]
pub struct Error {
    pub kind: ErrorKind,
    pub reason: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        reason: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            kind,
            reason: reason.into(),
            source: Some(source.into()),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, reason)
    }

    pub fn policy(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Policy, reason)
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientResource, reason)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, reason)
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, reason)
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::TransientResource | ErrorKind::Unavailable
        )
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let code = match err.kind {
            ErrorKind::Validation => tonic::Code::InvalidArgument,
            ErrorKind::Policy => tonic::Code::PermissionDenied,
            ErrorKind::TransientResource => tonic::Code::ResourceExhausted,
            ErrorKind::Unavailable => tonic::Code::Unavailable,
            ErrorKind::Integrity => tonic::Code::FailedPrecondition,
            ErrorKind::Internal => tonic::Code::Internal,
        };
        // The kind travels in the status message prefix so the client
        // library can reconstruct it without a custom metadata codec;
        // callers still must not parse it (see module docs).
        tonic::Status::new(code, format!("{}: {}", err.kind, err.reason))
    }
}
