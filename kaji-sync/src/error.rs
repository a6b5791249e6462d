//! Error types for kaji-sync.

use thiserror::Error;

use kaji_core::ConcurrencyToken;

/// Failure to get any response at all from the server.
///
/// `Clone` so stream errors can cross the reader-thread channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    /// The event stream endpoint answered with a non-2xx status.
    #[error("stream rejected with HTTP {0}")]
    Status(u16),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Flat classification of [`ApiError`], for callers that only branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    PreconditionRequired,
    PreconditionFailed,
    Unauthorized,
    Request,
    Transport,
    UnexpectedBody,
}

/// All errors surfaced by the conditional request client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A write was attempted with no concurrency token held (locally, before
    /// any network call) or the server answered 428.
    #[error("no concurrency token held; refresh team state before writing")]
    PreconditionRequired,

    /// Stale token: another member changed the team state first (409/412).
    #[error("team state changed; refresh and retry ({message})")]
    PreconditionFailed {
        status: u16,
        message: String,
        code: Option<String>,
        current_etag: Option<ConcurrencyToken>,
    },

    /// 401: the session is no longer valid.
    #[error("session is no longer valid: {message}")]
    Unauthorized { message: String },

    /// Any other non-2xx response.
    #[error("request failed ({status}): {message}")]
    Request {
        status: u16,
        message: String,
        code: Option<String>,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A 2xx response whose body is not JSON.
    #[error("unexpected response body (HTTP {status}): {source}")]
    UnexpectedBody {
        status: u16,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            ApiError::PreconditionRequired => ApiErrorKind::PreconditionRequired,
            ApiError::PreconditionFailed { .. } => ApiErrorKind::PreconditionFailed,
            ApiError::Unauthorized { .. } => ApiErrorKind::Unauthorized,
            ApiError::Request { .. } => ApiErrorKind::Request,
            ApiError::Transport(_) => ApiErrorKind::Transport,
            ApiError::UnexpectedBody { .. } => ApiErrorKind::UnexpectedBody,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::PreconditionFailed { status, .. }
            | ApiError::Request { status, .. }
            | ApiError::UnexpectedBody { status, .. } => Some(*status),
            ApiError::Unauthorized { .. } => Some(401),
            ApiError::PreconditionRequired | ApiError::Transport(_) => None,
        }
    }

    /// Server-supplied machine-readable code, e.g. `precondition_failed`.
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::PreconditionFailed { code, .. } | ApiError::Request { code, .. } => {
                code.as_deref()
            }
            _ => None,
        }
    }

    /// Whether the remedy is "refresh team state, then let the user retry".
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ApiError::PreconditionRequired | ApiError::PreconditionFailed { .. }
        )
    }
}

/// A push-channel payload that could not be understood. Always dropped.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("revision is missing, non-integral or not positive")]
    InvalidRevision,

    #[error("unknown event type '{0}'")]
    UnknownEvent(String),
}
