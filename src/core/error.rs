use std::time::Duration;

use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of a terminal-transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Which configured dimension a size violation was measured against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizeErrorKind {
    Request,
    Response,
    Stream,
}

impl std::fmt::Display for SizeErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Stream => "stream",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Build,
    Transport,
    Response,
    HttpStatus,
    SizeLimit,
    RetryExhausted,
    Timeout,
    DeadlineExceeded,
    RateLimited,
    Cancelled,
    TaskPanic,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Transport => "transport",
            Self::Response => "response",
            Self::HttpStatus => "http_status",
            Self::SizeLimit => "size_limit",
            Self::RetryExhausted => "retry_exhausted",
            Self::Timeout => "timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
            Self::TaskPanic => "task_panic",
        }
    }
}

/// Error type shared by the builder, the transports, every supplied
/// middleware, and the async layer.
///
/// The three phase variants (`Build`, `Transport`, `Response`) originate at
/// the request builder, the terminal transport, and the post-receive read
/// paths respectively. Middlewares only introduce their own kinds and never
/// re-tag errors surfacing from the inner round-trip.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request: {message}")]
    Build {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("transport: {message} ({kind})")]
    Transport {
        kind: TransportErrorKind,
        message: String,
        #[source]
        source: BoxError,
    },
    #[error("response: {message}")]
    Response {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("request failed with status {status} {status_text} for {uri}: {body}")]
    Status {
        status: u16,
        status_text: String,
        uri: String,
        body: String,
    },
    #[error("{kind} size {current} exceeds the maximum size of {max}")]
    Size {
        kind: SizeErrorKind,
        current: u64,
        max: u64,
    },
    #[error("request failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("request timed out: {source}")]
    Timeout {
        #[source]
        source: Box<Error>,
    },
    #[error("request timed out: deadline of {timeout_ms}ms exceeded")]
    DeadlineExceeded { timeout_ms: u128 },
    #[error("rate limit exceeded: {limit} requests per second, retry after {retry_after:?}")]
    RateLimitExceeded { limit: f64, retry_after: Duration },
    #[error("request cancelled")]
    Cancelled,
    #[error("panic in request task: {message}")]
    TaskPanic { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Build { .. } => ErrorCode::Build,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Response { .. } => ErrorCode::Response,
            Self::Status { .. } => ErrorCode::HttpStatus,
            Self::Size { .. } => ErrorCode::SizeLimit,
            Self::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimited,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::TaskPanic { .. } => ErrorCode::TaskPanic,
        }
    }

    pub(crate) fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn build_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Build {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn response(message: impl Into<String>) -> Self {
        Self::Response {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn response_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Response {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// True when the failure is classified as a timeout by the transport or
    /// by a per-call deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            } | Self::Timeout { .. }
                | Self::DeadlineExceeded { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Status code carried by a `Status` error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Walks the `RetryExhausted`/`Timeout` wrappers down to the error the
    /// final attempt produced.
    pub fn last_attempt_error(&self) -> &Error {
        match self {
            Self::RetryExhausted { source, .. } | Self::Timeout { source } => {
                source.last_attempt_error()
            }
            other => other,
        }
    }
}

/// Converts an `std::io::Error` surfacing from a body reader back into the
/// crate error. Counting guards smuggle a fully-formed `Error` through the
/// reader as the io error's inner payload; anything else is a read failure.
pub(crate) fn map_read_error(error: std::io::Error, message: &str) -> Error {
    match error.downcast::<Error>() {
        Ok(inner) => inner,
        Err(error) => Error::response_with(message.to_owned(), error),
    }
}
