use std::time::Duration;

use thiserror::Error;

use crate::retry::{Classify, ErrorKind};

/// The operation was dropped before it could settle.
///
/// This is the only error the layer itself produces. It is handed to callers when a queued batch
/// item is cleared, or when a shared execution died without producing an outcome. Caller error
/// types opt into receiving it by implementing `From<Cancelled>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// An error that happens when talking to the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The request never reached the remote, e.g. connection loss or DNS resolution.
    #[error("network error: {0}")]
    Network(String),
    /// The remote did not answer in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The remote answered with a non-success HTTP status.
    #[error("request failed with status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// The `Retry-After` the remote sent along, if any.
        retry_after: Option<Duration>,
    },
    /// The request was cancelled before completing.
    #[error("request cancelled")]
    Cancelled,
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl RequestError {
    /// Creates an error from a HTTP status code and the response body.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a `429 Too Many Requests` error that asks to wait `retry_after` before retrying.
    pub fn rate_limited(retry_after: Duration, message: impl Into<String>) -> Self {
        Self::Status {
            status: 429,
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }
}

impl From<Cancelled> for RequestError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl Classify for RequestError {
    fn kind(&self) -> ErrorKind {
        match self {
            RequestError::Network(_) => ErrorKind::Network,
            RequestError::Timeout(_) => ErrorKind::Timeout,
            RequestError::Status { status, .. } => ErrorKind::from_status(*status),
            RequestError::Cancelled | RequestError::Other(_) => ErrorKind::Unknown,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RequestError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Maps I/O error kinds onto failure kinds.
trait IoKindExt {
    fn classify_kind(&self) -> ErrorKind;
}

impl IoKindExt for std::io::ErrorKind {
    fn classify_kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;
        match self {
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::AddrNotAvailable
            | Io::BrokenPipe
            | Io::UnexpectedEof => ErrorKind::Network,
            Io::PermissionDenied => ErrorKind::Authorization,
            _ => ErrorKind::Unknown,
        }
    }
}

impl Classify for std::io::Error {
    fn kind(&self) -> ErrorKind {
        std::io::Error::kind(self).classify_kind()
    }
}

impl Classify for tokio::time::error::Elapsed {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        insta::assert_snapshot!(
            RequestError::from_status(503, "upstream unavailable").to_string(),
            @"request failed with status 503: upstream unavailable"
        );
        insta::assert_snapshot!(
            RequestError::Network("connection reset by peer".into()).to_string(),
            @"network error: connection reset by peer"
        );
        insta::assert_snapshot!(Cancelled.to_string(), @"operation cancelled");
    }

    #[test]
    fn test_request_error_kinds() {
        assert_eq!(RequestError::Network("dns".into()).kind(), ErrorKind::Network);
        assert_eq!(
            RequestError::Timeout(Duration::from_secs(5)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(RequestError::from_status(401, "").kind(), ErrorKind::Authentication);
        assert_eq!(RequestError::from_status(403, "").kind(), ErrorKind::Authorization);
        assert_eq!(RequestError::from_status(404, "").kind(), ErrorKind::Client);
        assert_eq!(RequestError::from_status(502, "").kind(), ErrorKind::Server);
        assert_eq!(RequestError::from(Cancelled).kind(), ErrorKind::Unknown);

        let limited = RequestError::rate_limited(Duration::from_secs(3), "slow down");
        assert_eq!(limited.kind(), ErrorKind::Server);
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(RequestError::from_status(429, "").retry_after(), None);
    }

    #[test]
    fn test_io_errors() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(Classify::kind(&refused), ErrorKind::Network);

        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(Classify::kind(&timed_out), ErrorKind::Timeout);

        let other = std::io::Error::other("disk on fire");
        assert_eq!(Classify::kind(&other), ErrorKind::Unknown);
    }
}
