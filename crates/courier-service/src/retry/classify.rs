use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The kind of failure an operation ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The remote could not be reached.
    Network,
    /// The remote did not answer in time.
    Timeout,
    /// The remote failed to process a valid request.
    Server,
    /// The request itself was rejected.
    Client,
    /// The caller is not authenticated.
    Authentication,
    /// The caller is authenticated but lacks permission.
    Authorization,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::Server,
        ErrorKind::Client,
        ErrorKind::Authentication,
        ErrorKind::Authorization,
        ErrorKind::Unknown,
    ];

    /// Maps a HTTP status code to the kind of failure it signals.
    ///
    /// `429 Too Many Requests` counts as a server failure, since the request itself was fine and
    /// may succeed once the remote has recovered.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::Server,
            400..=499 => ErrorKind::Client,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        }
    }

    /// Whether failures of this kind are worth retrying, absent any other policy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of classifying an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl From<ErrorKind> for Classification {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
        }
    }
}

/// Errors that can tell what kind of failure they represent.
///
/// Implement this for the error type of your producers to use them with the retry engine.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn classify(&self) -> Classification {
        Classification::from(self.kind())
    }

    /// The minimum time the remote asked to wait before the next attempt.
    ///
    /// This is the `Retry-After` of a rate limited response. The retry engine never waits less
    /// than this, even when its own backoff or cap would be shorter.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl<E: Classify + ?Sized> Classify for &E {
    fn kind(&self) -> ErrorKind {
        (**self).kind()
    }

    fn classify(&self) -> Classification {
        (**self).classify()
    }

    fn retry_after(&self) -> Option<Duration> {
        (**self).retry_after()
    }
}

impl<E: Classify + ?Sized> Classify for std::sync::Arc<E> {
    fn kind(&self) -> ErrorKind {
        (**self).kind()
    }

    fn classify(&self) -> Classification {
        (**self).classify()
    }

    fn retry_after(&self) -> Option<Duration> {
        (**self).retry_after()
    }
}

/// Classifies `error`.
pub fn classify<E: Classify + ?Sized>(error: &E) -> Classification {
    error.classify()
}
