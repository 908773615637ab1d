use std::io;

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

/// A broken internal invariant. Continuing would run on corrupted state, so it is
/// never recovered: see [`sink`].
#[derive(Error, Debug)]
#[error("sink: {0}")]
pub struct Sink(pub String);

/// Logs the broken invariant and unwinds. The agent launcher turns the unwind into a
/// process exit.
#[cold]
#[track_caller]
pub fn sink(message: impl Into<String>) -> ! {
    let sink = Sink(message.into());
    tracing::error!("{sink}");
    panic!("{sink}")
}

macro_rules! sink {
    ($($arg:tt)*) => {
        $crate::error::sink(format!($($arg)*))
    };
}

/// Malformed protocol input detected by a protocol handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("protocol error: {0}")]
pub struct ProtocolError(pub String);

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Application visible failure, answered to the client as a formatted response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

/// Failure raised by a ship while consuming bytes read from its rudder.
#[derive(Error, Debug)]
pub enum ShipError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The handler agreed to switch the connection to `protocol`. `rest` holds the
    /// bytes already read past the switch.
    #[error("protocol upgrade requested: {protocol}")]
    Upgrade { protocol: String, rest: Bytes },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "sink: write queue empty")]
    fn sink_unwinds_with_message() {
        sink!("write queue empty");
    }

    #[test]
    fn http_error_display() {
        let err = HttpError::service_unavailable("upstream gone");
        assert_eq!(err.to_string(), "503 Service Unavailable: upstream gone");
    }
}
