//! Types for error handling.
//!
//! Failures that happen while a request is in flight are never returned from
//! a function call. They are recorded as messages on the [`Reply`] or [`Item`]
//! they belong to and observed by polling. The [`Error`] type only covers
//! problems that prevent a request from being scheduled at all.
//!
//! [`Reply`]: crate::Reply
//! [`Item`]: crate::Item

use std::{error::Error as StdError, fmt, io};

/// All possible errors returned directly from the client API.
#[derive(Debug)]
pub enum Error {
    /// No I/O thread had room for the request before the deadline expired.
    QueueFull,

    /// The queue was stopped while waiting for room.
    Stopped,

    /// An I/O thread has terminated and can no longer accept work.
    IoThreadTerminated,

    /// A configuration value could not be parsed.
    InvalidConfig {
        /// Name of the offending parameter.
        name: &'static str,
        /// The value that was rejected.
        value: String,
    },

    /// The service could not be resolved into a set of servers.
    Discovery(io::Error),

    /// An unknown I/O error, for example when spawning an I/O thread.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::QueueFull => f.write_str("no room for the request in any I/O queue"),
            Error::Stopped => f.write_str("queue has been stopped"),
            Error::IoThreadTerminated => f.write_str("I/O thread terminated prematurely"),
            Error::InvalidConfig { name, value } => {
                write!(f, "invalid value '{}' for parameter {}", value, name)
            }
            Error::Discovery(e) => write!(f, "service discovery failed: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Discovery(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[doc(hidden)]
impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

/// A failure of the transport underneath a request.
///
/// Transport errors are always eligible for a retry. When the retry budget of
/// a request is exhausted, the `Display` form of the last error becomes the
/// error message of its reply.
#[derive(Debug)]
pub(crate) enum TransportError {
    /// Could not establish the TCP connection.
    Connect(io::Error),

    /// Reading from the connection failed.
    Read(io::Error),

    /// Writing to the connection failed.
    Write(io::Error),

    /// The server closed the connection.
    Disconnected,

    /// HTTP/2 protocol or session level failure.
    Http2(h2::Error),

    /// Could not build an HTTP request out of the request path.
    InvalidRequest(http::Error),

    /// The HTTP/2 session neither wants to read nor to write anymore.
    SessionClosed,

    /// The stream was closed by the peer with an error code.
    StreamClosed(h2::Reason),

    /// The request did not complete within the request timeout.
    Timeout,

    /// The connection was silent for longer than the reader timeout.
    ReadTimeout,

    /// The I/O thread is shutting down.
    Shutdown,

    /// No server of the service is known at the moment.
    NoServers,

    /// An unexpected failure inside the I/O thread.
    Internal(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "transport error: failed to connect - {}", e),
            TransportError::Read(e) => {
                write!(f, "transport error: failed to receive server reply - {}", e)
            }
            TransportError::Write(e) => {
                write!(f, "transport error: failed to submit request - {}", e)
            }
            TransportError::Disconnected => f.write_str("transport error: server disconnected"),
            TransportError::Http2(e) => write!(f, "http2 error: {}", e),
            TransportError::InvalidRequest(e) => write!(f, "error: invalid request ({})", e),
            TransportError::SessionClosed => f.write_str("http2 error: session closed"),
            TransportError::StreamClosed(reason) => {
                write!(f, "http2 error: {:?} ({})", reason, u32::from(*reason))
            }
            TransportError::Timeout => f.write_str("error: request timeout (timeout)"),
            TransportError::ReadTimeout => f.write_str("error: reader timeout (timeout)"),
            TransportError::Shutdown => f.write_str("error: shutdown is in process (shutdown)"),
            TransportError::NoServers => f.write_str("error: no servers available (discovery)"),
            TransportError::Internal(details) => write!(f, "error: {} (internal)", details),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TransportError::Connect(e) | TransportError::Read(e) | TransportError::Write(e) => {
                Some(e)
            }
            TransportError::Http2(e) => Some(e),
            TransportError::InvalidRequest(e) => Some(e),
            _ => None,
        }
    }
}

#[doc(hidden)]
impl From<h2::Error> for TransportError {
    fn from(error: h2::Error) -> TransportError {
        TransportError::Http2(error)
    }
}

#[doc(hidden)]
impl From<http::Error> for TransportError {
    fn from(error: http::Error) -> TransportError {
        TransportError::InvalidRequest(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Error: Send, Sync);
    static_assertions::assert_impl_all!(TransportError: Send, Sync);

    #[test]
    fn stream_close_reports_reason_and_code() {
        let error = TransportError::StreamClosed(h2::Reason::REFUSED_STREAM);

        assert_eq!(error.to_string(), "http2 error: REFUSED_STREAM (7)");
    }

    #[test]
    fn timeout_message() {
        assert_eq!(
            TransportError::Timeout.to_string(),
            "error: request timeout (timeout)"
        );
    }
}
