//! Error types for the transport layer.

use std::io;
use std::time::Duration;

use crate::Method;

/// Errors that can occur while framing, parsing, or waiting for messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An I/O error occurred while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// A received line was not a valid protocol message.
    ///
    /// This is fatal to the connection: once a line fails to parse the stream
    /// must be assumed desynchronized.
    #[error("malformed message line: {0}")]
    Decode(#[source] serde_json::Error),

    /// Failed to serialize an outgoing message.
    #[error("failed to serialize outgoing message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A bounded wait for a specific method expired.
    #[error("no {method} received within {timeout:?}")]
    WaitTimeout {
        /// The method that was being waited for.
        method: Method,
        /// The bound that expired.
        timeout: Duration,
    },

    /// The remote host could not be resolved to a usable address.
    #[error("could not resolve host {0:?}")]
    HostResolve(String),

    /// No resolved address accepted the connection within the bound.
    #[error("could not connect to {host}:{port} within {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },
}
