//! Server and client errors.

use std::io;

use fixgw_protocol::{CodecError, ErrorCode};
use thiserror::Error;

/// Errors raised while running a netfix server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned by [`NetfixClient`](crate::NetfixClient) calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection is closed or was never established.
    #[error("Not connected")]
    NotConnected,

    /// Writing a request to the socket failed.
    #[error("Send failed: {0}")]
    SendFailed(#[source] io::Error),

    /// No matching reply arrived within the response timeout.
    #[error("No response to '{command}' within timeout")]
    ResponseTimeout { command: String },

    /// The server answered with an error code.
    #[error("Server rejected '{command}' with error {code}")]
    Protocol { command: String, code: ErrorCode },

    /// The server's reply could not be decoded.
    #[error("Malformed reply: {0}")]
    Malformed(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
