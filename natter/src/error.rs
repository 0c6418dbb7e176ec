// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The error type surfaced by every fallible client operation.

use natter_proto::ProtocolError;

/// This encapsulates any errors that could be emitted by the client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection is closed; `Closed` is absorbing, so every call made
    /// afterwards reports this.
    #[error("connection closed")]
    ConnectionClosed,
    /// The operation needs a live server connection and there is none right
    /// now.
    #[error("not currently connected to a server")]
    NotConnected,
    /// The operation is not permitted while the connection is draining.
    #[error("operation not permitted while draining")]
    DrainInProgress,
    /// The payload exceeds the server-advertised maximum.
    #[error("payload of {size} bytes exceeds the server maximum of {max}")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// The server-advertised maximum.
        max: usize,
    },
    /// Headers were supplied but the connected server does not support them.
    #[error("the connected server does not support message headers")]
    HeadersUnsupported,
    /// A publish while reconnecting would overflow the reconnect buffer.
    #[error("reconnect buffer is full")]
    ReconnectBufferFull,
    /// The frame's control line exceeds the configured maximum.
    #[error("control line exceeds the maximum of {max} bytes")]
    ControlLineTooLong {
        /// The configured `max_control_line`.
        max: usize,
    },
    /// The operation did not complete within its time budget.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// Too many liveness pings went unanswered.
    #[error("stale connection: too many outstanding pings")]
    StaleConnection,
    /// A request was answered with a 503 status: nothing is subscribed to
    /// the subject it was sent to.
    #[error("no responders available for request")]
    NoResponders,
    /// The server rejected our credentials.
    #[error("authentication error: {0}")]
    Authentication(String),
    /// The same server rejected our credentials twice in a row; the
    /// reconnect loop gives up rather than spin against it.
    #[error("authentication to {0} failed twice; giving up")]
    DoubleAuth(String),
    /// An `-ERR` the server sent us that is not an authentication problem.
    #[error("server error: {0}")]
    ServerError(String),
    /// The byte stream violated the wire protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The server closed the stream in the middle of a frame.
    #[error("connection closed mid-frame")]
    UnexpectedEof,
    /// Bytes followed the initial INFO line in the same read.
    #[error("unexpected input after the initial INFO line")]
    StrayAfterInfo,
    /// An I/O error on the transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A server URL could not be parsed.
    #[error("invalid server URL '{0}'")]
    InvalidServerUrl(String),
    /// The server pool has no candidates left to try.
    #[error("no servers available for connection")]
    NoServers,
    /// The client was configured inconsistently.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The connected server cannot satisfy one of the requested options.
    #[error("server does not meet requirement: {0}")]
    UnsupportedServer(String),
}

impl Error {
    /// Whether the server-reported error text describes an authentication
    /// failure.
    ///
    /// The classifier is table-driven on purpose: the set of literals the
    /// server uses has grown before and may again.
    pub(crate) fn is_auth_error_text(text: &str) -> bool {
        const PREFIXES: &[&str] = &["user authentication"];
        const CONTAINED: &[&str] = &["authorization violation"];

        let lower = text.to_ascii_lowercase();
        PREFIXES.iter().any(|p| lower.starts_with(p))
            || CONTAINED.iter().any(|c| lower.contains(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_classifier() {
        assert!(Error::is_auth_error_text("User Authentication Failed"));
        assert!(Error::is_auth_error_text("user authentication expired"));
        assert!(Error::is_auth_error_text("Authorization Violation"));
        assert!(Error::is_auth_error_text("some Authorization Violation text"));

        assert!(!Error::is_auth_error_text("Slow Consumer Detected"));
        assert!(!Error::is_auth_error_text("Stale Connection"));
        assert!(!Error::is_auth_error_text("Maximum Payload Violation"));
    }
}
