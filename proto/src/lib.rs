// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! Wire framing for the NATS text-line protocol.
//!
//! This crate is the pure protocol layer used by `natter`: it knows how to
//! take bytes apart into server operations and how to put client operations
//! back together, and nothing else. There is no I/O here, no runtime and no
//! connection state, which keeps every piece of the framing testable against
//! byte fixtures.
//!
//! The pieces:
//!
//! - [`parser`]: an incremental parser turning a byte buffer into
//!   [`ServerOp`] frames (`INFO`, `MSG`/`HMSG`, `PING`, `PONG`, `+OK`,
//!   `-ERR`).
//! - [`op`]: the [`ClientOp`] serializer producing contiguous outgoing
//!   frames (`CONNECT`, `PUB`/`HPUB`, `SUB`, `UNSUB`, `PING`, `PONG`).
//! - [`headers`]: the `NATS/1.0` header block codec shared by `HMSG` and
//!   `HPUB`.
//! - [`subject`]: subject/queue grammar validation and wildcard matching.
//! - [`types`]: the JSON payloads carried by `INFO` and `CONNECT`.
//! - [`nuid`]: short globally-unique identifiers for inboxes and request
//!   tokens.

pub mod headers;
pub mod nuid;
pub mod op;
pub mod parser;
pub mod subject;
pub mod types;

// Expose the most common things at the top level:
pub use headers::{HeaderMap, Status};
pub use op::{ClientOp, Frame};
pub use parser::ServerOp;
pub use types::{ConnectInfo, ServerInfo};

/// This encapsulates the ways in which bytes can fail to be a valid protocol
/// exchange, in either direction.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The server sent an operation name we don't know about.
    #[error("protocol error: unknown server operation '{0}'")]
    UnknownOperation(String),
    /// A control line did not have the shape the operation requires.
    #[error("protocol error: malformed {op} line: {reason}")]
    BadControlLine {
        /// The operation whose control line was malformed.
        op: &'static str,
        /// What exactly was wrong with it.
        reason: &'static str,
    },
    /// A length-prefixed payload was not followed by CRLF.
    #[error("protocol error: payload not terminated by CRLF")]
    UnterminatedPayload,
    /// The JSON document carried by an `INFO` line could not be decoded.
    #[error("protocol error: malformed INFO payload: {0}")]
    Info(#[source] serde_json::Error),
    /// The `CONNECT` options could not be serialized to JSON.
    #[error("failed to serialize CONNECT options: {0}")]
    Connect(#[source] serde_json::Error),
    /// A header block violated the `NATS/1.0` grammar.
    #[error("protocol error: malformed header block: {0}")]
    Headers(&'static str),
    /// A subject (or subject pattern) violated the subject grammar.
    #[error("invalid subject '{0}'")]
    BadSubject(String),
    /// A queue group name violated the token grammar.
    #[error("invalid queue group name '{0}'")]
    BadQueueGroup(String),
}
