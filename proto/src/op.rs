// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! Serializer for the client side of the line protocol.
//!
//! Every [`ClientOp`] is encoded into one contiguous [`Frame`] up front, so
//! that a writer can account for backpressure in bytes and transmit frames
//! without interleaving.

use crate::headers::HeaderMap;
use crate::types::ConnectInfo;
use crate::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// An operation the client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    /// `CONNECT <json>`: the client's options and credentials.
    Connect(Box<ConnectInfo>),
    /// `PUB`/`HPUB`: publish a message.
    Publish {
        /// Subject to publish to.
        subject: String,
        /// Subject replies should be sent to, if any.
        reply: Option<String>,
        /// Headers; their presence selects the `HPUB` form.
        headers: Option<HeaderMap>,
        /// The message payload.
        payload: Bytes,
    },
    /// `SUB`: register interest in a subject.
    Subscribe {
        /// Client-assigned subscription id.
        sid: u64,
        /// Subject pattern to subscribe to.
        subject: String,
        /// Optional queue group to join.
        queue: Option<String>,
    },
    /// `UNSUB`: remove interest, immediately or after `max` more messages.
    Unsubscribe {
        /// The subscription to remove.
        sid: u64,
        /// When set, the server removes interest only after this many more
        /// deliveries.
        max: Option<u64>,
    },
    /// `PING`: probe the server; it answers `PONG`.
    Ping,
    /// `PONG`: answer a server `PING`.
    Pong,
}

/// A pre-serialized outgoing frame.
///
/// Carries its control-line length (CRLF excluded) so the writer can
/// enforce the configured control-line cap, and its total length for byte
/// accounting.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The complete frame, control line through trailing CRLF.
    pub bytes: Bytes,
    /// Length of the control line, excluding its CRLF.
    pub control_line_len: usize,
}

impl Frame {
    /// Total size of the frame in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the frame holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encode one operation into a frame.
pub fn encode(op: &ClientOp) -> Result<Frame, ProtocolError> {
    let mut buf = BytesMut::with_capacity(64);
    let mut itoa_buf = itoa::Buffer::new();

    let control_line_len = match op {
        ClientOp::Connect(info) => {
            let json = serde_json::to_vec(info).map_err(ProtocolError::Connect)?;
            buf.put_slice(b"CONNECT ");
            buf.put_slice(&json);
            buf.len()
        }
        ClientOp::Publish { subject, reply, headers, payload } => {
            match headers {
                None => {
                    buf.put_slice(b"PUB ");
                    buf.put_slice(subject.as_bytes());
                    buf.put_u8(b' ');
                    if let Some(reply) = reply {
                        buf.put_slice(reply.as_bytes());
                        buf.put_u8(b' ');
                    }
                    buf.put_slice(itoa_buf.format(payload.len()).as_bytes());
                    let control = buf.len();
                    buf.put_slice(b"\r\n");
                    buf.put_slice(payload);
                    return finish(buf, control);
                }
                Some(headers) => {
                    let block = headers.encode();
                    buf.put_slice(b"HPUB ");
                    buf.put_slice(subject.as_bytes());
                    buf.put_u8(b' ');
                    if let Some(reply) = reply {
                        buf.put_slice(reply.as_bytes());
                        buf.put_u8(b' ');
                    }
                    buf.put_slice(itoa_buf.format(block.len()).as_bytes());
                    buf.put_u8(b' ');
                    buf.put_slice(itoa_buf.format(block.len() + payload.len()).as_bytes());
                    let control = buf.len();
                    buf.put_slice(b"\r\n");
                    buf.put_slice(&block);
                    buf.put_slice(payload);
                    return finish(buf, control);
                }
            }
        }
        ClientOp::Subscribe { sid, subject, queue } => {
            buf.put_slice(b"SUB ");
            buf.put_slice(subject.as_bytes());
            buf.put_u8(b' ');
            if let Some(queue) = queue {
                buf.put_slice(queue.as_bytes());
                buf.put_u8(b' ');
            }
            buf.put_slice(itoa_buf.format(*sid).as_bytes());
            buf.len()
        }
        ClientOp::Unsubscribe { sid, max } => {
            buf.put_slice(b"UNSUB ");
            buf.put_slice(itoa_buf.format(*sid).as_bytes());
            if let Some(max) = max {
                buf.put_u8(b' ');
                buf.put_slice(itoa_buf.format(*max).as_bytes());
            }
            buf.len()
        }
        ClientOp::Ping => {
            buf.put_slice(b"PING");
            buf.len()
        }
        ClientOp::Pong => {
            buf.put_slice(b"PONG");
            buf.len()
        }
    };

    buf.put_slice(b"\r\n");
    Ok(Frame { bytes: buf.freeze(), control_line_len })
}

fn finish(mut buf: BytesMut, control_line_len: usize) -> Result<Frame, ProtocolError> {
    buf.put_slice(b"\r\n");
    Ok(Frame { bytes: buf.freeze(), control_line_len })
}
