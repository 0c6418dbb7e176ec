// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! Incremental parser for the server side of the line protocol.
//!
//! [`try_parse`] inspects the front of a byte buffer and either lifts one
//! complete frame out of it, or reports that more bytes are needed. Bytes
//! are only consumed once a frame is complete, so a reader can simply
//! append whatever the transport produced and retry.

use crate::headers::HeaderMap;
use crate::types::ServerInfo;
use crate::ProtocolError;
use bytes::{Buf, Bytes, BytesMut};

/// A single frame produced by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    /// `INFO <json>`: the server hello, or a later topology update.
    Info(Box<ServerInfo>),
    /// `MSG`/`HMSG`: a delivered message.
    Msg {
        /// Subject the message was published to.
        subject: String,
        /// The subscription this message is delivered to.
        sid: u64,
        /// Subject to reply on, when the publisher asked for one.
        reply: Option<String>,
        /// Parsed header block, for `HMSG` frames.
        headers: Option<HeaderMap>,
        /// The message payload.
        payload: Bytes,
    },
    /// `PING`: the server probes liveness; expects `PONG` back.
    Ping,
    /// `PONG`: the server answers one of our pings.
    Pong,
    /// `+OK`: acknowledgement, only sent in verbose mode.
    Ok,
    /// `-ERR '<text>'`: a protocol or authorization error.
    Err(String),
}

/// Try to parse one frame off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// nothing is consumed in that case. Control-line tokens may be separated
/// by spaces or horizontal tabs (some protocol mocks use the latter).
pub fn try_parse(buf: &mut BytesMut) -> Result<Option<ServerOp>, ProtocolError> {
    let Some(line_end) = find_crlf(buf) else {
        return Ok(None);
    };

    let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| ProtocolError::BadControlLine {
        op: "control",
        reason: "line is not valid UTF-8",
    })?;
    let mut parts = line.split(is_separator).filter(|s| !s.is_empty());
    let op = parts.next().unwrap_or("");

    match op {
        "PING" => {
            buf.advance(line_end + 2);
            Ok(Some(ServerOp::Ping))
        }
        "PONG" => {
            buf.advance(line_end + 2);
            Ok(Some(ServerOp::Pong))
        }
        "+OK" => {
            buf.advance(line_end + 2);
            Ok(Some(ServerOp::Ok))
        }
        "-ERR" => {
            let text = line[4..].trim_matches(is_separator);
            let text = text
                .strip_prefix('\'')
                .and_then(|t| t.strip_suffix('\''))
                .unwrap_or(text)
                .to_owned();
            buf.advance(line_end + 2);
            Ok(Some(ServerOp::Err(text)))
        }
        "INFO" => {
            let json = line[4..].trim_matches(is_separator);
            if json.is_empty() {
                return Err(ProtocolError::BadControlLine {
                    op: "INFO",
                    reason: "missing JSON payload",
                });
            }
            let info: ServerInfo = serde_json::from_str(json).map_err(ProtocolError::Info)?;
            buf.advance(line_end + 2);
            Ok(Some(ServerOp::Info(Box::new(info))))
        }
        "MSG" => {
            // MSG <subject> <sid> [reply-to] <#bytes>
            let args: Vec<&str> = parts.collect();
            let (subject, sid, reply, len) = match args[..] {
                [subject, sid, len] => (subject, sid, None, len),
                [subject, sid, reply, len] => (subject, sid, Some(reply), len),
                _ => {
                    return Err(ProtocolError::BadControlLine {
                        op: "MSG",
                        reason: "wrong number of arguments",
                    });
                }
            };
            let sid = parse_u64(sid, "MSG", "subscription id is not a number")?;
            let payload_len = parse_usize(len, "MSG", "payload length is not a number")?;

            if buf.len() < line_end + 2 + payload_len + 2 {
                return Ok(None);
            }
            let subject = subject.to_owned();
            let reply = reply.map(str::to_owned);

            buf.advance(line_end + 2);
            let payload = buf.split_to(payload_len).freeze();
            consume_crlf(buf)?;
            Ok(Some(ServerOp::Msg { subject, sid, reply, headers: None, payload }))
        }
        "HMSG" => {
            // HMSG <subject> <sid> [reply-to] <#header-bytes> <#total-bytes>
            let args: Vec<&str> = parts.collect();
            let (subject, sid, reply, header_len, total_len) = match args[..] {
                [subject, sid, header_len, total_len] => {
                    (subject, sid, None, header_len, total_len)
                }
                [subject, sid, reply, header_len, total_len] => {
                    (subject, sid, Some(reply), header_len, total_len)
                }
                _ => {
                    return Err(ProtocolError::BadControlLine {
                        op: "HMSG",
                        reason: "wrong number of arguments",
                    });
                }
            };
            let sid = parse_u64(sid, "HMSG", "subscription id is not a number")?;
            let header_len = parse_usize(header_len, "HMSG", "header length is not a number")?;
            let total_len = parse_usize(total_len, "HMSG", "total length is not a number")?;
            let payload_len = total_len.checked_sub(header_len).ok_or(
                ProtocolError::BadControlLine {
                    op: "HMSG",
                    reason: "total length smaller than header length",
                },
            )?;

            if buf.len() < line_end + 2 + total_len + 2 {
                return Ok(None);
            }
            let subject = subject.to_owned();
            let reply = reply.map(str::to_owned);

            buf.advance(line_end + 2);
            let header_block = buf.split_to(header_len);
            let headers = HeaderMap::parse(&header_block)?;
            let payload = buf.split_to(payload_len).freeze();
            consume_crlf(buf)?;
            Ok(Some(ServerOp::Msg { subject, sid, reply, headers: Some(headers), payload }))
        }
        other => Err(ProtocolError::UnknownOperation(other.to_owned())),
    }
}

fn is_separator(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn consume_crlf(buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if buf.len() < 2 || &buf[..2] != b"\r\n" {
        return Err(ProtocolError::UnterminatedPayload);
    }
    buf.advance(2);
    Ok(())
}

fn parse_u64(s: &str, op: &'static str, reason: &'static str) -> Result<u64, ProtocolError> {
    s.parse().map_err(|_| ProtocolError::BadControlLine { op, reason })
}

fn parse_usize(s: &str, op: &'static str, reason: &'static str) -> Result<usize, ProtocolError> {
    s.parse().map_err(|_| ProtocolError::BadControlLine { op, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn buf(bytes: &[u8]) -> BytesMut {
        let mut b = BytesMut::new();
        b.put_slice(bytes);
        b
    }

    #[test]
    fn simple_ops() {
        let mut b = buf(b"PING\r\nPONG\r\n+OK\r\n");
        assert_eq!(try_parse(&mut b).unwrap(), Some(ServerOp::Ping));
        assert_eq!(try_parse(&mut b).unwrap(), Some(ServerOp::Pong));
        assert_eq!(try_parse(&mut b).unwrap(), Some(ServerOp::Ok));
        assert_eq!(try_parse(&mut b).unwrap(), None);
        assert!(b.is_empty());
    }

    #[test]
    fn err_line_strips_quotes() {
        let mut b = buf(b"-ERR 'Authorization Violation'\r\n");
        assert_eq!(
            try_parse(&mut b).unwrap(),
            Some(ServerOp::Err("Authorization Violation".to_owned())),
        );
    }

    #[test]
    fn info_parses_json() {
        let mut b = buf(br#"INFO {"server_id":"x","max_payload":512,"headers":true}"#);
        // No CRLF yet: incomplete.
        assert_eq!(try_parse(&mut b).unwrap(), None);
        b.put_slice(b"\r\n");
        let op = try_parse(&mut b).unwrap().unwrap();
        match op {
            ServerOp::Info(info) => {
                assert_eq!(info.server_id, "x");
                assert_eq!(info.max_payload, 512);
            }
            other => panic!("expected INFO, got {other:?}"),
        }
    }

    #[test]
    fn info_bad_json_is_an_error() {
        let mut b = buf(b"INFO {not json}\r\n");
        assert!(matches!(try_parse(&mut b), Err(ProtocolError::Info(_))));
    }

    #[test]
    fn msg_with_and_without_reply() {
        let mut b = buf(b"MSG foo 7 5\r\nhello\r\nMSG foo 7 reply.to 2\r\nhi\r\n");
        assert_eq!(
            try_parse(&mut b).unwrap(),
            Some(ServerOp::Msg {
                subject: "foo".to_owned(),
                sid: 7,
                reply: None,
                headers: None,
                payload: Bytes::from_static(b"hello"),
            }),
        );
        assert_eq!(
            try_parse(&mut b).unwrap(),
            Some(ServerOp::Msg {
                subject: "foo".to_owned(),
                sid: 7,
                reply: Some("reply.to".to_owned()),
                headers: None,
                payload: Bytes::from_static(b"hi"),
            }),
        );
    }

    #[test]
    fn msg_payload_may_contain_crlf() {
        let mut b = buf(b"MSG a 1 6\r\nab\r\ncd\r\n");
        assert_eq!(
            try_parse(&mut b).unwrap(),
            Some(ServerOp::Msg {
                subject: "a".to_owned(),
                sid: 1,
                reply: None,
                headers: None,
                payload: Bytes::from_static(b"ab\r\ncd"),
            }),
        );
    }

    #[test]
    fn msg_waits_for_full_payload() {
        let mut b = buf(b"MSG a 1 5\r\nhel");
        assert_eq!(try_parse(&mut b).unwrap(), None);
        assert_eq!(b.len(), 14);
        b.put_slice(b"lo\r\n");
        assert!(try_parse(&mut b).unwrap().is_some());
    }

    #[test]
    fn msg_missing_payload_terminator() {
        let mut b = buf(b"MSG a 1 2\r\nhiXX");
        assert!(matches!(try_parse(&mut b), Err(ProtocolError::UnterminatedPayload)));
    }

    #[test]
    fn tab_separated_control_lines() {
        let mut b = buf(b"MSG\tfoo\t9\t5\r\nhello\r\n");
        assert_eq!(
            try_parse(&mut b).unwrap(),
            Some(ServerOp::Msg {
                subject: "foo".to_owned(),
                sid: 9,
                reply: None,
                headers: None,
                payload: Bytes::from_static(b"hello"),
            }),
        );
    }

    #[test]
    fn hmsg_with_status_and_headers() {
        let header_block = b"NATS/1.0 503\r\n\r\n";
        let mut frame = Vec::new();
        frame.extend_from_slice(
            format!("HMSG _INBOX.x.y 3 {} {}\r\n", header_block.len(), header_block.len())
                .as_bytes(),
        );
        frame.extend_from_slice(header_block);
        frame.extend_from_slice(b"\r\n");

        let mut b = buf(&frame);
        let op = try_parse(&mut b).unwrap().unwrap();
        match op {
            ServerOp::Msg { sid, headers, payload, .. } => {
                assert_eq!(sid, 3);
                assert!(headers.unwrap().status().unwrap().is_no_responders());
                assert!(payload.is_empty());
            }
            other => panic!("expected HMSG, got {other:?}"),
        }
    }

    #[test]
    fn hmsg_with_payload() {
        let mut headers = HeaderMap::new();
        headers.insert("k", "v").unwrap();
        let block = headers.encode();
        let total = block.len() + 4;
        let mut frame = Vec::new();
        frame.extend_from_slice(format!("HMSG s 2 r {} {}\r\n", block.len(), total).as_bytes());
        frame.extend_from_slice(&block);
        frame.extend_from_slice(b"ping\r\n");

        let mut b = buf(&frame);
        match try_parse(&mut b).unwrap().unwrap() {
            ServerOp::Msg { reply, headers, payload, .. } => {
                assert_eq!(reply.as_deref(), Some("r"));
                assert_eq!(headers.unwrap().get("k"), Some("v"));
                assert_eq!(payload, Bytes::from_static(b"ping"));
            }
            other => panic!("expected HMSG, got {other:?}"),
        }
    }

    #[test]
    fn hmsg_total_shorter_than_headers() {
        let mut b = buf(b"HMSG s 2 16 4\r\n0123456789012345\r\n");
        assert!(matches!(
            try_parse(&mut b),
            Err(ProtocolError::BadControlLine { op: "HMSG", .. }),
        ));
    }

    #[test]
    fn unknown_op() {
        let mut b = buf(b"WAT is this\r\n");
        assert!(matches!(try_parse(&mut b), Err(ProtocolError::UnknownOperation(op)) if op == "WAT"));
    }
}
