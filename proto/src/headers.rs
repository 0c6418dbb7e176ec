// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The `NATS/1.0` header block codec.
//!
//! A header block is what travels between the `HMSG`/`HPUB` control line and
//! the payload: a status line `NATS/1.0[ <code> <text>]`, zero or more
//! `name: value` pairs, each line CRLF-terminated, and a final empty line.
//! The block length advertised on the control line counts every byte up to
//! and including that terminator.

use crate::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// The version prefix every header block starts with.
pub const HEADER_VERSION: &str = "NATS/1.0";

/// An inline status carried on the first line of a header block.
///
/// Status frames are how the server annotates otherwise ordinary messages:
/// `503` marks a request with no responders, and `100` frames carry the
/// control-plane heartbeats and flow-control requests used by layers above
/// the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Three-digit status code.
    pub code: u16,
    /// Free-form status text; may be empty.
    pub text: String,
}

impl Status {
    /// Status code used when a request reached no responders.
    pub const NO_RESPONDERS: u16 = 503;
    /// Status code used for control-plane frames.
    pub const CONTROL: u16 = 100;

    /// Create a new status.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Status { code, text: text.into() }
    }

    /// Whether this is a "no responders available" status.
    pub fn is_no_responders(&self) -> bool {
        self.code == Self::NO_RESPONDERS
    }

    /// Whether this is an idle-heartbeat control frame.
    pub fn is_idle_heartbeat(&self) -> bool {
        self.code == Self::CONTROL && self.text.eq_ignore_ascii_case("Idle Heartbeat")
    }

    /// Whether this is a flow-control request frame.
    pub fn is_flow_control(&self) -> bool {
        self.code == Self::CONTROL && self.text.eq_ignore_ascii_case("FlowControl Request")
    }

    /// Whether this frame belongs to the control plane rather than user data.
    pub fn is_control(&self) -> bool {
        self.is_idle_heartbeat() || self.is_flow_control()
    }
}

/// A set of message headers plus an optional inline status.
///
/// Names are multi-valued and kept in a canonical (lexicographic) order, so
/// that serializing and re-parsing a map yields an equal map regardless of
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    status: Option<Status>,
    entries: BTreeMap<String, Vec<String>>,
}

impl HeaderMap {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the map carries neither a status nor any header pairs.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.entries.is_empty()
    }

    /// Number of name/value pairs (a name with several values counts once
    /// per value).
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// The inline status, if any.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Set the inline status.
    pub fn set_status(&mut self, code: u16, text: impl Into<String>) {
        self.status = Some(Status::new(code, text));
    }

    /// Append a value for `name`, validating both against the wire grammar.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let name = name.into();
        let value = value.into();
        validate_name(&name)?;
        validate_value(&value)?;
        self.entries.entry(name).or_default().push(value);
        Ok(())
    }

    /// The first value recorded for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    /// Every value recorded for `name`.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove every value recorded for `name`, returning them.
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        self.entries.remove(name).unwrap_or_default()
    }

    /// Iterate over `(name, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
    }

    /// Serialize the block, terminator included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(HEADER_VERSION.as_bytes());
        if let Some(status) = &self.status {
            let mut itoa_buf = itoa::Buffer::new();
            buf.put_u8(b' ');
            buf.put_slice(itoa_buf.format(status.code).as_bytes());
            if !status.text.is_empty() {
                buf.put_u8(b' ');
                buf.put_slice(status.text.as_bytes());
            }
        }
        buf.put_slice(b"\r\n");
        for (name, value) in self.iter() {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Parse a complete header block, as delimited by the `HMSG` control
    /// line. The whole of `block` must be consumed.
    pub fn parse(block: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| ProtocolError::Headers("header block is not valid UTF-8"))?;
        let body = text
            .strip_suffix("\r\n\r\n")
            .ok_or(ProtocolError::Headers("header block missing terminator"))?;

        let mut lines = body.split("\r\n");
        let status_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(ProtocolError::Headers("header block missing status line"))?;
        let status = parse_status_line(status_line)?;

        let mut map = HeaderMap { status, entries: BTreeMap::new() };
        for line in lines {
            if line.is_empty() {
                return Err(ProtocolError::Headers("empty header line inside block"));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(ProtocolError::Headers("header line missing ':'"))?;
            map.insert(name.trim(), value.trim())?;
        }
        Ok(map)
    }
}

fn parse_status_line(line: &str) -> Result<Option<Status>, ProtocolError> {
    let rest = line
        .strip_prefix(HEADER_VERSION)
        .ok_or(ProtocolError::Headers("status line missing NATS/1.0 prefix"))?;
    let rest = rest.trim_matches([' ', '\t']);
    if rest.is_empty() {
        return Ok(None);
    }
    let (code, text) = match rest.split_once([' ', '\t']) {
        Some((code, text)) => (code, text.trim_matches([' ', '\t'])),
        None => (rest, ""),
    };
    let code = code
        .parse::<u16>()
        .map_err(|_| ProtocolError::Headers("status code is not a number"))?;
    Ok(Some(Status::new(code, text)))
}

fn validate_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::Headers("empty header name"));
    }
    let ok = name
        .bytes()
        .all(|c| c.is_ascii_graphic() && c != b':');
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::Headers("invalid character in header name"))
    }
}

fn validate_value(value: &str) -> Result<(), ProtocolError> {
    if value.bytes().any(|c| c == b'\r' || c == b'\n') {
        Err(ProtocolError::Headers("header value contains line break"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_empty() {
        assert_eq!(HeaderMap::new().encode(), Bytes::from_static(b"NATS/1.0\r\n\r\n"));
    }

    #[test]
    fn encode_with_status_and_pairs() {
        let mut headers = HeaderMap::new();
        headers.set_status(503, "");
        assert_eq!(headers.encode(), Bytes::from_static(b"NATS/1.0 503\r\n\r\n"));

        let mut headers = HeaderMap::new();
        headers.set_status(100, "Idle Heartbeat");
        headers.insert("Nats-Last-Consumer", "12").unwrap();
        assert_eq!(
            headers.encode(),
            Bytes::from_static(b"NATS/1.0 100 Idle Heartbeat\r\nNats-Last-Consumer: 12\r\n\r\n"),
        );
    }

    #[test]
    fn round_trip_is_canonical() {
        let mut a = HeaderMap::new();
        a.insert("zed", "1").unwrap();
        a.insert("alpha", "2").unwrap();
        a.insert("alpha", "3").unwrap();

        let mut b = HeaderMap::new();
        b.insert("alpha", "2").unwrap();
        b.insert("alpha", "3").unwrap();
        b.insert("zed", "1").unwrap();

        // Same canonical view regardless of insertion order.
        assert_eq!(a.encode(), b.encode());
        assert_eq!(HeaderMap::parse(&a.encode()).unwrap(), a);
    }

    #[test]
    fn parse_trims_and_collects_values() {
        let block = b"NATS/1.0\r\nFoo:  bar \r\nFoo: baz\r\n\r\n";
        let map = HeaderMap::parse(block).unwrap();
        assert_eq!(map.get("Foo"), Some("bar"));
        assert_eq!(map.get_all("Foo"), &["bar".to_owned(), "baz".to_owned()]);
    }

    #[test]
    fn parse_status_variants() {
        let map = HeaderMap::parse(b"NATS/1.0 503\r\n\r\n").unwrap();
        assert!(map.status().unwrap().is_no_responders());

        let map = HeaderMap::parse(b"NATS/1.0 100 FlowControl Request\r\n\r\n").unwrap();
        assert!(map.status().unwrap().is_flow_control());
        assert!(map.status().unwrap().is_control());

        let map = HeaderMap::parse(b"NATS/1.0\r\n\r\n").unwrap();
        assert!(map.status().is_none());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(HeaderMap::parse(b"HTTP/1.1 200 OK\r\n\r\n").is_err());
        assert!(HeaderMap::parse(b"NATS/1.0\r\nno-colon-here\r\n\r\n").is_err());
        assert!(HeaderMap::parse(b"NATS/1.0\r\nFoo: bar\r\n").is_err());
        assert!(HeaderMap::parse(b"NATS/1.0 abc\r\n\r\n").is_err());
    }

    #[test]
    fn insert_rejects_bad_names_and_values() {
        let mut map = HeaderMap::new();
        assert!(map.insert("", "v").is_err());
        assert!(map.insert("a:b", "v").is_err());
        assert!(map.insert("a b", "v").is_err());
        assert!(map.insert("ok", "line\r\nbreak").is_err());
        assert!(map.insert("ok", "value with spaces").is_ok());
    }
}
