// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The message type handed to subscribers and request callers.

use bytes::Bytes;
use natter_proto::{HeaderMap, Status};

/// A message delivered by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The subject the message was published to.
    pub subject: String,
    /// The subject to reply on, when the publisher expects an answer.
    pub reply: Option<String>,
    /// Message headers, when the publisher attached any (or when the server
    /// synthesized a status frame).
    pub headers: Option<HeaderMap>,
    /// The payload.
    pub payload: Bytes,
    /// The id of the subscription this message was delivered to.
    pub sid: u64,
}

impl Message {
    /// The inline status attached by the server, if any.
    pub fn status(&self) -> Option<&Status> {
        self.headers.as_ref().and_then(HeaderMap::status)
    }

    /// Whether this is a server-synthesized "no responders" status frame.
    pub fn is_no_responders(&self) -> bool {
        self.status().is_some_and(Status::is_no_responders)
    }

    /// The number of payload bytes, as used for pending-byte accounting.
    pub(crate) fn size(&self) -> usize {
        self.payload.len()
    }
}
