// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! Connection statistics: cheap atomic counters kept by the engine and its
//! helper tasks, readable from any thread at any time.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters accumulated over the life of a connection, reconnects included.
#[derive(Debug, Default)]
pub struct Statistics {
    in_msgs: AtomicU64,
    out_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    reconnects: AtomicU64,
    dropped_messages: AtomicU64,
    requests_sent: AtomicU64,
    replies_received: AtomicU64,
    callback_panics: AtomicU64,
    errors: AtomicU64,
}

impl Statistics {
    /// Messages delivered to this client.
    pub fn in_msgs(&self) -> u64 {
        self.in_msgs.load(Ordering::Relaxed)
    }

    /// Frames written to the server.
    pub fn out_msgs(&self) -> u64 {
        self.out_msgs.load(Ordering::Relaxed)
    }

    /// Bytes read off the transport.
    pub fn in_bytes(&self) -> u64 {
        self.in_bytes.load(Ordering::Relaxed)
    }

    /// Bytes written to the transport.
    pub fn out_bytes(&self) -> u64 {
        self.out_bytes.load(Ordering::Relaxed)
    }

    /// Number of successful reconnects.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Messages dropped because a consumer exceeded its pending limits.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Requests published.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Request replies correlated back to their callers.
    pub fn replies_received(&self) -> u64 {
        self.replies_received.load(Ordering::Relaxed)
    }

    /// Panics caught in user callbacks.
    pub fn callback_panics(&self) -> u64 {
        self.callback_panics.load(Ordering::Relaxed)
    }

    /// Errors routed through the error listener.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) fn add_in_msg(&self) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_out_msg(&self) {
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_in_bytes(&self, n: u64) {
        self.in_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_out_bytes(&self, n: u64) {
        self.out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_request(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_reply(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_callback_panic(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}
