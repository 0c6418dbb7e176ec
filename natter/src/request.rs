// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The request/reply correlator's pending-request table.
//!
//! Every in-flight request is one entry: a response token mapped to the
//! oneshot that resolves the caller. An entry resolves exactly once: by a
//! reply, by a 503 cancellation, by the deadline sweep, or when the
//! connection closes.

use crate::error::Error;
use crate::message::Message;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) struct PendingRequest {
    pub(crate) reply: oneshot::Sender<Result<Message, Error>>,
    pub(crate) cancel_on_503: bool,
    pub(crate) deadline: Instant,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    map: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn insert(&mut self, token: String, pending: PendingRequest) {
        self.map.insert(token, pending);
    }

    /// Forget a request the caller gave up on.
    pub(crate) fn cancel(&mut self, token: &str) {
        self.map.remove(token);
    }

    /// Resolve the request `token` with `msg`. A 503 status cancels
    /// instead when the entry asked for that. Returns whether a pending
    /// entry was found.
    pub(crate) fn complete(&mut self, token: &str, msg: Message) -> bool {
        let Some(pending) = self.map.remove(token) else {
            return false;
        };
        let outcome = if pending.cancel_on_503 && msg.is_no_responders() {
            Err(Error::NoResponders)
        } else {
            Ok(msg)
        };
        let _ = pending.reply.send(outcome);
        true
    }

    /// Cancel every entry whose deadline has passed, reporting `Timeout`.
    pub(crate) fn sweep(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(pending) = self.map.remove(&token) {
                let _ = pending.reply.send(Err(Error::Timeout("request")));
            }
        }
    }

    /// Cancel everything, reporting `ConnectionClosed`.
    pub(crate) fn cancel_all(&mut self) {
        for (_token, pending) in self.map.drain() {
            let _ = pending.reply.send(Err(Error::ConnectionClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use natter_proto::HeaderMap;
    use std::time::Duration;

    fn reply_msg(no_responders: bool) -> Message {
        let headers = no_responders.then(|| {
            let mut h = HeaderMap::new();
            h.set_status(503, "");
            h
        });
        Message {
            subject: "_INBOX.x.token".to_owned(),
            reply: None,
            headers,
            payload: Bytes::from_static(b"pong"),
            sid: 1,
        }
    }

    fn pending(cancel_on_503: bool, ttl: Duration) -> (PendingRequest, oneshot::Receiver<Result<Message, Error>>) {
        let (tx, rx) = oneshot::channel();
        (PendingRequest { reply: tx, cancel_on_503, deadline: Instant::now() + ttl }, rx)
    }

    #[tokio::test]
    async fn reply_resolves_once() {
        let mut requests = PendingRequests::new();
        let (p, mut rx) = pending(true, Duration::from_secs(1));
        requests.insert("tok".to_owned(), p);

        assert!(requests.complete("tok", reply_msg(false)));
        assert_eq!(rx.try_recv().unwrap().unwrap().payload, Bytes::from_static(b"pong"));

        // A second reply for the same token finds nothing.
        assert!(!requests.complete("tok", reply_msg(false)));
    }

    #[tokio::test]
    async fn no_responders_cancels_when_asked() {
        let mut requests = PendingRequests::new();
        let (p, mut rx) = pending(true, Duration::from_secs(1));
        requests.insert("tok".to_owned(), p);
        assert!(requests.complete("tok", reply_msg(true)));
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::NoResponders)));

        // With the flag off the 503 frame is handed through as a reply.
        let (p, mut rx) = pending(false, Duration::from_secs(1));
        requests.insert("tok2".to_owned(), p);
        assert!(requests.complete("tok2", reply_msg(true)));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn sweep_expires_old_entries() {
        let mut requests = PendingRequests::new();
        let (expired, mut expired_rx) = pending(true, Duration::ZERO);
        let (alive, mut alive_rx) = pending(true, Duration::from_secs(60));
        requests.insert("old".to_owned(), expired);
        requests.insert("new".to_owned(), alive);

        requests.sweep(Instant::now() + Duration::from_millis(1));
        assert_eq!(requests.len(), 1);
        assert!(matches!(expired_rx.try_recv().unwrap(), Err(Error::Timeout(_))));
        assert!(alive_rx.try_recv().is_err()); // still pending, not resolved
        requests.cancel_all();
        assert!(matches!(alive_rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
    }
}
