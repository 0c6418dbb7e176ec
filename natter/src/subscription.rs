// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! Subscription records and the synchronous subscription handle.

use crate::client::Client;
use crate::dispatcher::{DispatcherShared, Job};
use crate::error::Error;
use crate::message::Message;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default cap on messages queued for one consumer.
pub const DEFAULT_MAX_PENDING_MSGS: i64 = 512 * 1024;
/// Default cap on bytes queued for one consumer.
pub const DEFAULT_MAX_PENDING_BYTES: i64 = 64 * 1024 * 1024;

/// A hook run before a message is queued for delivery; returning `false`
/// consumes the message silently. Layers above the core use this to
/// intercept control-plane frames (heartbeats, flow control) without them
/// ever reaching the application queue.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Handler invoked by a [`crate::Dispatcher`] for each delivered message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Per-subscription knobs beyond the subject.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub(crate) queue: Option<String>,
    pub(crate) max_pending_msgs: Option<i64>,
    pub(crate) max_pending_bytes: Option<i64>,
    pub(crate) filter: Option<MessageFilter>,
}

impl SubscribeOptions {
    /// Options with every knob at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a queue group: the server delivers each message to only one
    /// member of the group.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Cap the number of undelivered messages queued for this consumer;
    /// zero or negative disables the check. Defaults to
    /// [`DEFAULT_MAX_PENDING_MSGS`].
    pub fn max_pending_msgs(mut self, max: i64) -> Self {
        self.max_pending_msgs = Some(max);
        self
    }

    /// Cap the number of undelivered bytes queued for this consumer; zero
    /// or negative disables the check. Defaults to
    /// [`DEFAULT_MAX_PENDING_BYTES`].
    pub fn max_pending_bytes(mut self, max: i64) -> Self {
        self.max_pending_bytes = Some(max);
        self
    }

    /// Install a pre-queue filter.
    pub fn message_filter(mut self, filter: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("queue", &self.queue)
            .field("max_pending_msgs", &self.max_pending_msgs)
            .field("max_pending_bytes", &self.max_pending_bytes)
            .field("filter", &self.filter.as_ref().map(|_| "..."))
            .finish()
    }
}

/// State shared between a subscription's handle and the engine.
#[derive(Debug)]
pub(crate) struct SubShared {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue: Option<String>,
    max_pending_msgs: i64,
    max_pending_bytes: i64,
    pending_msgs: AtomicI64,
    pending_bytes: AtomicI64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    slow: AtomicBool,
}

impl SubShared {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        queue: Option<String>,
        max_pending_msgs: i64,
        max_pending_bytes: i64,
    ) -> Self {
        SubShared {
            sid,
            subject,
            queue,
            max_pending_msgs,
            max_pending_bytes,
            pending_msgs: AtomicI64::new(0),
            pending_bytes: AtomicI64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            slow: AtomicBool::new(false),
        }
    }

    /// Admit one message of `size` bytes into the pending queue, unless a
    /// limit would be exceeded.
    pub(crate) fn try_admit(&self, size: usize) -> bool {
        let over = (self.max_pending_msgs > 0
            && self.pending_msgs.load(Ordering::Acquire) + 1 > self.max_pending_msgs)
            || (self.max_pending_bytes > 0
                && self.pending_bytes.load(Ordering::Acquire) + size as i64
                    > self.max_pending_bytes);
        if over {
            return false;
        }
        self.pending_msgs.fetch_add(1, Ordering::AcqRel);
        self.pending_bytes.fetch_add(size as i64, Ordering::AcqRel);
        true
    }

    /// Undo the pending accounting once the consumer took the message.
    pub(crate) fn note_consumed(&self, size: usize) {
        let left = self.pending_msgs.fetch_sub(1, Ordering::AcqRel) - 1;
        self.pending_bytes.fetch_sub(size as i64, Ordering::AcqRel);
        if left <= 0 {
            // The overflow episode is over; the next one may fire again.
            self.slow.store(false, Ordering::Release);
        }
    }

    pub(crate) fn note_delivered(&self) -> u64 {
        self.delivered.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn note_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::AcqRel);
    }

    /// Latch the slow-consumer flag; true on the first overflow of an
    /// episode, which is when the event fires.
    pub(crate) fn mark_slow(&self) -> bool {
        !self.slow.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn invalidate(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn pending_msgs(&self) -> i64 {
        self.pending_msgs.load(Ordering::Acquire)
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Where the engine routes messages for one sid.
pub(crate) enum Sink {
    /// A synchronous subscription: messages queue until the holder of the
    /// [`Subscription`] pulls them.
    Sync {
        /// Producer half of the handle's queue.
        tx: mpsc::UnboundedSender<Message>,
    },
    /// A dispatched subscription: messages go to a dispatcher's queue and
    /// its delivery loop invokes the handler.
    Dispatched {
        /// The dispatcher's job queue.
        jobs: mpsc::UnboundedSender<Job>,
        /// The dispatcher's pending accounting.
        dispatcher: Arc<DispatcherShared>,
        /// The per-subscription handler.
        handler: MessageHandler,
    },
    /// The request correlator's wildcard inbox; replies are resolved inside
    /// the engine and never queue anywhere.
    Inbox,
}

/// One row of the subscription registry.
pub(crate) struct SubEntry {
    pub(crate) shared: Arc<SubShared>,
    pub(crate) sink: Sink,
    pub(crate) filter: Option<MessageFilter>,
    /// Total-delivered cutoff after which the subscription self-destructs.
    pub(crate) unsub_after: Option<u64>,
    pub(crate) draining: bool,
}

/// A synchronous subscription.
///
/// Implements [`Stream`]; alternatively pull messages with
/// [`Subscription::next`] or [`Subscription::next_timeout`]. Dropping the
/// handle unsubscribes lazily.
pub struct Subscription {
    shared: Arc<SubShared>,
    rx: mpsc::UnboundedReceiver<Message>,
    client: Client,
    explicit_unsub: bool,
}

impl Subscription {
    pub(crate) fn new(
        shared: Arc<SubShared>,
        rx: mpsc::UnboundedReceiver<Message>,
        client: Client,
    ) -> Self {
        Subscription { shared, rx, client, explicit_unsub: false }
    }

    /// The client-assigned subscription id.
    pub fn sid(&self) -> u64 {
        self.shared.sid
    }

    /// The subject pattern this subscription listens on.
    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    /// The queue group joined, if any.
    pub fn queue(&self) -> Option<&str> {
        self.shared.queue.as_deref()
    }

    /// Messages handed to this subscription so far.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered()
    }

    /// Messages dropped because this consumer fell behind its pending
    /// limits.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped()
    }

    /// Await the next message. `None` means the subscription ended:
    /// unsubscribed, reached its auto-unsubscribe cutoff, or the
    /// connection closed.
    pub async fn next(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await;
        if let Some(msg) = &msg {
            self.shared.note_consumed(msg.size());
        }
        msg
    }

    /// Await the next message for up to `timeout`. `Ok(None)` means the
    /// timeout elapsed (or the subscription ended normally); an
    /// invalidated subscription reports [`Error::ConnectionClosed`].
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, Error> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => {
                if self.shared.is_invalidated() {
                    Err(Error::ConnectionClosed)
                } else {
                    Ok(None)
                }
            }
            Ok(Some(msg)) => {
                self.shared.note_consumed(msg.size());
                Ok(Some(msg))
            }
        }
    }

    /// Unsubscribe now. Messages already queued locally are discarded with
    /// the handle.
    pub fn unsubscribe(mut self) -> Result<(), Error> {
        self.explicit_unsub = true;
        self.client.send_unsubscribe(self.shared.sid, None)
    }

    /// Unsubscribe once `max` messages in total have been delivered to
    /// this subscription; it keeps delivering until then.
    pub fn unsubscribe_after(&mut self, max: u64) -> Result<(), Error> {
        self.explicit_unsub = true;
        self.client.send_unsubscribe(self.shared.sid, Some(max))
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = futures::ready!(self.rx.poll_recv(cx));
        if let Some(msg) = &res {
            self.shared.note_consumed(msg.size());
        }
        Poll::Ready(res)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.shared.sid)
            .field("subject", &self.shared.subject)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.explicit_unsub {
            self.client.lazy_unsubscribe(self.shared.sid);
        }
    }
}

/// A handler-backed subscription created through a [`crate::Dispatcher`].
///
/// Unlike [`Subscription`], dropping this handle does not unsubscribe; the
/// handler keeps running until an explicit unsubscribe, a drain or close.
pub struct HandlerSubscription {
    shared: Arc<SubShared>,
    client: Client,
}

impl HandlerSubscription {
    pub(crate) fn new(shared: Arc<SubShared>, client: Client) -> Self {
        HandlerSubscription { shared, client }
    }

    /// The client-assigned subscription id.
    pub fn sid(&self) -> u64 {
        self.shared.sid
    }

    /// The subject pattern this subscription listens on.
    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    /// Messages handed to the handler so far.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered()
    }

    /// Messages dropped because the dispatcher fell behind.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped()
    }

    /// Stop the handler now.
    pub fn unsubscribe(self) -> Result<(), Error> {
        self.client.send_unsubscribe(self.shared.sid, None)
    }

    /// Stop the handler once `max` messages in total have been delivered.
    pub fn unsubscribe_after(&self, max: u64) -> Result<(), Error> {
        self.client.send_unsubscribe(self.shared.sid, Some(max))
    }
}

impl std::fmt::Debug for HandlerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSubscription")
            .field("sid", &self.shared.sid)
            .field("subject", &self.shared.subject)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_limits_admit_and_latch() {
        let shared = SubShared::new(1, "s".to_owned(), None, 2, 100);
        assert!(shared.try_admit(10));
        assert!(shared.try_admit(10));
        // Third message exceeds the count limit.
        assert!(!shared.try_admit(10));
        assert!(shared.mark_slow());
        // Only the first overflow of the episode reports.
        assert!(!shared.mark_slow());

        // Consuming everything ends the episode.
        shared.note_consumed(10);
        shared.note_consumed(10);
        assert!(shared.try_admit(10));
        assert!(shared.mark_slow());
    }

    #[test]
    fn byte_limit_applies() {
        let shared = SubShared::new(1, "s".to_owned(), None, 0, 25);
        assert!(shared.try_admit(20));
        assert!(!shared.try_admit(20));
        // A zero msg limit means the count is unbounded.
        for _ in 0..10_000 {
            assert!(shared.try_admit(0));
        }
    }
}
