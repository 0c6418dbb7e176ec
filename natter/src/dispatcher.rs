// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! Dispatchers: delivery loops for handler-based subscriptions.
//!
//! A dispatcher owns one task and one queue; any number of subscriptions
//! can be multiplexed onto it. Within one dispatcher, messages are handed
//! to handlers strictly in queue order (interleaved across subscriptions);
//! separate dispatchers run independently.

use crate::message::Message;
use crate::stats::Statistics;
use crate::subscription::MessageHandler;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const LOG_TARGET: &str = "natter-dispatcher";

/// One unit of work for a dispatcher: a message paired with its
/// subscription's handler.
pub(crate) struct Job {
    pub(crate) handler: MessageHandler,
    pub(crate) message: Message,
}

/// Pending-queue accounting shared between the engine (producer side) and
/// the dispatcher loop (consumer side).
#[derive(Debug)]
pub(crate) struct DispatcherShared {
    max_pending_msgs: i64,
    max_pending_bytes: i64,
    pending_msgs: AtomicI64,
    pending_bytes: AtomicI64,
    dropped: AtomicU64,
    slow: AtomicBool,
}

impl DispatcherShared {
    fn new(max_pending_msgs: i64, max_pending_bytes: i64) -> Self {
        DispatcherShared {
            max_pending_msgs,
            max_pending_bytes,
            pending_msgs: AtomicI64::new(0),
            pending_bytes: AtomicI64::new(0),
            dropped: AtomicU64::new(0),
            slow: AtomicBool::new(false),
        }
    }

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

    fn note_consumed(&self, size: usize) {
        let left = self.pending_msgs.fetch_sub(1, Ordering::AcqRel) - 1;
        self.pending_bytes.fetch_sub(size as i64, Ordering::AcqRel);
        if left <= 0 {
            self.slow.store(false, Ordering::Release);
        }
    }

    pub(crate) fn note_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_slow(&self) -> bool {
        !self.slow.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn pending_msgs(&self) -> i64 {
        self.pending_msgs.load(Ordering::Acquire)
    }
}

/// A delivery loop for handler-based subscriptions, created with
/// [`crate::Client::dispatcher`].
///
/// The loop runs as long as this handle (or a clone) is alive; keep it
/// around for as long as its subscriptions should deliver.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    id: String,
    jobs: mpsc::UnboundedSender<Job>,
    shared: Arc<DispatcherShared>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub(crate) fn spawn(
        max_pending_msgs: i64,
        max_pending_bytes: i64,
        stats: Arc<Statistics>,
    ) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let shared = Arc::new(DispatcherShared::new(max_pending_msgs, max_pending_bytes));
        let id = natter_proto::nuid::next();

        let loop_shared = shared.clone();
        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let size = job.message.size();
                let handler = job.handler;
                let message = job.message;
                if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    stats.add_callback_panic();
                    tracing::warn!(target: LOG_TARGET, "a message handler panicked; ignoring");
                }
                // Consumed only once the handler returned: a drain must not
                // consider the message done while it is still being handled.
                loop_shared.note_consumed(size);
            }
        });

        Dispatcher { inner: Arc::new(DispatcherInner { id, jobs, shared, task }) }
    }

    /// The dispatcher's unique id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Messages dropped because this dispatcher's queue was over its
    /// pending limits.
    pub fn dropped(&self) -> u64 {
        self.inner.shared.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn jobs(&self) -> mpsc::UnboundedSender<Job> {
        self.inner.jobs.clone()
    }

    pub(crate) fn shared(&self) -> Arc<DispatcherShared> {
        self.inner.shared.clone()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("id", &self.inner.id).finish_non_exhaustive()
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.task.abort();
    }
}
