// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! Asynchronous event delivery to user callbacks.
//!
//! All user callbacks run on one dedicated task, never on the engine loop,
//! so user code cannot stall the protocol. A panicking callback is caught,
//! counted and otherwise ignored. Once the connection closes the task goes
//! away and any further events are silently dropped.

use crate::engine::ConnectionState;
use crate::error::Error;
use crate::stats::Statistics;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;

const LOG_TARGET: &str = "natter-events";

/// An asynchronous happening on the connection, delivered to the listener
/// registered via [`crate::ConnectOptions::event_listener`].
///
/// Asynchronous errors travel separately, to the listener registered via
/// [`crate::ConnectOptions::error_listener`], on the same fan-out task.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// The connection moved to a new lifecycle state. Emitted for every
    /// transition, alongside the coarser events below.
    StateChange(ConnectionState),
    /// The initial connection was established.
    Connected,
    /// The connection to the server was lost; reconnecting follows if it is
    /// enabled.
    Disconnected,
    /// A replacement connection was established.
    Reconnected,
    /// All subscriptions were re-registered on the replacement connection.
    Resubscribed,
    /// The connection reached its terminal state.
    Closed,
    /// The server advertised an updated set of peer servers.
    DiscoveredServers(Vec<String>),
    /// The server announced it is entering lame duck mode and will shut
    /// down; applications may want to move away early.
    LameDuckMode,
    /// A consumer exceeded its pending limits and messages for it are being
    /// dropped. Emitted once per overflow episode, not once per message.
    SlowConsumer {
        /// The subscription whose consumer fell behind.
        sid: u64,
    },
}

/// Callback invoked with every [`Event`].
pub type EventCallback = Box<dyn FnMut(Event) + Send + 'static>;
/// Callback invoked with every asynchronous [`Error`].
pub type ErrorCallback = Box<dyn FnMut(&Error) + Send + 'static>;

/// What travels from the engine to the fan-out task.
#[derive(Debug)]
pub(crate) enum FanoutItem {
    Event(Event),
    Error(Error),
}

/// A cheap handle the engine uses to emit events; failures to deliver
/// (because the fan-out task is gone) are deliberately ignored.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<FanoutItem>,
}

impl EventSink {
    pub(crate) fn event(&self, event: Event) {
        let _ = self.tx.send(FanoutItem::Event(event));
    }

    pub(crate) fn error(&self, error: Error) {
        let _ = self.tx.send(FanoutItem::Error(error));
    }
}

/// Spawn the fan-out task, returning the sink the engine emits into.
pub(crate) fn spawn_fanout(
    mut event_cb: Option<EventCallback>,
    mut error_cb: Option<ErrorCallback>,
    stats: Arc<Statistics>,
) -> (EventSink, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let caught = match item {
                FanoutItem::Event(event) => {
                    tracing::debug!(target: LOG_TARGET, "event: {event:?}");
                    match &mut event_cb {
                        Some(cb) => catch_unwind(AssertUnwindSafe(|| cb(event))),
                        None => Ok(()),
                    }
                }
                FanoutItem::Error(error) => {
                    tracing::debug!(target: LOG_TARGET, "async error: {error}");
                    stats.add_error();
                    match &mut error_cb {
                        Some(cb) => catch_unwind(AssertUnwindSafe(|| cb(&error))),
                        None => Ok(()),
                    }
                }
            };
            if caught.is_err() {
                stats.add_callback_panic();
                tracing::warn!(target: LOG_TARGET, "a listener callback panicked; ignoring");
            }
        }
    });

    (EventSink { tx }, handle)
}
