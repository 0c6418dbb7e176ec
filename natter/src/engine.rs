// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The connection engine: a background task owning the transport, the
//! subscription registry, the writer and the request correlator.
//!
//! Client handles talk to the engine over an unbounded command channel and
//! get answers back through oneshots; the engine talks to the server
//! through one framed connection at a time. All state transitions happen
//! here, on one task, which is what makes the state machine race-free.

use crate::connection::Connection;
use crate::error::Error;
use crate::events::{Event, EventSink};
use crate::message::Message;
use crate::options::{Auth, ConnectOptions, ReconnectDelayHandler};
use crate::pool::{ServerAddr, ServerPool};
use crate::request::{PendingRequest, PendingRequests};
use crate::stats::Statistics;
use crate::subscription::{Sink, SubEntry};
use crate::transport::Transport;
use crate::writer::Writer;
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use natter_proto::op::{self, ClientOp, Frame};
use natter_proto::parser::ServerOp;
use natter_proto::types::{ConnectInfo, ServerInfo};
use natter_proto::HeaderMap;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

const LOG_TARGET: &str = "natter-engine";

/// Where the connection is in its lifecycle. `Closed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no attempt in progress.
    Disconnected,
    /// An attempt to reach a server is in progress.
    Connecting,
    /// One live transport to one server.
    Connected,
    /// The transport was lost and replacement attempts are being made.
    Reconnecting,
    /// Terminal: every subsequent operation fails with
    /// [`Error::ConnectionClosed`].
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// State shared between client handles and the engine. Everything here is
/// readable without locking; only the engine mutates the status fields.
pub(crate) struct Shared {
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) info: ArcSwapOption<ServerInfo>,
    pub(crate) connected_url: ArcSwapOption<String>,
    pub(crate) stats: Arc<Statistics>,
    /// Bytes of user publishes reserved/buffered while no server is
    /// reachable.
    pub(crate) buffered_bytes: AtomicUsize,
    /// Set once a drain has delivered everything; publishes then fail.
    pub(crate) publish_blocked: AtomicBool,
    /// Set as soon as a drain starts; new subscriptions and requests then
    /// fail.
    pub(crate) draining: AtomicBool,
    pub(crate) next_sid: AtomicU64,
    /// `<inbox_prefix>.<nuid>`: the base of this connection's request
    /// inbox; requests reply to `<base>.<token>`.
    pub(crate) request_inbox_prefix: String,
    /// The configured inbox prefix, for fresh user inboxes.
    pub(crate) user_inbox_prefix: String,
    pub(crate) client_side_limit_checks: bool,
    pub(crate) max_control_line: usize,
    pub(crate) reconnect_buffer_size: i64,
    pub(crate) default_request_timeout: Duration,
    pub(crate) old_request_style: bool,
    pub(crate) cancel_on_503: bool,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Reserve room in the reconnect buffer for one more user frame.
    pub(crate) fn try_reserve_reconnect_bytes(&self, len: usize) -> Result<(), Error> {
        if self.reconnect_buffer_size < 0 {
            self.buffered_bytes.fetch_add(len, Ordering::AcqRel);
            return Ok(());
        }
        let budget = self.reconnect_buffer_size as usize;
        self.buffered_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current.saturating_add(len) <= budget).then(|| current + len)
            })
            .map(|_| ())
            .map_err(|_| Error::ReconnectBufferFull)
    }
}

/// What client handles ask of the engine.
pub(crate) enum Command {
    Publish {
        frame: Frame,
        /// Whether the publishing thread already added the frame to the
        /// reconnect-buffer accounting.
        prereserved: bool,
    },
    Subscribe {
        entry: SubEntry,
    },
    Unsubscribe {
        sid: u64,
        /// `None` unsubscribes now; `Some(n)` once `n` messages in total
        /// have been delivered.
        after: Option<u64>,
    },
    Request {
        token: String,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
        deadline: Instant,
        reply: oneshot::Sender<Result<Message, Error>>,
    },
    CancelRequest {
        token: String,
    },
    Flush {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    ForceReconnect,
    Drain {
        timeout: Duration,
        reply: oneshot::Sender<Result<bool, Error>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

enum PongWaiter {
    /// A liveness ping sent by the timer.
    Ping,
    /// A user flush awaiting its round trip.
    Flush(oneshot::Sender<Result<(), Error>>),
    /// The drain sequence awaiting confirmation that the server processed
    /// our unsubscribes.
    Drain,
}

struct DrainState {
    deadline: Instant,
    waiters: Vec<oneshot::Sender<Result<bool, Error>>>,
    /// True once the post-unsubscribe flush round-tripped; only then can
    /// the pending queues be judged empty.
    flushed: bool,
}

/// Why the connected loop ended.
enum Exit {
    Closed,
    Disconnected(Option<Error>),
}

type Flow = Result<(), Exit>;

fn io_exit(err: std::io::Error) -> Exit {
    Exit::Disconnected(Some(err.into()))
}

pub(crate) struct Engine {
    opts: ConnectOptions,
    shared: Arc<Shared>,
    events: EventSink,
    pool: ServerPool,
    subs: HashMap<u64, SubEntry>,
    requests: PendingRequests,
    inbox_sid: Option<u64>,
    writer: Writer,
    connection: Option<Connection>,
    pong_waiters: VecDeque<PongWaiter>,
    outstanding_pings: u32,
    traffic: bool,
    drain: Option<DrainState>,
    total_tries: u64,
    /// Whether the current (or last) transport was secure; selects the
    /// jitter distribution.
    secure: bool,
}

impl Engine {
    pub(crate) fn new(
        opts: ConnectOptions,
        shared: Arc<Shared>,
        events: EventSink,
    ) -> Result<Self, Error> {
        let pool = ServerPool::new(
            &opts.servers,
            opts.randomize,
            opts.ignore_discovered,
            opts.max_reconnects,
        )?;
        Ok(Engine {
            opts,
            shared,
            events,
            pool,
            subs: HashMap::new(),
            requests: PendingRequests::new(),
            inbox_sid: None,
            writer: Writer::new(),
            connection: None,
            pong_waiters: VecDeque::new(),
            outstanding_pings: 0,
            traffic: false,
            drain: None,
            total_tries: 0,
            secure: false,
        })
    }

    /// Whether a failed first connect should be treated as a recoverable
    /// disconnect.
    pub(crate) fn retry_initial(&self) -> bool {
        self.opts.reconnect_on_initial_connect && self.reconnect_allowed()
    }

    pub(crate) fn enter_reconnecting(&self) {
        self.transition(ConnectionState::Reconnecting);
    }

    /// Move the state machine, publishing the new state to status readers
    /// and emitting a [`Event::StateChange`] when it actually changed.
    fn transition(&self, state: ConnectionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            self.events.event(Event::StateChange(state));
        }
    }

    fn reconnect_allowed(&self) -> bool {
        self.opts.max_reconnects != 0
    }

    /// Try every candidate once, for the initial `connect()` call.
    pub(crate) async fn initial_connect(&mut self) -> Result<(), Error> {
        let candidates = self.pool.candidates();
        let mut last_err = Error::NoServers;
        for addr in candidates {
            self.total_tries += 1;
            self.transition(ConnectionState::Connecting);
            match self.try_connect(&addr).await {
                Ok(conn) => {
                    self.finish_connect(conn, addr, false);
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(target: LOG_TARGET, "connect to {addr} failed: {err}");
                    let auth_text = auth_error_text(&err);
                    self.pool.record_failure(&addr, auth_text.as_deref());
                    last_err = err;
                }
            }
        }
        self.transition(ConnectionState::Disconnected);
        Err(last_err)
    }

    /// The engine task: alternates between the connected loop and the
    /// reconnect loop until something closes the connection.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            if self.connection.is_some() {
                match self.run_connected(&mut commands).await {
                    Exit::Closed => break,
                    Exit::Disconnected(err) => {
                        self.handle_disconnect(err);
                        if let Some(drain) = self.drain.take() {
                            // A drain cannot survive losing the server;
                            // close and report it incomplete.
                            self.shutdown_common();
                            for waiter in drain.waiters {
                                let _ = waiter.send(Ok(false));
                            }
                            break;
                        }
                        if !self.reconnect_allowed() {
                            self.shutdown_common();
                            break;
                        }
                        self.transition(ConnectionState::Reconnecting);
                    }
                }
            } else if !self.run_reconnecting(&mut commands).await {
                break;
            }
        }
        tracing::debug!(target: LOG_TARGET, "engine task finished");
    }

    // ---- connected ----

    async fn run_connected(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Exit {
        let mut conn = self.connection.take().expect("caller checked; qed");

        let mut ping_timer = tokio::time::interval_at(
            Instant::now() + self.opts.ping_interval,
            self.opts.ping_interval,
        );
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_timer = tokio::time::interval_at(
            Instant::now() + self.opts.request_cleanup_interval,
            self.opts.request_cleanup_interval,
        );
        cleanup_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            if let Some(exit) = self.try_finish_drain(&mut conn).await {
                break exit;
            }
            let drain_check_pending = self.drain.as_ref().is_some_and(|d| d.flushed);
            let drain_deadline = self
                .drain
                .as_ref()
                .map(|d| d.deadline)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None => {
                        // Every handle is gone; nothing can observe us, so
                        // tear down.
                        self.close_now(&mut conn).await;
                        break Exit::Closed;
                    }
                    Some(cmd) => {
                        if let Err(exit) = self.handle_command_connected(&mut conn, cmd).await {
                            break exit;
                        }
                    }
                },
                res = conn.read_op() => match res {
                    Ok(Some(op)) => {
                        if let Err(exit) = self.handle_op(&mut conn, op).await {
                            break exit;
                        }
                    }
                    Ok(None) => break Exit::Disconnected(None),
                    Err(err) => break Exit::Disconnected(Some(err)),
                },
                _ = ping_timer.tick() => {
                    if let Err(exit) = self.handle_ping_tick(&mut conn).await {
                        break exit;
                    }
                }
                _ = cleanup_timer.tick() => {
                    self.requests.sweep(Instant::now());
                }
                // While draining, wake up regularly to re-check the pending
                // queues; consumers make progress without producing any
                // engine event.
                _ = tokio::time::sleep(Duration::from_millis(10)), if drain_check_pending => {}
                _ = tokio::time::sleep_until(drain_deadline), if self.drain.is_some() => {
                    let drain = self.drain.take().expect("guard checked; qed");
                    self.close_now(&mut conn).await;
                    for waiter in drain.waiters {
                        let _ = waiter.send(Ok(false));
                    }
                    break Exit::Closed;
                }
            }
        };

        if let Exit::Disconnected(_) = &exit {
            conn.shutdown().await;
        }
        exit
    }

    async fn handle_command_connected(&mut self, conn: &mut Connection, cmd: Command) -> Flow {
        match cmd {
            Command::Publish { frame, prereserved } => {
                self.writer.enqueue_user(frame, prereserved, &self.shared.buffered_bytes);
                self.flush_writer(conn).await
            }
            Command::Subscribe { entry } => {
                let frame = subscribe_frame(&entry);
                self.subs.insert(entry.shared.sid, entry);
                self.writer.enqueue_internal(frame);
                self.flush_writer(conn).await
            }
            Command::Unsubscribe { sid, after } => self.handle_unsubscribe(conn, sid, after).await,
            Command::Request { token, subject, headers, payload, deadline, reply } => {
                self.handle_request(conn, token, subject, headers, payload, deadline, reply).await
            }
            Command::CancelRequest { token } => {
                self.requests.cancel(&token);
                Ok(())
            }
            Command::Flush { reply } => {
                self.writer.enqueue_internal(ping_frame());
                match self.flush_writer(conn).await {
                    Ok(()) => {
                        self.pong_waiters.push_back(PongWaiter::Flush(reply));
                        Ok(())
                    }
                    Err(exit) => {
                        let _ = reply.send(Err(Error::NotConnected));
                        Err(exit)
                    }
                }
            }
            Command::ForceReconnect => Err(Exit::Disconnected(None)),
            Command::Drain { timeout, reply } => self.handle_drain(conn, timeout, reply).await,
            Command::Close { done } => {
                self.close_now(conn).await;
                let _ = done.send(());
                Err(Exit::Closed)
            }
        }
    }

    async fn handle_unsubscribe(
        &mut self,
        conn: &mut Connection,
        sid: u64,
        after: Option<u64>,
    ) -> Flow {
        match after {
            None => {
                if self.subs.remove(&sid).is_some() {
                    self.writer
                        .enqueue_internal(unsubscribe_frame(sid, None));
                    self.flush_writer(conn).await?;
                }
                Ok(())
            }
            Some(cutoff) => {
                let Some(entry) = self.subs.get_mut(&sid) else {
                    return Ok(());
                };
                if entry.shared.delivered() >= cutoff {
                    self.subs.remove(&sid);
                    self.writer.enqueue_internal(unsubscribe_frame(sid, None));
                } else {
                    entry.unsub_after = Some(cutoff);
                    self.writer.enqueue_internal(unsubscribe_frame(sid, Some(cutoff)));
                }
                self.flush_writer(conn).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_request(
        &mut self,
        conn: &mut Connection,
        token: String,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
        deadline: Instant,
        reply: oneshot::Sender<Result<Message, Error>>,
    ) -> Flow {
        let had_inbox = self.inbox_sid.is_some();
        let inbox_sid = self.ensure_inbox_entry();
        if !had_inbox {
            let entry = self.subs.get(&inbox_sid).expect("inserted above; qed");
            self.writer.enqueue_internal(subscribe_frame(entry));
        }

        let reply_subject = format!("{}.{token}", self.shared.request_inbox_prefix);
        let frame = match op::encode(&ClientOp::Publish {
            subject,
            reply: Some(reply_subject),
            headers,
            payload,
        }) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return Ok(());
            }
        };
        if let Err(err) = Writer::check_control_line(&frame, self.opts.max_control_line) {
            let _ = reply.send(Err(err));
            return Ok(());
        }

        self.requests.insert(
            token,
            PendingRequest { reply, cancel_on_503: self.opts.cancel_on_no_responders, deadline },
        );
        self.shared.stats.add_request();
        self.writer.enqueue_user(frame, false, &self.shared.buffered_bytes);
        self.flush_writer(conn).await
    }

    async fn handle_drain(
        &mut self,
        conn: &mut Connection,
        timeout: Duration,
        reply: oneshot::Sender<Result<bool, Error>>,
    ) -> Flow {
        if let Some(drain) = &mut self.drain {
            // Draining already: the new caller simply joins the same
            // completion.
            drain.waiters.push(reply);
            return Ok(());
        }

        tracing::debug!(target: LOG_TARGET, "drain started, timeout {timeout:?}");
        self.shared.draining.store(true, Ordering::Release);
        for (sid, entry) in self.subs.iter_mut() {
            entry.draining = true;
            self.writer.enqueue_internal(unsubscribe_frame(*sid, None));
        }
        // A ping after the unsubscribes: its pong tells us the server
        // stopped sending, so pending counters can be trusted to shrink.
        self.writer.enqueue_internal(ping_frame());
        self.flush_writer(conn).await?;
        self.pong_waiters.push_back(PongWaiter::Drain);
        self.drain = Some(DrainState {
            deadline: Instant::now() + timeout,
            waiters: vec![reply],
            flushed: false,
        });
        Ok(())
    }

    /// When a drain is pending and everything has been delivered, finish
    /// it: block publishes, flush, close.
    async fn try_finish_drain(&mut self, conn: &mut Connection) -> Option<Exit> {
        let drain = self.drain.as_ref()?;
        if !drain.flushed {
            return None;
        }
        let queues_empty = self.subs.values().all(|entry| match &entry.sink {
            Sink::Sync { .. } => entry.shared.pending_msgs() == 0,
            Sink::Dispatched { dispatcher, .. } => dispatcher.pending_msgs() == 0,
            Sink::Inbox => true,
        });
        if !queues_empty {
            return None;
        }

        self.shared.publish_blocked.store(true, Ordering::Release);
        let _ = self.writer.flush_to(conn, &self.shared.buffered_bytes).await;
        let drain = self.drain.take().expect("checked above; qed");
        tracing::debug!(target: LOG_TARGET, "drain complete");
        // Close before resolving the waiters, so a caller that observes
        // completion already sees the terminal state.
        self.close_now(conn).await;
        for waiter in drain.waiters {
            let _ = waiter.send(Ok(true));
        }
        Some(Exit::Closed)
    }

    async fn handle_op(&mut self, conn: &mut Connection, op: ServerOp) -> Flow {
        self.traffic = true;
        match op {
            ServerOp::Info(info) => {
                self.apply_server_info(*info);
                Ok(())
            }
            ServerOp::Ping => {
                self.writer.enqueue_internal(pong_frame());
                self.flush_writer(conn).await
            }
            ServerOp::Pong => {
                self.outstanding_pings = 0;
                match self.pong_waiters.pop_front() {
                    Some(PongWaiter::Flush(reply)) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(PongWaiter::Drain) => {
                        if let Some(drain) = &mut self.drain {
                            drain.flushed = true;
                        }
                    }
                    Some(PongWaiter::Ping) | None => {}
                }
                Ok(())
            }
            ServerOp::Ok => Ok(()),
            ServerOp::Err(text) => {
                let err = if Error::is_auth_error_text(&text) {
                    Error::Authentication(text)
                } else {
                    Error::ServerError(text)
                };
                // Surface it; if the server considers it fatal it will
                // close the stream, which the read loop notices.
                self.events.error(err);
                Ok(())
            }
            ServerOp::Msg { subject, sid, reply, headers, payload } => {
                let msg = Message { subject, reply, headers, payload, sid };
                self.deliver(conn, msg).await
            }
        }
    }

    async fn deliver(&mut self, conn: &mut Connection, msg: Message) -> Flow {
        let sid = msg.sid;
        let Some(entry) = self.subs.get(&sid) else {
            // Tolerated: an auto-unsubscribe or close raced the server.
            tracing::trace!(target: LOG_TARGET, "dropping message for unknown sid {sid}");
            return Ok(());
        };

        if let Some(filter) = &entry.filter {
            if !filter(&msg) {
                return Ok(());
            }
        }

        if matches!(entry.sink, Sink::Inbox) {
            if let Some((_, token)) = msg.subject.rsplit_once('.') {
                let token = token.to_owned();
                if self.requests.complete(&token, msg) {
                    self.shared.stats.add_reply();
                }
            }
            return Ok(());
        }

        let received = entry.shared.note_delivered();
        if let Some(cutoff) = entry.unsub_after {
            if received > cutoff {
                self.subs.remove(&sid);
                return Ok(());
            }
        }
        let at_cutoff = entry.unsub_after.is_some_and(|cutoff| received == cutoff);

        let size = msg.size();
        let mut slow_event = false;
        let mut dead_consumer = false;
        match &entry.sink {
            Sink::Sync { tx } => {
                if !entry.shared.try_admit(size) {
                    entry.shared.note_dropped();
                    self.shared.stats.add_dropped();
                    slow_event = entry.shared.mark_slow();
                } else if tx.send(msg).is_err() {
                    entry.shared.note_consumed(size);
                    dead_consumer = true;
                }
            }
            Sink::Dispatched { jobs, dispatcher, handler } => {
                if !dispatcher.try_admit(size) {
                    entry.shared.note_dropped();
                    dispatcher.note_dropped();
                    self.shared.stats.add_dropped();
                    slow_event = dispatcher.mark_slow();
                } else if jobs
                    .send(crate::dispatcher::Job { handler: handler.clone(), message: msg })
                    .is_err()
                {
                    dead_consumer = true;
                }
            }
            Sink::Inbox => unreachable!("inbox handled above; qed"),
        }

        if slow_event {
            self.events.event(Event::SlowConsumer { sid });
        }
        if at_cutoff || dead_consumer {
            self.subs.remove(&sid);
        }
        if dead_consumer {
            // The consumer side is gone; tell the server to stop.
            self.writer.enqueue_internal(unsubscribe_frame(sid, None));
            self.flush_writer(conn).await?;
        }
        Ok(())
    }

    async fn handle_ping_tick(&mut self, conn: &mut Connection) -> Flow {
        if self.traffic {
            // Something arrived since the last cycle; the connection is
            // demonstrably alive, skip this soft ping.
            self.traffic = false;
            return Ok(());
        }
        if self.outstanding_pings >= self.opts.max_pings_out {
            tracing::debug!(
                target: LOG_TARGET,
                "{} pings outstanding, declaring the connection stale",
                self.outstanding_pings,
            );
            return Err(Exit::Disconnected(Some(Error::StaleConnection)));
        }
        self.outstanding_pings += 1;
        self.pong_waiters.push_back(PongWaiter::Ping);
        self.writer.enqueue_internal(ping_frame());
        self.flush_writer(conn).await
    }

    async fn flush_writer(&mut self, conn: &mut Connection) -> Flow {
        self.writer
            .flush_to(conn, &self.shared.buffered_bytes)
            .await
            .map_err(io_exit)
    }

    // ---- reconnecting ----

    /// Walk the candidate list until a connection sticks or the pool is
    /// exhausted. Returns false when the engine should stop.
    async fn run_reconnecting(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
        let mut first_attempt = true;
        loop {
            let candidates = self.pool.candidates();
            if candidates.is_empty() {
                tracing::debug!(target: LOG_TARGET, "server pool exhausted, closing");
                self.events.error(Error::NoServers);
                self.shutdown_common();
                return false;
            }

            for addr in candidates {
                if !first_attempt {
                    let delay = compute_reconnect_delay(
                        self.opts.reconnect_wait,
                        if self.secure {
                            self.opts.reconnect_jitter_tls
                        } else {
                            self.opts.reconnect_jitter
                        },
                        self.opts.reconnect_delay_handler.as_ref(),
                        self.total_tries,
                    );
                    if !self.wait_processing_commands(commands, delay).await {
                        return false;
                    }
                }
                first_attempt = false;

                self.total_tries += 1;
                self.transition(ConnectionState::Connecting);
                match self.try_connect(&addr).await {
                    Ok(mut conn) => {
                        self.prepare_resubscribe();
                        match self.writer.flush_to(&mut conn, &self.shared.buffered_bytes).await {
                            Ok(()) => {
                                self.finish_connect(conn, addr, true);
                                self.events.event(Event::Resubscribed);
                                return true;
                            }
                            Err(err) => {
                                tracing::debug!(
                                    target: LOG_TARGET,
                                    "resubscribe flush to {addr} failed: {err}",
                                );
                                self.pool.record_failure(&addr, None);
                                self.writer.reset_for_reconnect();
                                self.events.error(err.into());
                                self.transition(ConnectionState::Reconnecting);
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target: LOG_TARGET, "reconnect to {addr} failed: {err}");
                        let auth_text = auth_error_text(&err);
                        let disposition = self.pool.record_failure(&addr, auth_text.as_deref());
                        if disposition.double_auth {
                            // The same server rejecting credentials twice
                            // will keep doing so; spinning helps nobody.
                            self.events.error(Error::DoubleAuth(addr.to_string()));
                            self.shutdown_common();
                            return false;
                        }
                        self.events.error(err);
                        self.transition(ConnectionState::Reconnecting);
                    }
                }
            }

            if self.pool.is_exhausted() {
                self.events.error(Error::NoServers);
                self.shutdown_common();
                return false;
            }
        }
    }

    /// Sleep for `delay` while still serving commands. Returns false when a
    /// command closed the engine.
    async fn wait_processing_commands(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        delay: Duration,
    ) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = commands.recv() => match cmd {
                    None => {
                        self.shutdown_common();
                        return false;
                    }
                    Some(cmd) => {
                        if !self.handle_command_disconnected(cmd) {
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Serve a command while no server is reachable. Returns false when the
    /// command closed the engine.
    fn handle_command_disconnected(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Publish { frame, prereserved } => {
                self.writer.enqueue_user(frame, prereserved, &self.shared.buffered_bytes);
                true
            }
            Command::Subscribe { entry } => {
                // Registered now, SUB goes out with the resubscription.
                self.subs.insert(entry.shared.sid, entry);
                true
            }
            Command::Unsubscribe { sid, after } => {
                match after {
                    None => {
                        self.subs.remove(&sid);
                    }
                    Some(cutoff) => {
                        if let Some(entry) = self.subs.get_mut(&sid) {
                            if entry.shared.delivered() >= cutoff {
                                self.subs.remove(&sid);
                            } else {
                                entry.unsub_after = Some(cutoff);
                            }
                        }
                    }
                }
                true
            }
            Command::Request { token, subject, headers, payload, deadline, reply } => {
                self.ensure_inbox_entry();
                let reply_subject = format!("{}.{token}", self.shared.request_inbox_prefix);
                let frame = match op::encode(&ClientOp::Publish {
                    subject,
                    reply: Some(reply_subject),
                    headers,
                    payload,
                }) {
                    Ok(frame) => frame,
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        return true;
                    }
                };
                if !Writer::fits_reconnect_budget(
                    &self.shared.buffered_bytes,
                    frame.len(),
                    self.shared.reconnect_buffer_size,
                ) {
                    let _ = reply.send(Err(Error::ReconnectBufferFull));
                    return true;
                }
                self.requests.insert(
                    token,
                    PendingRequest {
                        reply,
                        cancel_on_503: self.opts.cancel_on_no_responders,
                        deadline,
                    },
                );
                self.shared.stats.add_request();
                self.writer.enqueue_user(frame, false, &self.shared.buffered_bytes);
                true
            }
            Command::CancelRequest { token } => {
                self.requests.cancel(&token);
                true
            }
            Command::Flush { reply } => {
                let _ = reply.send(Err(Error::NotConnected));
                true
            }
            Command::ForceReconnect => true,
            Command::Drain { timeout: _, reply } => {
                // Nothing is in flight without a server; a drain here is a
                // close.
                self.shutdown_common();
                let _ = reply.send(Ok(true));
                false
            }
            Command::Close { done } => {
                self.shutdown_common();
                let _ = done.send(());
                false
            }
        }
    }

    // ---- handshake ----

    async fn try_connect(&mut self, addr: &ServerAddr) -> Result<Connection, Error> {
        match tokio::time::timeout(self.opts.connect_timeout, self.handshake(addr)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout("connect")),
        }
    }

    async fn handshake(&mut self, addr: &ServerAddr) -> Result<Connection, Error> {
        let mut transport = Transport::connect(addr).await?;
        if self.opts.tls_first && !addr.is_websocket() {
            transport = transport.upgrade_tls(addr, self.opts.tls_config.as_ref()).await?;
        }

        let mut conn = Connection::new(transport, self.shared.stats.clone());
        let info = conn.read_initial_info().await?;

        if self.opts.no_echo && info.proto < 1 {
            return Err(Error::UnsupportedServer(
                "no_echo needs protocol version 1".to_owned(),
            ));
        }
        if self.opts.headers_required && !info.headers {
            return Err(Error::UnsupportedServer(
                "headers are required but not supported".to_owned(),
            ));
        }

        let tls_wanted = info.tls_required || self.opts.tls_required || addr.tls_required();
        if tls_wanted && !conn.is_secure() && !addr.is_websocket() {
            conn = conn.upgrade_tls(addr, self.opts.tls_config.as_ref()).await?;
        }

        let connect = self.connect_info(&info, conn.is_secure())?;
        self.apply_server_info(info);

        conn.write_frame(&op::encode(&ClientOp::Connect(Box::new(connect)))?).await?;
        conn.write_frame(&ping_frame()).await?;
        conn.flush().await?;

        // Wait for the PONG answering our handshake PING.
        loop {
            match conn.read_op().await? {
                Some(ServerOp::Pong) => break,
                Some(ServerOp::Ping) => {
                    conn.write_frame(&pong_frame()).await?;
                    conn.flush().await?;
                }
                Some(ServerOp::Ok) => {}
                Some(ServerOp::Info(info)) => self.apply_server_info(*info),
                Some(ServerOp::Err(text)) => {
                    return Err(if Error::is_auth_error_text(&text) {
                        Error::Authentication(text)
                    } else {
                        Error::ServerError(text)
                    });
                }
                Some(ServerOp::Msg { .. }) => {
                    return Err(Error::Protocol(natter_proto::ProtocolError::BadControlLine {
                        op: "handshake",
                        reason: "unexpected MSG before the handshake PONG",
                    }));
                }
                None => return Err(Error::UnexpectedEof),
            }
        }

        Ok(conn)
    }

    fn connect_info(&self, info: &ServerInfo, secure: bool) -> Result<ConnectInfo, Error> {
        let mut connect = ConnectInfo {
            verbose: self.opts.verbose,
            pedantic: self.opts.pedantic,
            tls_required: secure,
            name: self.opts.name.clone(),
            echo: !self.opts.no_echo,
            headers: info.headers,
            no_responders: info.headers && self.opts.cancel_on_no_responders,
            protocol: if info.proto >= 1 { 1 } else { 0 },
            ..ConnectInfo::default()
        };
        match &self.opts.auth {
            Auth::None => {}
            Auth::Token(token) => connect.auth_token = Some(token.clone()),
            Auth::UserPassword { user, pass } => {
                connect.user = Some(user.clone());
                connect.pass = Some(pass.clone());
            }
            Auth::Jwt { jwt, signer } => {
                connect.jwt = Some(jwt.clone());
                if !info.nonce.is_empty() {
                    connect.sig = Some(signer(info.nonce.as_bytes())?);
                }
            }
            Auth::NKey { public_key, signer } => {
                connect.nkey = Some(public_key.clone());
                if !info.nonce.is_empty() {
                    connect.sig = Some(signer(info.nonce.as_bytes())?);
                }
            }
        }
        Ok(connect)
    }

    fn apply_server_info(&mut self, info: ServerInfo) {
        if info.lame_duck_mode {
            self.events.event(Event::LameDuckMode);
        }
        if !info.connect_urls.is_empty() && self.pool.merge_discovered(&info.connect_urls) {
            self.events.event(Event::DiscoveredServers(info.connect_urls.clone()));
        }
        self.shared.info.store(Some(Arc::new(info)));
    }

    fn finish_connect(&mut self, conn: Connection, addr: ServerAddr, reconnect: bool) {
        self.secure = conn.is_secure();
        self.connection = Some(conn);
        self.pool.record_success(&addr);
        self.shared.connected_url.store(Some(Arc::new(addr.to_string())));
        self.outstanding_pings = 0;
        self.traffic = false;
        self.transition(ConnectionState::Connected);
        if reconnect {
            self.shared.stats.add_reconnect();
            self.events.event(Event::Reconnected);
            tracing::debug!(target: LOG_TARGET, "reconnected to {addr}");
        } else {
            self.events.event(Event::Connected);
            tracing::debug!(target: LOG_TARGET, "connected to {addr}");
        }
    }

    /// Queue a SUB for every surviving subscription (and the trailing
    /// UNSUB for auto-unsubscribing ones), ahead of any buffered user
    /// frame.
    fn prepare_resubscribe(&mut self) {
        let mut done: Vec<u64> = Vec::new();
        for (sid, entry) in &self.subs {
            if entry.draining {
                continue;
            }
            let delivered = entry.shared.delivered();
            if let Some(cutoff) = entry.unsub_after {
                if delivered >= cutoff {
                    done.push(*sid);
                    continue;
                }
            }
            self.writer.enqueue_internal(subscribe_frame(entry));
            if let Some(cutoff) = entry.unsub_after {
                // The replacement connection counts from zero.
                let remaining = cutoff - delivered;
                self.writer.enqueue_internal(unsubscribe_frame(*sid, Some(remaining)));
            }
        }
        for sid in done {
            self.subs.remove(&sid);
        }
    }

    fn ensure_inbox_entry(&mut self) -> u64 {
        if let Some(sid) = self.inbox_sid {
            return sid;
        }
        let sid = self.shared.next_sid.fetch_add(1, Ordering::AcqRel);
        let subject = format!("{}.*", self.shared.request_inbox_prefix);
        let shared = Arc::new(crate::subscription::SubShared::new(sid, subject, None, 0, 0));
        self.subs.insert(
            sid,
            SubEntry { shared, sink: Sink::Inbox, filter: None, unsub_after: None, draining: false },
        );
        self.inbox_sid = Some(sid);
        sid
    }

    // ---- teardown ----

    fn handle_disconnect(&mut self, err: Option<Error>) {
        self.shared.connected_url.store(None);
        self.outstanding_pings = 0;
        self.traffic = false;
        for waiter in self.pong_waiters.drain(..) {
            if let PongWaiter::Flush(reply) = waiter {
                let _ = reply.send(Err(Error::NotConnected));
            }
        }
        self.writer.reset_for_reconnect();
        if let Some(err) = err {
            tracing::debug!(target: LOG_TARGET, "connection lost: {err}");
            self.events.error(err);
        }
        self.events.event(Event::Disconnected);
    }

    async fn close_now(&mut self, conn: &mut Connection) {
        conn.shutdown().await;
        self.shutdown_common();
    }

    /// The terminal transition: cancel everything that could still be
    /// waited on and publish `Closed`.
    fn shutdown_common(&mut self) {
        self.requests.cancel_all();
        for waiter in self.pong_waiters.drain(..) {
            if let PongWaiter::Flush(reply) = waiter {
                let _ = reply.send(Err(Error::ConnectionClosed));
            }
        }
        for (_sid, entry) in self.subs.drain() {
            entry.shared.invalidate();
        }
        self.inbox_sid = None;
        self.writer.clear(&self.shared.buffered_bytes);
        self.shared.publish_blocked.store(true, Ordering::Release);
        self.shared.connected_url.store(None);
        self.transition(ConnectionState::Closed);
        self.events.event(Event::Closed);
    }
}

fn subscribe_frame(entry: &SubEntry) -> Frame {
    op::encode(&ClientOp::Subscribe {
        sid: entry.shared.sid,
        subject: entry.shared.subject.clone(),
        queue: entry.shared.queue.clone(),
    })
    .expect("SUB serialization is infallible; qed")
}

fn unsubscribe_frame(sid: u64, max: Option<u64>) -> Frame {
    op::encode(&ClientOp::Unsubscribe { sid, max })
        .expect("UNSUB serialization is infallible; qed")
}

fn ping_frame() -> Frame {
    op::encode(&ClientOp::Ping).expect("PING serialization is infallible; qed")
}

fn pong_frame() -> Frame {
    op::encode(&ClientOp::Pong).expect("PONG serialization is infallible; qed")
}

fn auth_error_text(err: &Error) -> Option<String> {
    match err {
        Error::Authentication(text) => Some(text.clone()),
        _ => None,
    }
}

/// The delay before the next reconnect attempt: the user handler when one
/// is installed, otherwise `wait + uniform(0, jitter)`.
fn compute_reconnect_delay(
    wait: Duration,
    jitter_cap: Duration,
    handler: Option<&ReconnectDelayHandler>,
    total_tries: u64,
) -> Duration {
    if let Some(handler) = handler {
        return handler(total_tries);
    }
    if jitter_cap.is_zero() {
        return wait;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..jitter_cap.as_millis().max(1) as u64);
    wait + Duration::from_millis(jitter_ms)
}
