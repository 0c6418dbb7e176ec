// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The cloneable client handle in front of the connection engine.

use crate::dispatcher::Dispatcher;
use crate::engine::{Command, ConnectionState, Engine, Shared};
use crate::error::Error;
use crate::events::spawn_fanout;
use crate::message::Message;
use crate::options::ConnectOptions;
use crate::stats::Statistics;
use crate::subscription::{
    HandlerSubscription, Sink, SubEntry, SubShared, SubscribeOptions, Subscription,
    DEFAULT_MAX_PENDING_BYTES, DEFAULT_MAX_PENDING_MSGS,
};
use crate::writer::Writer;
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use natter_proto::op::{self, ClientOp};
use natter_proto::types::ServerInfo;
use natter_proto::{nuid, subject, HeaderMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// A handle to one connection.
///
/// `Client` is cheap to clone; every clone talks to the same engine task.
/// The connection lives until [`Client::close`]/[`Client::drain`] is called
/// or the last handle (subscriptions included) is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    engine: JoinHandle<()>,
    fanout: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.engine.abort();
        self.fanout.abort();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("url", &self.connected_url())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect using `options`. Blocks until Connected, unless
    /// [`ConnectOptions::reconnect_on_initial_connect`] turned a failed
    /// first attempt into a background reconnect.
    pub async fn connect_with_options(mut options: ConnectOptions) -> Result<Client, Error> {
        let stats = Arc::new(Statistics::default());
        let event_cb = options.event_listener.take();
        let error_cb = options.error_listener.take();
        let (events, fanout) = spawn_fanout(event_cb, error_cb, stats.clone());

        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state: state_tx,
            info: ArcSwapOption::empty(),
            connected_url: ArcSwapOption::empty(),
            stats,
            buffered_bytes: AtomicUsize::new(0),
            publish_blocked: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            next_sid: AtomicU64::new(1),
            request_inbox_prefix: format!("{}.{}", options.inbox_prefix, nuid::next()),
            user_inbox_prefix: options.inbox_prefix.clone(),
            client_side_limit_checks: options.client_side_limit_checks,
            max_control_line: options.max_control_line,
            reconnect_buffer_size: options.reconnect_buffer_size,
            default_request_timeout: options.default_request_timeout,
            old_request_style: options.old_request_style,
            cancel_on_503: options.cancel_on_no_responders,
        });

        let mut engine = match Engine::new(options, shared.clone(), events) {
            Ok(engine) => engine,
            Err(err) => {
                fanout.abort();
                return Err(err);
            }
        };

        if let Err(err) = engine.initial_connect().await {
            if engine.retry_initial() {
                engine.enter_reconnecting();
            } else {
                fanout.abort();
                return Err(err);
            }
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let engine = tokio::spawn(engine.run(command_rx));

        Ok(Client { inner: Arc::new(ClientInner { commands, shared, engine, fanout }) })
    }

    fn send(&self, cmd: Command) -> Result<(), Error> {
        self.inner.commands.send(cmd).map_err(|_| Error::ConnectionClosed)
    }

    // ---- status ----

    /// Where the connection currently is in its lifecycle.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Whether the connection is currently live.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Whether a drain is in progress.
    pub fn is_draining(&self) -> bool {
        self.inner.shared.draining.load(Ordering::Acquire)
    }

    /// The most recent `INFO` received from the connected server.
    pub fn server_info(&self) -> Option<Arc<ServerInfo>> {
        self.inner.shared.info.load_full()
    }

    /// The URL of the server we are connected to right now.
    pub fn connected_url(&self) -> Option<String> {
        self.inner.shared.connected_url.load_full().map(|url| (*url).clone())
    }

    /// The connection's statistics counters.
    pub fn statistics(&self) -> Arc<Statistics> {
        self.inner.shared.stats.clone()
    }

    /// A fresh, globally unique inbox subject under the configured inbox
    /// prefix.
    pub fn new_inbox(&self) -> String {
        format!("{}.{}", self.inner.shared.user_inbox_prefix, nuid::next())
    }

    // ---- publish ----

    /// Publish `payload` to `subject`. Non-blocking: the frame is handed to
    /// the engine, which transmits it immediately when connected and
    /// buffers it (up to the reconnect budget) when not.
    pub fn publish(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.publish_inner(subject.into(), None, None, payload.into())
    }

    /// Publish with a reply subject for responders to answer to.
    pub fn publish_with_reply(
        &self,
        subject: impl Into<String>,
        reply: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.publish_inner(subject.into(), Some(reply.into()), None, payload.into())
    }

    /// Publish with headers.
    pub fn publish_with_headers(
        &self,
        subject: impl Into<String>,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.publish_inner(subject.into(), None, Some(headers), payload.into())
    }

    /// Publish with both a reply subject and headers.
    pub fn publish_with_reply_and_headers(
        &self,
        subject: impl Into<String>,
        reply: impl Into<String>,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.publish_inner(subject.into(), Some(reply.into()), Some(headers), payload.into())
    }

    fn publish_inner(
        &self,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<(), Error> {
        let shared = &self.inner.shared;
        if shared.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        if shared.publish_blocked.load(Ordering::Acquire) {
            return Err(Error::DrainInProgress);
        }
        subject::validate_subject(&subject)?;
        if let Some(reply) = &reply {
            subject::validate_subject(reply)?;
        }
        self.check_limits(headers.is_some(), payload.len())?;

        let frame = op::encode(&ClientOp::Publish { subject, reply, headers, payload })?;
        Writer::check_control_line(&frame, shared.max_control_line)?;

        let prereserved = match shared.state() {
            ConnectionState::Connected => false,
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            // Disconnected / Connecting / Reconnecting: the frame will sit
            // in the reconnect buffer, so reserve its bytes now. Doing it
            // on the publishing thread is what makes overflow a synchronous
            // error.
            _ => {
                shared.try_reserve_reconnect_bytes(frame.len())?;
                true
            }
        };
        self.send(Command::Publish { frame, prereserved })
    }

    /// Checks shared by publishes and requests: headers support and the
    /// server's advertised maximum payload. Both need a server `INFO`; when
    /// none has arrived yet (first connect still pending) the checks pass
    /// and the server has the final word.
    fn check_limits(&self, has_headers: bool, payload_len: usize) -> Result<(), Error> {
        let Some(info) = self.inner.shared.info.load_full() else {
            return Ok(());
        };
        if has_headers && !info.headers {
            return Err(Error::HeadersUnsupported);
        }
        if self.inner.shared.client_side_limit_checks
            && info.max_payload > 0
            && payload_len > info.max_payload
        {
            return Err(Error::PayloadTooLarge { size: payload_len, max: info.max_payload });
        }
        Ok(())
    }

    // ---- subscriptions ----

    /// Subscribe to `subject` (which may contain wildcards), returning a
    /// synchronous subscription to pull messages from.
    pub fn subscribe(&self, subject: impl Into<String>) -> Result<Subscription, Error> {
        self.subscribe_with_options(subject, SubscribeOptions::new())
    }

    /// Subscribe as a member of `queue`: the server delivers each message
    /// to one member of the group.
    pub fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue: impl Into<String>,
    ) -> Result<Subscription, Error> {
        self.subscribe_with_options(subject, SubscribeOptions::new().queue(queue))
    }

    /// Subscribe with explicit per-subscription options.
    pub fn subscribe_with_options(
        &self,
        subject: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<Subscription, Error> {
        let (shared, rx, entry) = self.make_subscription(subject.into(), options, None)?;
        self.send(Command::Subscribe { entry })?;
        Ok(Subscription::new(shared, rx.expect("sync sink always has a receiver; qed"), self.clone()))
    }

    /// Create a new dispatcher with default pending limits.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::spawn(
            DEFAULT_MAX_PENDING_MSGS,
            DEFAULT_MAX_PENDING_BYTES,
            self.inner.shared.stats.clone(),
        )
    }

    /// Create a new dispatcher with explicit pending limits (zero or
    /// negative disables the corresponding check).
    pub fn dispatcher_with_limits(&self, max_pending_msgs: i64, max_pending_bytes: i64) -> Dispatcher {
        Dispatcher::spawn(max_pending_msgs, max_pending_bytes, self.inner.shared.stats.clone())
    }

    /// Subscribe with an asynchronous handler running on `dispatcher`.
    pub fn subscribe_with_handler(
        &self,
        dispatcher: &Dispatcher,
        subject: impl Into<String>,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<HandlerSubscription, Error> {
        self.subscribe_with_handler_options(dispatcher, subject, SubscribeOptions::new(), handler)
    }

    /// Subscribe with an asynchronous handler and explicit options.
    pub fn subscribe_with_handler_options(
        &self,
        dispatcher: &Dispatcher,
        subject: impl Into<String>,
        options: SubscribeOptions,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<HandlerSubscription, Error> {
        let (shared, _rx, entry) =
            self.make_subscription(subject.into(), options, Some((dispatcher, Arc::new(handler))))?;
        self.send(Command::Subscribe { entry })?;
        Ok(HandlerSubscription::new(shared, self.clone()))
    }

    #[allow(clippy::type_complexity)]
    fn make_subscription(
        &self,
        subject: String,
        options: SubscribeOptions,
        dispatched: Option<(&Dispatcher, Arc<dyn Fn(Message) + Send + Sync>)>,
    ) -> Result<(Arc<SubShared>, Option<mpsc::UnboundedReceiver<Message>>, SubEntry), Error> {
        let shared = &self.inner.shared;
        if shared.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        if shared.draining.load(Ordering::Acquire) {
            return Err(Error::DrainInProgress);
        }
        subject::validate_subject_pattern(&subject)?;
        if let Some(queue) = &options.queue {
            subject::validate_queue_group(queue)?;
        }

        let sid = shared.next_sid.fetch_add(1, Ordering::AcqRel);
        let sub_shared = Arc::new(SubShared::new(
            sid,
            subject,
            options.queue.clone(),
            options.max_pending_msgs.unwrap_or(DEFAULT_MAX_PENDING_MSGS),
            options.max_pending_bytes.unwrap_or(DEFAULT_MAX_PENDING_BYTES),
        ));

        let (sink, rx) = match dispatched {
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Sink::Sync { tx }, Some(rx))
            }
            Some((dispatcher, handler)) => (
                Sink::Dispatched {
                    jobs: dispatcher.jobs(),
                    dispatcher: dispatcher.shared(),
                    handler,
                },
                None,
            ),
        };
        let entry = SubEntry {
            shared: sub_shared.clone(),
            sink,
            filter: options.filter,
            unsub_after: None,
            draining: false,
        };
        Ok((sub_shared, rx, entry))
    }

    pub(crate) fn send_unsubscribe(&self, sid: u64, after: Option<u64>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.send(Command::Unsubscribe { sid, after })
    }

    pub(crate) fn lazy_unsubscribe(&self, sid: u64) {
        let _ = self.inner.commands.send(Command::Unsubscribe { sid, after: None });
    }

    // ---- request/reply ----

    /// Publish a request and await its reply, with the connection's default
    /// request timeout.
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Message, Error> {
        let timeout = self.inner.shared.default_request_timeout;
        self.request_inner(subject.into(), None, payload.into(), timeout).await
    }

    /// Publish a request with headers and await its reply.
    pub async fn request_with_headers(
        &self,
        subject: impl Into<String>,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<Message, Error> {
        let timeout = self.inner.shared.default_request_timeout;
        self.request_inner(subject.into(), Some(headers), payload.into(), timeout).await
    }

    /// Publish a request and await its reply for up to `timeout`.
    pub async fn request_timeout(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message, Error> {
        self.request_inner(subject.into(), None, payload.into(), timeout).await
    }

    async fn request_inner(
        &self,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, Error> {
        let shared = &self.inner.shared;
        if shared.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        if shared.draining.load(Ordering::Acquire) {
            return Err(Error::DrainInProgress);
        }
        subject::validate_subject(&subject)?;
        self.check_limits(headers.is_some(), payload.len())?;

        if shared.old_request_style {
            return self.request_old_style(subject, headers, payload, timeout).await;
        }

        let token = nuid::next();
        let (tx, rx) = oneshot::channel();
        self.send(Command::Request {
            token: token.clone(),
            subject,
            headers,
            payload,
            deadline: tokio::time::Instant::now() + timeout,
            reply: tx,
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_elapsed) => {
                let _ = self.send(Command::CancelRequest { token });
                Err(Error::Timeout("request"))
            }
            Ok(Err(_recv)) => Err(Error::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// The pre-shared-inbox request style: one short-lived subscription per
    /// request with an auto-unsubscribe after its single reply.
    async fn request_old_style(
        &self,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, Error> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(inbox.clone())?;
        sub.unsubscribe_after(1)?;
        self.publish_inner(subject, Some(inbox), headers, payload)?;
        self.inner.shared.stats.add_request();

        match sub.next_timeout(timeout).await {
            Ok(Some(msg)) => {
                if self.inner.shared.cancel_on_503 && msg.is_no_responders() {
                    Err(Error::NoResponders)
                } else {
                    self.inner.shared.stats.add_reply();
                    Ok(msg)
                }
            }
            Ok(None) => {
                // Unsubscribe explicitly so an eventually-arriving reply
                // does not leak the registry entry.
                let _ = self.send_unsubscribe(sub.sid(), None);
                Err(Error::Timeout("request"))
            }
            Err(err) => Err(err),
        }
    }

    // ---- liveness, drain, close ----

    /// Round-trip a PING to the server, waiting at most `timeout` for the
    /// PONG. Everything written before the PING has been processed by the
    /// server once this returns.
    pub async fn flush(&self, timeout: Duration) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush { reply: tx })?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_elapsed) => Err(Error::Timeout("flush")),
            Ok(Err(_recv)) => Err(Error::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Measure the round-trip time to the server.
    pub async fn rtt(&self) -> Result<Duration, Error> {
        let started = std::time::Instant::now();
        self.flush(self.inner.shared.default_request_timeout).await?;
        Ok(started.elapsed())
    }

    /// Gracefully wind the connection down: consumers are unsubscribed,
    /// in-flight deliveries complete, publishing is then blocked, a final
    /// flush runs and the connection closes. Returns whether everything
    /// drained within `timeout` (`false` means the deadline forced the
    /// close). Calling drain again while one is running joins the same
    /// completion.
    pub async fn drain(&self, timeout: Duration) -> Result<bool, Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::Drain { timeout, reply: tx })?;
        match rx.await {
            Ok(result) => result,
            Err(_recv) => Err(Error::ConnectionClosed),
        }
    }

    /// Close the connection. Idempotent; pending requests and waiting
    /// consumers are cancelled with [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Close { done: tx }).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Drop the current transport and reconnect through the regular
    /// reconnect path, subscriptions preserved.
    pub fn force_reconnect(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.send(Command::ForceReconnect)
    }
}

impl ConnectOptions {
    /// Connect using these options. Convenience for
    /// [`Client::connect_with_options`].
    pub async fn connect(self) -> Result<Client, Error> {
        Client::connect_with_options(self).await
    }
}
