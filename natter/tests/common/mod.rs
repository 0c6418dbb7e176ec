// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! An in-process protocol server for the integration tests: real TCP, the
//! real line protocol, just enough routing (wildcards, queue groups,
//! no-responders) to exercise the client end to end. Restartable on a
//! fixed port so reconnect scenarios can bring "the same server" back.

#![allow(dead_code)]

use bytes::{Buf, BytesMut};
use natter::proto::subject;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration};

/// Tuning for the mock's advertised `INFO`.
#[derive(Clone)]
pub struct MockBehavior {
    pub headers: bool,
    pub max_payload: usize,
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior { headers: true, max_payload: 1024 * 1024 }
    }
}

struct SubRec {
    conn_id: u64,
    sid: u64,
    subject: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
}

struct State {
    behavior: MockBehavior,
    answer_pings: AtomicBool,
    subs: Mutex<Vec<SubRec>>,
    conns: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    next_conn_id: AtomicU64,
}

pub struct MockServer {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    state: Arc<State>,
}

/// Install a `tracing` subscriber for the test run; `RUST_LOG` selects what
/// the engine logs while a test executes.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl MockServer {
    pub async fn start() -> MockServer {
        Self::start_inner("127.0.0.1:0", MockBehavior::default()).await
    }

    pub async fn start_with(behavior: MockBehavior) -> MockServer {
        Self::start_inner("127.0.0.1:0", behavior).await
    }

    /// Bind a specific port, retrying briefly: restarting "the same
    /// server" may race the previous socket's teardown.
    pub async fn start_on(port: u16) -> MockServer {
        Self::start_inner(&format!("127.0.0.1:{port}"), MockBehavior::default()).await
    }

    async fn start_inner(bind: &str, behavior: MockBehavior) -> MockServer {
        init_tracing();
        let listener = {
            let mut attempt = 0;
            loop {
                match TcpListener::bind(bind).await {
                    Ok(listener) => break listener,
                    Err(err) => {
                        attempt += 1;
                        if attempt > 50 {
                            panic!("could not bind {bind}: {err}");
                        }
                        sleep(Duration::from_millis(20)).await;
                    }
                }
            }
        };
        let addr = listener.local_addr().expect("bound socket has an addr");

        let (shutdown, _) = broadcast::channel(4);
        let state = Arc::new(State {
            behavior,
            answer_pings: AtomicBool::new(true),
            subs: Mutex::new(Vec::new()),
            conns: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        });

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        let mut accept_shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => match res {
                        Ok((stream, _peer)) => {
                            let state = accept_state.clone();
                            let shutdown_rx = accept_shutdown.subscribe();
                            tokio::spawn(serve_connection(stream, state, shutdown_rx));
                        }
                        Err(_) => break,
                    },
                    _ = accept_shutdown_rx.recv() => break,
                }
            }
        });

        MockServer { addr, shutdown, state }
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop answering client PINGs (to provoke the stale-connection path).
    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::Release);
    }

    /// Kill the listener and every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.state.conns.lock().unwrap().clear();
        self.state.subs.lock().unwrap().clear();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<State>,
    mut shutdown: broadcast::Receiver<()>,
) {
    stream.set_nodelay(true).ok();
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::AcqRel);
    let (mut read_half, mut write_half) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state.conns.lock().unwrap().insert(conn_id, out_tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let info = format!(
        "INFO {{\"server_id\":\"mock-{conn_id}\",\"version\":\"0.0.0-mock\",\"proto\":1,\
         \"headers\":{},\"max_payload\":{}}}\r\n",
        state.behavior.headers, state.behavior.max_payload,
    );
    let _ = out_tx.send(info.into_bytes());

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        while let Some(frame) = parse_client_frame(&mut buf) {
            handle_frame(&state, conn_id, &out_tx, frame);
        }
        tokio::select! {
            res = read_half.read_buf(&mut buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            _ = shutdown.recv() => break,
        }
    }

    state.conns.lock().unwrap().remove(&conn_id);
    state.subs.lock().unwrap().retain(|s| s.conn_id != conn_id);
    writer.abort();
}

enum ClientFrame {
    Connect,
    Ping,
    Pong,
    Sub { subject: String, queue: Option<String>, sid: u64 },
    Unsub { sid: u64, max: Option<u64> },
    Pub { subject: String, reply: Option<String>, headers: Option<Vec<u8>>, payload: Vec<u8> },
}

fn parse_client_frame(buf: &mut BytesMut) -> Option<ClientFrame> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
    let tokens: Vec<&str> = line.split_whitespace().collect();

    match tokens.as_slice() {
        ["CONNECT", ..] => {
            buf.advance(pos + 2);
            Some(ClientFrame::Connect)
        }
        ["PING"] => {
            buf.advance(pos + 2);
            Some(ClientFrame::Ping)
        }
        ["PONG"] => {
            buf.advance(pos + 2);
            Some(ClientFrame::Pong)
        }
        ["SUB", subject, sid] => {
            let frame = ClientFrame::Sub {
                subject: (*subject).to_owned(),
                queue: None,
                sid: sid.parse().unwrap(),
            };
            buf.advance(pos + 2);
            Some(frame)
        }
        ["SUB", subject, queue, sid] => {
            let frame = ClientFrame::Sub {
                subject: (*subject).to_owned(),
                queue: Some((*queue).to_owned()),
                sid: sid.parse().unwrap(),
            };
            buf.advance(pos + 2);
            Some(frame)
        }
        ["UNSUB", sid] => {
            let frame = ClientFrame::Unsub { sid: sid.parse().unwrap(), max: None };
            buf.advance(pos + 2);
            Some(frame)
        }
        ["UNSUB", sid, max] => {
            let frame = ClientFrame::Unsub {
                sid: sid.parse().unwrap(),
                max: Some(max.parse().unwrap()),
            };
            buf.advance(pos + 2);
            Some(frame)
        }
        ["PUB", rest @ ..] => {
            let (subject, reply, len) = match rest {
                [subject, len] => ((*subject).to_owned(), None, len.parse::<usize>().unwrap()),
                [subject, reply, len] => {
                    ((*subject).to_owned(), Some((*reply).to_owned()), len.parse().unwrap())
                }
                _ => panic!("bad PUB line: {line}"),
            };
            if buf.len() < pos + 2 + len + 2 {
                return None;
            }
            buf.advance(pos + 2);
            let payload = buf.split_to(len).to_vec();
            buf.advance(2);
            Some(ClientFrame::Pub { subject, reply, headers: None, payload })
        }
        ["HPUB", rest @ ..] => {
            let (subject, reply, hlen, tlen) = match rest {
                [subject, hlen, tlen] => (
                    (*subject).to_owned(),
                    None,
                    hlen.parse::<usize>().unwrap(),
                    tlen.parse::<usize>().unwrap(),
                ),
                [subject, reply, hlen, tlen] => (
                    (*subject).to_owned(),
                    Some((*reply).to_owned()),
                    hlen.parse().unwrap(),
                    tlen.parse().unwrap(),
                ),
                _ => panic!("bad HPUB line: {line}"),
            };
            if buf.len() < pos + 2 + tlen + 2 {
                return None;
            }
            buf.advance(pos + 2);
            let headers = buf.split_to(hlen).to_vec();
            let payload = buf.split_to(tlen - hlen).to_vec();
            buf.advance(2);
            Some(ClientFrame::Pub { subject, reply, headers: Some(headers), payload })
        }
        _ => panic!("mock server got unexpected line: {line:?}"),
    }
}

fn handle_frame(
    state: &Arc<State>,
    conn_id: u64,
    out: &mpsc::UnboundedSender<Vec<u8>>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Connect | ClientFrame::Pong => {}
        ClientFrame::Ping => {
            if state.answer_pings.load(Ordering::Acquire) {
                let _ = out.send(b"PONG\r\n".to_vec());
            }
        }
        ClientFrame::Sub { subject, queue, sid } => {
            state
                .subs
                .lock()
                .unwrap()
                .push(SubRec { conn_id, sid, subject, queue, max: None, delivered: 0 });
        }
        ClientFrame::Unsub { sid, max } => {
            let mut subs = state.subs.lock().unwrap();
            match max {
                None => subs.retain(|s| !(s.conn_id == conn_id && s.sid == sid)),
                Some(max) => {
                    if let Some(rec) =
                        subs.iter_mut().find(|s| s.conn_id == conn_id && s.sid == sid)
                    {
                        if rec.delivered >= max {
                            subs.retain(|s| !(s.conn_id == conn_id && s.sid == sid));
                        } else {
                            rec.max = Some(max);
                        }
                    }
                }
            }
        }
        ClientFrame::Pub { subject, reply, headers, payload } => {
            route(state, &subject, reply.as_deref(), headers.as_deref(), &payload);
        }
    }
}

/// Deliver a publish to every matching subscription, honoring queue groups
/// (one member per group) and auto-unsubscribe caps. A request that finds
/// no interest is answered with a 503 status frame to its reply subject.
fn route(
    state: &Arc<State>,
    subject: &str,
    reply: Option<&str>,
    headers: Option<&[u8]>,
    payload: &[u8],
) {
    let mut frames: Vec<(u64, Vec<u8>)> = Vec::new();
    {
        let mut subs = state.subs.lock().unwrap();
        let mut queues_served: Vec<String> = Vec::new();
        let mut matched = false;
        let mut expired: Vec<(u64, u64)> = Vec::new();

        for rec in subs.iter_mut() {
            if !subject::matches(&rec.subject, subject) {
                continue;
            }
            if let Some(queue) = &rec.queue {
                if queues_served.contains(queue) {
                    matched = true;
                    continue;
                }
                queues_served.push(queue.clone());
            }
            matched = true;
            frames.push((rec.conn_id, msg_frame(subject, rec.sid, reply, headers, payload)));
            rec.delivered += 1;
            if rec.max.is_some_and(|max| rec.delivered >= max) {
                expired.push((rec.conn_id, rec.sid));
            }
        }
        for (conn_id, sid) in expired {
            subs.retain(|s| !(s.conn_id == conn_id && s.sid == sid));
        }

        if let (false, Some(reply)) = (matched, reply) {
            // Nobody is listening: answer the requester with a 503.
            let status = b"NATS/1.0 503\r\n\r\n";
            for rec in subs.iter_mut() {
                if subject::matches(&rec.subject, reply) {
                    frames.push((rec.conn_id, msg_frame(reply, rec.sid, None, Some(status), b"")));
                    rec.delivered += 1;
                }
            }
        }
    }

    let conns = state.conns.lock().unwrap();
    for (conn_id, frame) in frames {
        if let Some(tx) = conns.get(&conn_id) {
            let _ = tx.send(frame);
        }
    }
}

fn msg_frame(
    subject: &str,
    sid: u64,
    reply: Option<&str>,
    headers: Option<&[u8]>,
    payload: &[u8],
) -> Vec<u8> {
    let reply_part = reply.map(|r| format!(" {r}")).unwrap_or_default();
    let mut frame = Vec::new();
    match headers {
        None => {
            frame.extend_from_slice(
                format!("MSG {subject} {sid}{reply_part} {}\r\n", payload.len()).as_bytes(),
            );
        }
        Some(block) => {
            frame.extend_from_slice(
                format!(
                    "HMSG {subject} {sid}{reply_part} {} {}\r\n",
                    block.len(),
                    block.len() + payload.len(),
                )
                .as_bytes(),
            );
            frame.extend_from_slice(block);
        }
    }
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Poll until the client reaches `state`, panicking after `wait`.
pub async fn wait_for_state(client: &natter::Client, state: natter::ConnectionState, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if client.state() == state {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("client did not reach {state} in {wait:?} (still {})", client.state());
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Await one specific event on an event channel, ignoring others.
pub async fn wait_for_event(
    rx: &mut mpsc::UnboundedReceiver<natter::Event>,
    wanted: natter::Event,
    wait: Duration,
) {
    let result = timeout(wait, async {
        while let Some(event) = rx.recv().await {
            if event == wanted {
                return;
            }
        }
        panic!("event channel closed while waiting for {wanted:?}");
    })
    .await;
    if result.is_err() {
        panic!("did not observe {wanted:?} within {wait:?}");
    }
}

/// A client option set wired to an event channel, with fast reconnects and
/// no randomization, suitable for most tests.
pub fn test_options(url: &str) -> (natter::ConnectOptions, mpsc::UnboundedReceiver<natter::Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let opts = natter::ConnectOptions::new()
        .server(url)
        .randomize(false)
        .max_reconnects(-1)
        .reconnect_wait(Duration::from_millis(50))
        .reconnect_jitter(Duration::ZERO)
        .event_listener(move |event| {
            let _ = tx.send(event);
        });
    (opts, rx)
}
