// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The pool of candidate servers: configured seeds plus server-advertised
//! peers, minus entries pruned for failing too often.

use crate::error::Error;
use rand::seq::SliceRandom;
use url::Url;

/// The transport flavor a server URL asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scheme {
    /// Plain TCP, may be upgraded to TLS when required.
    Nats,
    /// TCP with a mandatory TLS upgrade.
    Tls,
    /// TCP with a mandatory TLS upgrade using a caller-supplied dev-trust
    /// configuration.
    OpenTls,
    /// WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

/// One parsed server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerAddr {
    raw: String,
    scheme: Scheme,
    host: String,
    port: u16,
}

impl ServerAddr {
    /// Parse a URL; a bare `host:port` (or bare `host`) is read as
    /// `nats://host:port`, and the port defaults to 4222.
    pub(crate) fn parse(input: &str) -> Result<Self, Error> {
        let with_scheme;
        let input = if input.contains("://") {
            input
        } else {
            with_scheme = format!("nats://{input}");
            &with_scheme
        };

        let url = Url::parse(input).map_err(|_| Error::InvalidServerUrl(input.to_owned()))?;
        let scheme = match url.scheme() {
            "nats" => Scheme::Nats,
            "tls" => Scheme::Tls,
            "opentls" => Scheme::OpenTls,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            _ => return Err(Error::InvalidServerUrl(input.to_owned())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidServerUrl(input.to_owned()))?
            .to_owned();
        let port = url.port().unwrap_or(4222);
        let raw = format!("{}://{host}:{port}", url.scheme());
        Ok(ServerAddr { raw, scheme, host, port })
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Whether this URL insists on an encrypted channel.
    pub(crate) fn tls_required(&self) -> bool {
        matches!(self.scheme, Scheme::Tls | Scheme::OpenTls | Scheme::Wss)
    }

    pub(crate) fn is_websocket(&self) -> bool {
        matches!(self.scheme, Scheme::Ws | Scheme::Wss)
    }

    /// The URL handed to the WebSocket connector.
    #[cfg(feature = "websocket")]
    pub(crate) fn websocket_url(&self) -> String {
        let scheme = if matches!(self.scheme, Scheme::Wss) { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug)]
struct ServerEntry {
    addr: ServerAddr,
    fails: u32,
    auth_error: Option<String>,
    pruned: bool,
}

/// What a recorded connection failure means for the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FailureDisposition {
    /// This server has now rejected our credentials twice in a row.
    pub double_auth: bool,
    /// This server hit its per-server failure cap and left the pool.
    pub pruned: bool,
}

/// The ordered candidate list the reconnect loop walks.
#[derive(Debug)]
pub(crate) struct ServerPool {
    entries: Vec<ServerEntry>,
    randomize: bool,
    ignore_discovered: bool,
    max_reconnects: i32,
    current: Option<ServerAddr>,
}

impl ServerPool {
    /// Build the pool from the configured seeds. An empty seed list means
    /// the conventional local server.
    pub(crate) fn new(
        seeds: &[String],
        randomize: bool,
        ignore_discovered: bool,
        max_reconnects: i32,
    ) -> Result<Self, Error> {
        let mut pool = ServerPool {
            entries: Vec::new(),
            randomize,
            ignore_discovered,
            max_reconnects,
            current: None,
        };
        if seeds.is_empty() {
            pool.add(ServerAddr::parse("nats://127.0.0.1:4222")?);
        }
        for seed in seeds {
            pool.add(ServerAddr::parse(seed)?);
        }
        Ok(pool)
    }

    fn add(&mut self, addr: ServerAddr) {
        if self.entries.iter().any(|e| e.addr == addr) {
            return;
        }
        self.entries.push(ServerEntry { addr, fails: 0, auth_error: None, pruned: false });
    }

    /// The candidates for the next connect pass: every non-pruned entry,
    /// shuffled when configured to, with the server we were just connected
    /// to rotated to the back so it is tried last.
    pub(crate) fn candidates(&self) -> Vec<ServerAddr> {
        let mut list: Vec<ServerAddr> = self
            .entries
            .iter()
            .filter(|e| !e.pruned && Some(&e.addr) != self.current.as_ref())
            .map(|e| e.addr.clone())
            .collect();
        if self.randomize {
            list.shuffle(&mut rand::thread_rng());
        }
        if let Some(current) = &self.current {
            if self.entries.iter().any(|e| !e.pruned && e.addr == *current) {
                list.push(current.clone());
            }
        }
        list
    }

    /// Whether nothing is left to try.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.entries.iter().all(|e| e.pruned)
    }

    pub(crate) fn record_success(&mut self, addr: &ServerAddr) {
        self.current = Some(addr.clone());
        if let Some(entry) = self.entries.iter_mut().find(|e| e.addr == *addr) {
            entry.fails = 0;
            entry.auth_error = None;
            entry.pruned = false;
        }
    }

    /// Record a failed attempt against `addr`. `auth_error` carries the
    /// server's error text when the failure was an authentication one.
    pub(crate) fn record_failure(
        &mut self,
        addr: &ServerAddr,
        auth_error: Option<&str>,
    ) -> FailureDisposition {
        let Some(entry) = self.entries.iter_mut().find(|e| e.addr == *addr) else {
            return FailureDisposition { double_auth: false, pruned: false };
        };

        entry.fails += 1;
        let double_auth = match auth_error {
            Some(text) => {
                let repeated = entry.auth_error.is_some();
                entry.auth_error = Some(text.to_owned());
                repeated
            }
            None => false,
        };
        if self.max_reconnects > 0 && entry.fails >= self.max_reconnects as u32 {
            entry.pruned = true;
        }
        FailureDisposition { double_auth, pruned: entry.pruned }
    }

    /// Fold a freshly advertised peer list into the pool. Unknown URLs are
    /// added; pruned entries named again are re-admitted. Returns whether
    /// anything changed.
    pub(crate) fn merge_discovered(&mut self, urls: &[String]) -> bool {
        if self.ignore_discovered {
            return false;
        }
        let mut changed = false;
        for url in urls {
            let Ok(addr) = ServerAddr::parse(url) else {
                tracing::debug!("ignoring unparseable discovered server '{url}'");
                continue;
            };
            match self.entries.iter_mut().find(|e| e.addr == addr) {
                Some(entry) => {
                    if entry.pruned {
                        entry.pruned = false;
                        entry.fails = 0;
                        changed = true;
                    }
                }
                None => {
                    self.add(addr);
                    changed = true;
                }
            }
        }
        changed
    }

    /// The non-pruned URLs currently in the pool, in insertion order.
    #[cfg(test)]
    pub(crate) fn urls(&self) -> Vec<String> {
        self.entries.iter().filter(|e| !e.pruned).map(|e| e.addr.raw.clone()).collect()
    }
}
