// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! Connection configuration.
//!
//! [`ConnectOptions`] is a plain builder; every knob the engine honors is a
//! method here. A properties-map constructor is provided for configuration
//! sourced from flat string maps, mirroring the same keys.

use crate::error::Error;
use crate::events::{ErrorCallback, Event, EventCallback};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls;

/// Signs a server-provided nonce, returning the encoded signature to place
/// in the `CONNECT` frame. Key handling stays outside the core: the client
/// only consumes a ready-made signing function.
pub type Signer = Arc<dyn Fn(&[u8]) -> Result<String, Error> + Send + Sync>;

/// Computes the delay before a reconnect attempt, given the total number of
/// attempts made so far. Overrides the built-in wait/jitter distribution.
pub type ReconnectDelayHandler = Arc<dyn Fn(u64) -> Duration + Send + Sync>;

/// How the client authenticates itself in the `CONNECT` frame.
#[derive(Clone, Default)]
pub enum Auth {
    /// No credentials.
    #[default]
    None,
    /// A shared token.
    Token(
        /// The token.
        String,
    ),
    /// User name and password.
    UserPassword {
        /// The user name.
        user: String,
        /// The password.
        pass: String,
    },
    /// A JWT plus a signer over the server nonce.
    Jwt {
        /// The encoded JWT.
        jwt: String,
        /// Signs the server nonce.
        signer: Signer,
    },
    /// A public NKey plus a signer over the server nonce.
    NKey {
        /// The public key, in its encoded form.
        public_key: String,
        /// Signs the server nonce.
        signer: Signer,
    },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::None => f.write_str("Auth::None"),
            Auth::Token(_) => f.write_str("Auth::Token(..)"),
            Auth::UserPassword { user, .. } => {
                f.debug_struct("Auth::UserPassword").field("user", user).finish_non_exhaustive()
            }
            Auth::Jwt { .. } => f.write_str("Auth::Jwt(..)"),
            Auth::NKey { public_key, .. } => {
                f.debug_struct("Auth::NKey").field("public_key", public_key).finish_non_exhaustive()
            }
        }
    }
}

/// Options accepted by [`crate::Client::connect_with_options`] and
/// [`ConnectOptions::connect`].
pub struct ConnectOptions {
    pub(crate) servers: Vec<String>,
    pub(crate) name: Option<String>,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) randomize: bool,
    pub(crate) ignore_discovered: bool,
    pub(crate) max_reconnects: i32,
    pub(crate) reconnect_wait: Duration,
    pub(crate) reconnect_jitter: Duration,
    pub(crate) reconnect_jitter_tls: Duration,
    pub(crate) reconnect_delay_handler: Option<ReconnectDelayHandler>,
    pub(crate) connect_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_out: u32,
    pub(crate) request_cleanup_interval: Duration,
    pub(crate) max_control_line: usize,
    pub(crate) reconnect_buffer_size: i64,
    pub(crate) inbox_prefix: String,
    pub(crate) no_echo: bool,
    pub(crate) tls_required: bool,
    pub(crate) tls_first: bool,
    pub(crate) tls_config: Option<Arc<rustls::ClientConfig>>,
    pub(crate) headers_required: bool,
    pub(crate) client_side_limit_checks: bool,
    pub(crate) old_request_style: bool,
    pub(crate) cancel_on_no_responders: bool,
    pub(crate) default_request_timeout: Duration,
    pub(crate) reconnect_on_initial_connect: bool,
    pub(crate) auth: Auth,
    pub(crate) event_listener: Option<EventCallback>,
    pub(crate) error_listener: Option<ErrorCallback>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            servers: Vec::new(),
            name: None,
            verbose: false,
            pedantic: false,
            randomize: true,
            ignore_discovered: false,
            max_reconnects: 60,
            reconnect_wait: Duration::from_secs(2),
            reconnect_jitter: Duration::from_millis(100),
            reconnect_jitter_tls: Duration::from_secs(1),
            reconnect_delay_handler: None,
            connect_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(120),
            max_pings_out: 2,
            request_cleanup_interval: Duration::from_secs(5),
            max_control_line: 4096,
            reconnect_buffer_size: 8 * 1024 * 1024,
            inbox_prefix: "_INBOX".to_owned(),
            no_echo: false,
            tls_required: false,
            tls_first: false,
            tls_config: None,
            headers_required: false,
            client_side_limit_checks: true,
            old_request_style: false,
            cancel_on_no_responders: true,
            default_request_timeout: Duration::from_secs(5),
            reconnect_on_initial_connect: false,
            auth: Auth::None,
            event_listener: None,
            error_listener: None,
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("servers", &self.servers)
            .field("name", &self.name)
            .field("randomize", &self.randomize)
            .field("max_reconnects", &self.max_reconnects)
            .field("reconnect_wait", &self.reconnect_wait)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_out", &self.max_pings_out)
            .field("inbox_prefix", &self.inbox_prefix)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl ConnectOptions {
    /// Options with every knob at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one seed server URL. Recognized schemes are `nats://`, `tls://`,
    /// `opentls://`, `ws://` and `wss://`; a bare `host:port` is treated as
    /// `nats://`.
    pub fn server(mut self, url: impl Into<String>) -> Self {
        self.servers.push(url.into());
        self
    }

    /// Replace the seed server list.
    pub fn servers<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = urls.into_iter().map(Into::into).collect();
        self
    }

    /// A name for this connection, passed to the server.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Ask the server to acknowledge every protocol operation with `+OK`.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Ask the server for strict protocol checking.
    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// Whether to shuffle the server pool before each connect pass.
    /// Defaults to `true`.
    pub fn randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Ignore peer servers advertised in `INFO` frames and connect only to
    /// the configured seeds.
    pub fn ignore_discovered_servers(mut self, ignore: bool) -> Self {
        self.ignore_discovered = ignore;
        self
    }

    /// Per-server reconnect cap: a server failing this many consecutive
    /// attempts is pruned from the pool. `-1` retries forever, `0` disables
    /// reconnecting entirely. Defaults to 60.
    pub fn max_reconnects(mut self, max: i32) -> Self {
        self.max_reconnects = max;
        self
    }

    /// Base delay between reconnect attempts. Defaults to 2 seconds.
    pub fn reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    /// Upper bound of the uniform jitter added to the reconnect delay on
    /// plain connections. Defaults to 100ms.
    pub fn reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Upper bound of the uniform jitter added to the reconnect delay when
    /// the previous connection was TLS. Defaults to 1 second.
    pub fn reconnect_jitter_tls(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter_tls = jitter;
        self
    }

    /// Override the reconnect delay computation entirely. The handler
    /// receives the total number of attempts made so far.
    pub fn reconnect_delay_handler(
        mut self,
        handler: impl Fn(u64) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.reconnect_delay_handler = Some(Arc::new(handler));
        self
    }

    /// Budget for one connection attempt, handshake included. Defaults to
    /// 2 seconds.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Interval between liveness pings. A ping is skipped when other
    /// traffic arrived since the previous one. Defaults to 2 minutes.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// How many pings may remain unanswered before the connection is
    /// declared dead. Defaults to 2.
    pub fn max_pings_out(mut self, max: u32) -> Self {
        self.max_pings_out = max;
        self
    }

    /// How often expired pending requests are swept. Defaults to 5 seconds.
    pub fn request_cleanup_interval(mut self, interval: Duration) -> Self {
        self.request_cleanup_interval = interval;
        self
    }

    /// Maximum length of an outgoing control line. Defaults to 4096.
    pub fn max_control_line(mut self, max: usize) -> Self {
        self.max_control_line = max;
        self
    }

    /// Byte budget for user publishes buffered while reconnecting.
    /// Negative means unbounded, zero buffers nothing. Defaults to 8 MiB.
    pub fn reconnect_buffer_size(mut self, bytes: i64) -> Self {
        self.reconnect_buffer_size = bytes;
        self
    }

    /// Prefix for reply inboxes. Defaults to `_INBOX`.
    pub fn inbox_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inbox_prefix = prefix.into();
        self
    }

    /// Opt out of receiving this client's own publishes on its matching
    /// subscriptions.
    pub fn no_echo(mut self, no_echo: bool) -> Self {
        self.no_echo = no_echo;
        self
    }

    /// Require the connection to be upgraded to TLS, whatever the server
    /// advertises.
    pub fn tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }

    /// Negotiate TLS before the server's `INFO`, rather than upgrading
    /// afterwards.
    pub fn tls_first(mut self, first: bool) -> Self {
        self.tls_first = first;
        self
    }

    /// The TLS configuration to use for upgrades. Building one (roots,
    /// client certs) is up to the caller.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Fail the connection when the server does not support message
    /// headers.
    pub fn headers_required(mut self, required: bool) -> Self {
        self.headers_required = required;
        self
    }

    /// Check payload sizes client-side against the server-advertised
    /// maximum. Defaults to `true`.
    pub fn client_side_limit_checks(mut self, checks: bool) -> Self {
        self.client_side_limit_checks = checks;
        self
    }

    /// Use one short-lived subscription per request instead of the shared
    /// inbox.
    pub fn old_request_style(mut self, old_style: bool) -> Self {
        self.old_request_style = old_style;
        self
    }

    /// Cancel request futures with [`Error::NoResponders`] when the server
    /// answers with a 503 status. Defaults to `true`.
    pub fn cancel_on_no_responders(mut self, cancel: bool) -> Self {
        self.cancel_on_no_responders = cancel;
        self
    }

    /// Timeout applied to [`crate::Client::request`] when none is given
    /// explicitly. Defaults to 5 seconds.
    pub fn default_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }

    /// Treat a failure of the very first connect like a disconnect: return
    /// a client immediately and keep trying in the background.
    pub fn reconnect_on_initial_connect(mut self, reconnect: bool) -> Self {
        self.reconnect_on_initial_connect = reconnect;
        self
    }

    /// Credentials to present in the `CONNECT` frame.
    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    /// Register a callback receiving every [`Event`]. It runs on a
    /// dedicated task, so it may block without stalling the connection.
    pub fn event_listener(mut self, listener: impl FnMut(Event) + Send + 'static) -> Self {
        self.event_listener = Some(Box::new(listener));
        self
    }

    /// Register a callback receiving asynchronous errors the engine cannot
    /// surface through any return value.
    pub fn error_listener(mut self, listener: impl FnMut(&Error) + Send + 'static) -> Self {
        self.error_listener = Some(Box::new(listener));
        self
    }

    /// Build options from a flat string map. The recognized keys mirror the
    /// builder methods: `servers` (comma separated), `name`, `verbose`,
    /// `pedantic`, `randomize`, `ignore-discovered`, `max-reconnects`,
    /// `reconnect-wait`, `reconnect-jitter`, `reconnect-jitter-tls`,
    /// `connect-timeout`, `ping-interval`, `max-pings-out`,
    /// `request-cleanup-interval`, `max-control-line`,
    /// `reconnect-buffer-size`, `inbox-prefix`, `no-echo`, `tls-required`,
    /// `tls-first`, `headers-required`, `client-side-limit-checks`,
    /// `old-request-style`, `cancel-on-no-responders`, `request-timeout`
    /// and `reconnect-on-initial-connect`. Durations are integral
    /// milliseconds.
    pub fn from_properties(map: &HashMap<String, String>) -> Result<Self, Error> {
        let mut opts = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "servers" => {
                    opts.servers =
                        value.split(',').map(|s| s.trim().to_owned()).filter(|s| !s.is_empty()).collect();
                }
                "name" => opts.name = Some(value.clone()),
                "verbose" => opts.verbose = parse_bool(key, value)?,
                "pedantic" => opts.pedantic = parse_bool(key, value)?,
                "randomize" => opts.randomize = parse_bool(key, value)?,
                "ignore-discovered" => opts.ignore_discovered = parse_bool(key, value)?,
                "max-reconnects" => opts.max_reconnects = parse_num(key, value)?,
                "reconnect-wait" => opts.reconnect_wait = parse_millis(key, value)?,
                "reconnect-jitter" => opts.reconnect_jitter = parse_millis(key, value)?,
                "reconnect-jitter-tls" => opts.reconnect_jitter_tls = parse_millis(key, value)?,
                "connect-timeout" => opts.connect_timeout = parse_millis(key, value)?,
                "ping-interval" => opts.ping_interval = parse_millis(key, value)?,
                "max-pings-out" => opts.max_pings_out = parse_num(key, value)?,
                "request-cleanup-interval" => {
                    opts.request_cleanup_interval = parse_millis(key, value)?;
                }
                "max-control-line" => opts.max_control_line = parse_num(key, value)?,
                "reconnect-buffer-size" => opts.reconnect_buffer_size = parse_num(key, value)?,
                "inbox-prefix" => opts.inbox_prefix = value.clone(),
                "no-echo" => opts.no_echo = parse_bool(key, value)?,
                "tls-required" => opts.tls_required = parse_bool(key, value)?,
                "tls-first" => opts.tls_first = parse_bool(key, value)?,
                "headers-required" => opts.headers_required = parse_bool(key, value)?,
                "client-side-limit-checks" => {
                    opts.client_side_limit_checks = parse_bool(key, value)?;
                }
                "old-request-style" => opts.old_request_style = parse_bool(key, value)?,
                "cancel-on-no-responders" => {
                    opts.cancel_on_no_responders = parse_bool(key, value)?;
                }
                "request-timeout" => opts.default_request_timeout = parse_millis(key, value)?,
                "reconnect-on-initial-connect" => {
                    opts.reconnect_on_initial_connect = parse_bool(key, value)?;
                }
                other => {
                    return Err(Error::Configuration(format!("unrecognized property '{other}'")));
                }
            }
        }
        Ok(opts)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    value
        .parse()
        .map_err(|_| Error::Configuration(format!("property '{key}' is not a boolean: '{value}'")))
}

fn parse_num<N: std::str::FromStr>(key: &str, value: &str) -> Result<N, Error> {
    value
        .parse()
        .map_err(|_| Error::Configuration(format!("property '{key}' is not a number: '{value}'")))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, Error> {
    parse_num(key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_round_trip() {
        let map: HashMap<String, String> = [
            ("servers", "nats://a:4222, nats://b:4223"),
            ("randomize", "false"),
            ("max-reconnects", "-1"),
            ("reconnect-wait", "250"),
            ("reconnect-jitter", "0"),
            ("max-pings-out", "5"),
            ("reconnect-buffer-size", "1024"),
            ("inbox-prefix", "_REPLIES"),
            ("no-echo", "true"),
            ("old-request-style", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let opts = ConnectOptions::from_properties(&map).unwrap();
        assert_eq!(opts.servers, vec!["nats://a:4222".to_owned(), "nats://b:4223".to_owned()]);
        assert!(!opts.randomize);
        assert_eq!(opts.max_reconnects, -1);
        assert_eq!(opts.reconnect_wait, Duration::from_millis(250));
        assert_eq!(opts.reconnect_jitter, Duration::ZERO);
        assert_eq!(opts.max_pings_out, 5);
        assert_eq!(opts.reconnect_buffer_size, 1024);
        assert_eq!(opts.inbox_prefix, "_REPLIES");
        assert!(opts.no_echo);
        assert!(opts.old_request_style);
    }

    #[test]
    fn properties_reject_unknown_keys_and_bad_values() {
        let map: HashMap<String, String> =
            [("not-a-real-key".to_owned(), "x".to_owned())].into_iter().collect();
        assert!(matches!(
            ConnectOptions::from_properties(&map),
            Err(Error::Configuration(_)),
        ));

        let map: HashMap<String, String> =
            [("max-pings-out".to_owned(), "many".to_owned())].into_iter().collect();
        assert!(matches!(
            ConnectOptions::from_properties(&map),
            Err(Error::Configuration(_)),
        ));
    }
}
