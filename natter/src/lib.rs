// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! A client for the NATS text-line messaging protocol.
//!
//! The crate is built around a connection engine that maintains one live
//! transport to a server chosen from a pool of candidates, multiplexes any
//! number of subscriptions and requests over it, keeps the link alive with
//! application-level pings, and transparently reconnects (resubscribing and
//! replaying buffered publishes) when the transport fails. Graceful
//! shutdown is available through [`Client::drain`].
//!
//! # Example
//!
//! ```no_run
//! #[tokio::main]
//! async fn main() -> Result<(), natter::Error> {
//!     let client = natter::connect("nats://127.0.0.1:4222").await?;
//!
//!     let mut sub = client.subscribe("greet.*")?;
//!     client.publish("greet.joe", "hello")?;
//!
//!     if let Some(message) = sub.next().await {
//!         println!("{}: {:?}", message.subject, message.payload);
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! Everything user-visible hangs off [`Client`]; construction goes through
//! [`connect`] or [`ConnectOptions`]. The wire layer lives in
//! [`natter_proto`], re-exported as [`proto`].

#![deny(missing_docs)]

mod client;
mod connection;
mod dispatcher;
mod engine;
mod error;
mod events;
mod message;
mod options;
mod pool;
mod request;
mod stats;
mod subscription;
mod transport;
mod writer;

#[cfg(feature = "websocket")]
mod ws;

pub use client::Client;
pub use dispatcher::Dispatcher;
pub use engine::ConnectionState;
pub use error::Error;
pub use events::Event;
pub use message::Message;
pub use options::{Auth, ConnectOptions, ReconnectDelayHandler, Signer};
pub use stats::Statistics;
pub use subscription::{
    HandlerSubscription, MessageFilter, MessageHandler, SubscribeOptions, Subscription,
    DEFAULT_MAX_PENDING_BYTES, DEFAULT_MAX_PENDING_MSGS,
};

/// The wire-protocol layer: parser, serializer, header codec, subjects.
pub use natter_proto as proto;
pub use natter_proto::{HeaderMap, Status};

/// A re-export of the `rustls` crate used by this crate, for building the
/// configuration handed to [`ConnectOptions::tls_config`].
pub use tokio_rustls::rustls;

/// Connect to a server with default options.
pub async fn connect(url: impl Into<String>) -> Result<Client, Error> {
    ConnectOptions::new().server(url).connect().await
}
