// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The byte-oriented channel underneath the protocol: plain TCP, TCP
//! upgraded to TLS in place, or (behind the `websocket` feature) a
//! WebSocket carrying the protocol in binary frames.

use crate::error::Error;
use crate::pool::ServerAddr;
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

/// Supertrait enabling a trait object holding either a TLS or a plain
/// `TcpStream` (or, in tests, an in-memory duplex stream).
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

/// Blanket implementation that applies to TLS and non-TLS streams alike.
impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A full-duplex byte channel to one server.
pub(crate) enum Transport {
    /// A TCP stream, possibly upgraded to TLS.
    Tcp {
        /// The stream; writes are buffered until [`Transport::flush`].
        io: BufWriter<Box<dyn AsyncReadWrite>>,
        /// Whether a TLS upgrade has happened.
        secure: bool,
    },
    /// A WebSocket connection; each flush emits one binary frame.
    #[cfg(feature = "websocket")]
    Ws(crate::ws::WsTransport),
}

impl Transport {
    /// Open a transport to `addr`. No TLS upgrade happens here; the
    /// handshake decides when (and whether) to call [`Transport::upgrade_tls`].
    pub(crate) async fn connect(addr: &ServerAddr) -> Result<Self, Error> {
        #[cfg(feature = "websocket")]
        if addr.is_websocket() {
            return Ok(Transport::Ws(crate::ws::WsTransport::connect(addr).await?));
        }
        #[cfg(not(feature = "websocket"))]
        if addr.is_websocket() {
            return Err(Error::Configuration(
                "websocket URLs need the 'websocket' feature".to_owned(),
            ));
        }

        let stream = TcpStream::connect((addr.host(), addr.port())).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_io(Box::new(stream), false))
    }

    /// Wrap an already-open byte stream. This is the injection seam the
    /// tests use to drive the engine over an in-memory duplex pipe.
    pub(crate) fn from_io(io: Box<dyn AsyncReadWrite>, secure: bool) -> Self {
        Transport::Tcp { io: BufWriter::new(io), secure }
    }

    /// Upgrade the channel to TLS in place. Only meaningful for TCP; the
    /// WebSocket variant negotiates TLS while connecting (`wss://`).
    pub(crate) async fn upgrade_tls(
        self,
        addr: &ServerAddr,
        config: Option<&Arc<rustls::ClientConfig>>,
    ) -> Result<Self, Error> {
        match self {
            Transport::Tcp { io, secure } => {
                if secure {
                    return Ok(Transport::Tcp { io, secure });
                }
                let config = config.ok_or_else(|| {
                    Error::Configuration("a TLS upgrade needs a tls_config".to_owned())
                })?;
                let domain = rustls::pki_types::ServerName::try_from(addr.host().to_owned())
                    .map_err(|_| {
                        Error::Configuration(format!(
                            "cannot use '{}' as a TLS server name",
                            addr.host(),
                        ))
                    })?;
                let connector = TlsConnector::from(config.clone());
                let tls = connector.connect(domain, io).await?;
                Ok(Transport::Tcp { io: BufWriter::new(Box::new(tls)), secure: true })
            }
            #[cfg(feature = "websocket")]
            Transport::Ws(ws) => Ok(Transport::Ws(ws)),
        }
    }

    /// Whether the channel is encrypted.
    pub(crate) fn is_secure(&self) -> bool {
        match self {
            Transport::Tcp { secure, .. } => *secure,
            #[cfg(feature = "websocket")]
            Transport::Ws(ws) => ws.is_secure(),
        }
    }

    /// Read whatever the server sent, appending it to `buf`. Returns the
    /// number of bytes read; zero means the stream ended.
    pub(crate) async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Transport::Tcp { io, .. } => io.read_buf(buf).await,
            #[cfg(feature = "websocket")]
            Transport::Ws(ws) => ws.read_buf(buf).await,
        }
    }

    /// Queue `bytes` for transmission.
    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Transport::Tcp { io, .. } => io.write_all(bytes).await,
            #[cfg(feature = "websocket")]
            Transport::Ws(ws) => ws.write_all(bytes).await,
        }
    }

    /// Push everything queued onto the wire.
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp { io, .. } => io.flush().await,
            #[cfg(feature = "websocket")]
            Transport::Ws(ws) => ws.flush().await,
        }
    }

    /// Close the channel.
    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp { io, .. } => io.shutdown().await,
            #[cfg(feature = "websocket")]
            Transport::Ws(ws) => ws.shutdown().await,
        }
    }
}
