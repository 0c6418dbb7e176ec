// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! A framed connection: a [`Transport`] plus the incremental parser state,
//! turning the byte stream into [`ServerOp`] frames and frames back into
//! bytes.

use crate::error::Error;
use crate::pool::ServerAddr;
use crate::stats::Statistics;
use crate::transport::Transport;
use bytes::BytesMut;
use natter_proto::op::Frame;
use natter_proto::parser::{self, ServerOp};
use natter_proto::types::ServerInfo;
use natter_proto::ProtocolError;
use std::io;
use std::sync::Arc;
use tokio_rustls::rustls;

pub(crate) struct Connection {
    transport: Transport,
    buffer: BytesMut,
    stats: Arc<Statistics>,
}

impl Connection {
    pub(crate) fn new(transport: Transport, stats: Arc<Statistics>) -> Self {
        Connection { transport, buffer: BytesMut::with_capacity(4096), stats }
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    /// Read the next frame. `Ok(None)` means the server closed the stream
    /// cleanly between frames; closing mid-frame is a protocol error.
    pub(crate) async fn read_op(&mut self) -> Result<Option<ServerOp>, Error> {
        loop {
            if let Some(op) = parser::try_parse(&mut self.buffer)? {
                if matches!(op, ServerOp::Msg { .. }) {
                    self.stats.add_in_msg();
                }
                return Ok(Some(op));
            }

            let n = self.transport.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::UnexpectedEof);
            }
            self.stats.add_in_bytes(n as u64);
        }
    }

    /// Read the server's initial `INFO`. The line must be CRLF-terminated
    /// and nothing may follow it in the same read; anything else fails the
    /// handshake.
    pub(crate) async fn read_initial_info(&mut self) -> Result<ServerInfo, Error> {
        loop {
            if let Some(pos) = find_crlf(&self.buffer) {
                if pos + 2 != self.buffer.len() {
                    return Err(Error::StrayAfterInfo);
                }
                return match parser::try_parse(&mut self.buffer)? {
                    Some(ServerOp::Info(info)) => Ok(*info),
                    Some(_) | None => Err(Error::Protocol(ProtocolError::BadControlLine {
                        op: "handshake",
                        reason: "expected INFO as the first operation",
                    })),
                };
            }

            let n = self.transport.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(Error::UnexpectedEof);
            }
            self.stats.add_in_bytes(n as u64);
        }
    }

    /// Upgrade to TLS in place. Only callable while no parsed-but-unread
    /// bytes are pending, which the strict `INFO` read guarantees.
    pub(crate) async fn upgrade_tls(
        self,
        addr: &ServerAddr,
        config: Option<&Arc<rustls::ClientConfig>>,
    ) -> Result<Self, Error> {
        debug_assert!(self.buffer.is_empty());
        let transport = self.transport.upgrade_tls(addr, config).await?;
        Ok(Connection { transport, buffer: self.buffer, stats: self.stats })
    }

    /// Queue one frame for transmission.
    pub(crate) async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.transport.write_all(&frame.bytes).await?;
        self.stats.add_out_msg();
        self.stats.add_out_bytes(frame.len() as u64);
        Ok(())
    }

    /// Push queued bytes onto the wire.
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        self.transport.flush().await
    }

    /// Close the transport, flushing first on a best-effort basis.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.transport.flush().await;
        let _ = self.transport.shutdown().await;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn pair() -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let conn = Connection::new(
            Transport::from_io(Box::new(client), false),
            Arc::new(Statistics::default()),
        );
        (conn, server)
    }

    #[tokio::test]
    async fn initial_info_happy_path() {
        let (mut conn, mut server) = pair();
        server
            .write_all(b"INFO {\"server_id\":\"s1\",\"max_payload\":1024}\r\n")
            .await
            .unwrap();
        let info = conn.read_initial_info().await.unwrap();
        assert_eq!(info.server_id, "s1");
    }

    #[tokio::test]
    async fn initial_info_rejects_stray_bytes() {
        let (mut conn, mut server) = pair();
        server
            .write_all(b"INFO {\"server_id\":\"s1\"}\r\nPING\r\n")
            .await
            .unwrap();
        assert!(matches!(conn.read_initial_info().await, Err(Error::StrayAfterInfo)));
    }

    #[tokio::test]
    async fn initial_info_missing_crlf_fails_on_eof() {
        let (mut conn, mut server) = pair();
        server.write_all(b"INFO {\"server_id\":\"s1\"}").await.unwrap();
        drop(server);
        assert!(matches!(conn.read_initial_info().await, Err(Error::UnexpectedEof)));
    }

    #[tokio::test]
    async fn initial_info_must_be_info() {
        let (mut conn, mut server) = pair();
        server.write_all(b"PING\r\n").await.unwrap();
        assert!(matches!(conn.read_initial_info().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn read_op_handles_eof() {
        let (mut conn, mut server) = pair();
        server.write_all(b"PONG\r\n").await.unwrap();
        assert!(matches!(conn.read_op().await, Ok(Some(ServerOp::Pong))));

        drop(server);
        assert!(matches!(conn.read_op().await, Ok(None)));
    }

    #[tokio::test]
    async fn read_op_eof_mid_frame_is_an_error() {
        let (mut conn, mut server) = pair();
        server.write_all(b"MSG foo 1 100\r\nonly-part").await.unwrap();
        drop(server);
        assert!(matches!(conn.read_op().await, Err(Error::UnexpectedEof)));
    }
}
