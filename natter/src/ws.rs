// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! WebSocket transport: the line protocol carried inside binary frames.
//!
//! Writes accumulate until a flush, which emits one binary frame; this
//! keeps a control line and its payload inside a single frame the way
//! servers expect. Reads splice every incoming frame back into the byte
//! stream the parser consumes.

use crate::error::Error;
use crate::pool::ServerAddr;
use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub(crate) struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    write_buf: Vec<u8>,
    secure: bool,
}

impl WsTransport {
    pub(crate) async fn connect(addr: &ServerAddr) -> Result<Self, Error> {
        let url = addr.websocket_url();
        let (inner, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))?;
        Ok(WsTransport { inner, write_buf: Vec::new(), secure: addr.tls_required() })
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.secure
    }

    pub(crate) async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => {
                    buf.put_slice(&data);
                    return Ok(data.len());
                }
                Some(Ok(Message::Text(data))) => {
                    buf.put_slice(data.as_bytes());
                    return Ok(data.len());
                }
                // Ping/pong frames are answered by tungstenite itself on
                // the next write; nothing for the protocol layer to see.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(0),
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
    }

    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_buf.extend_from_slice(bytes);
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            let frame = std::mem::take(&mut self.write_buf);
            self.inner
                .send(Message::Binary(frame.into()))
                .await
                .map_err(io::Error::other)?;
        }
        self.inner.flush().await.map_err(io::Error::other)
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.close(None).await.map_err(io::Error::other)
    }
}
