// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The outgoing frame buffer.
//!
//! Two queues with different guarantees: the internal queue carries
//! protocol operations (`CONNECT`, `SUB`, `UNSUB`, `PING`, `PONG`) and is
//! never dropped; the user queue carries publishes and is byte-capped while
//! the connection is away. Within each queue, submission order is
//! transmission order, and when a replacement connection comes up the
//! internal queue (resubscriptions included) drains before any buffered
//! user frame.

use crate::connection::Connection;
use crate::error::Error;
use natter_proto::op::Frame;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct Writer {
    internal: VecDeque<Frame>,
    user: VecDeque<Frame>,
    user_bytes: usize,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enforce the control-line cap on a frame about to be queued.
    pub(crate) fn check_control_line(frame: &Frame, max: usize) -> Result<(), Error> {
        if max > 0 && frame.control_line_len > max {
            return Err(Error::ControlLineTooLong { max });
        }
        Ok(())
    }

    /// Whether `len` more buffered user bytes would still fit the budget.
    /// A negative budget is unbounded, zero admits nothing.
    pub(crate) fn fits_reconnect_budget(buffered: &AtomicUsize, len: usize, budget: i64) -> bool {
        if budget < 0 {
            return true;
        }
        buffered.load(Ordering::Acquire) + len <= budget as usize
    }

    pub(crate) fn enqueue_internal(&mut self, frame: Frame) {
        self.internal.push_back(frame);
    }

    /// Queue a user frame. `prereserved` marks frames whose bytes were
    /// already added to `buffered` by the publishing thread.
    pub(crate) fn enqueue_user(&mut self, frame: Frame, prereserved: bool, buffered: &AtomicUsize) {
        if !prereserved {
            buffered.fetch_add(frame.len(), Ordering::AcqRel);
        }
        self.user_bytes += frame.len();
        self.user.push_back(frame);
    }

    /// Bytes of user frames currently queued.
    pub(crate) fn user_backlog(&self) -> usize {
        self.user_bytes
    }

    /// Write both queues out, internal first, and flush the transport.
    /// On error the unsent frames stay queued.
    pub(crate) async fn flush_to(
        &mut self,
        conn: &mut Connection,
        buffered: &AtomicUsize,
    ) -> io::Result<()> {
        while let Some(frame) = self.internal.front() {
            conn.write_frame(frame).await?;
            self.internal.pop_front();
        }
        while let Some(frame) = self.user.front() {
            conn.write_frame(frame).await?;
            let frame = self.user.pop_front().expect("front() just returned it; qed");
            self.user_bytes -= frame.len();
            buffered.fetch_sub(frame.len(), Ordering::AcqRel);
        }
        conn.flush().await
    }

    /// Drop connection-scoped internal operations after a disconnect; they
    /// are regenerated for the replacement connection. Buffered user
    /// frames are kept.
    pub(crate) fn reset_for_reconnect(&mut self) {
        self.internal.clear();
    }

    /// Drop everything, releasing the byte reservations of the user queue.
    pub(crate) fn clear(&mut self, buffered: &AtomicUsize) {
        self.internal.clear();
        buffered.fetch_sub(self.user_bytes, Ordering::AcqRel);
        self.user.clear();
        self.user_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statistics;
    use crate::transport::Transport;
    use bytes::Bytes;
    use natter_proto::op::{encode, ClientOp};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn frame(op: &ClientOp) -> Frame {
        encode(op).unwrap()
    }

    fn publish(subject: &str, payload: &'static [u8]) -> Frame {
        frame(&ClientOp::Publish {
            subject: subject.to_owned(),
            reply: None,
            headers: None,
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn control_line_cap() {
        let frame = publish("some.subject", b"x");
        assert!(Writer::check_control_line(&frame, 4096).is_ok());
        assert!(matches!(
            Writer::check_control_line(&frame, 8),
            Err(Error::ControlLineTooLong { max: 8 }),
        ));
    }

    #[test]
    fn reconnect_budget() {
        let buffered = AtomicUsize::new(0);
        assert!(Writer::fits_reconnect_budget(&buffered, 100, 100));
        assert!(!Writer::fits_reconnect_budget(&buffered, 101, 100));
        assert!(Writer::fits_reconnect_budget(&buffered, usize::MAX, -1));
        assert!(!Writer::fits_reconnect_budget(&buffered, 1, 0));

        buffered.store(50, Ordering::Release);
        assert!(Writer::fits_reconnect_budget(&buffered, 50, 100));
        assert!(!Writer::fits_reconnect_budget(&buffered, 51, 100));
    }

    #[tokio::test]
    async fn internal_drains_before_user_and_order_is_kept() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut conn = Connection::new(
            Transport::from_io(Box::new(client), false),
            Arc::new(Statistics::default()),
        );

        let buffered = AtomicUsize::new(0);
        let mut writer = Writer::new();

        // User frames queued first...
        writer.enqueue_user(publish("a", b"1"), false, &buffered);
        writer.enqueue_user(publish("b", b"2"), false, &buffered);
        // ...internal afterwards; the wire still sees internal first.
        writer.enqueue_internal(frame(&ClientOp::Subscribe {
            sid: 1,
            subject: "a".to_owned(),
            queue: None,
        }));

        assert!(writer.user_backlog() > 0);
        writer.flush_to(&mut conn, &buffered).await.unwrap();
        assert_eq!(writer.user_backlog(), 0);
        assert_eq!(buffered.load(Ordering::Acquire), 0);

        let mut out = vec![0u8; "SUB a 1\r\nPUB a 1\r\n1\r\nPUB b 1\r\n2\r\n".len()];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "SUB a 1\r\nPUB a 1\r\n1\r\nPUB b 1\r\n2\r\n");
    }

    #[test]
    fn clear_releases_reservations() {
        let buffered = AtomicUsize::new(0);
        let mut writer = Writer::new();
        let f = publish("a", b"abc");
        let len = f.len();
        writer.enqueue_user(f, false, &buffered);
        assert_eq!(buffered.load(Ordering::Acquire), len);
        writer.clear(&buffered);
        assert_eq!(buffered.load(Ordering::Acquire), 0);
        assert_eq!(writer.user_backlog(), 0);
    }
}
