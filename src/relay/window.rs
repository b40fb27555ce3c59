//! Per-stream flow control.
//!
//! Each stream owns a [`LocalWindow`] that bounds how many unread bytes the
//! peer may push at us, and a [`RemoteWindow`] that mirrors the peer's
//! budget for our writes. Reading from the local window frees budget that
//! the stream returns to the peer with ACK frames; ACKs from the peer grow
//! the remote window and wake blocked writers.

use std::collections::VecDeque;
use std::future::Future;
use std::io;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::{MAX_FWD_PAYLOAD_LEN, WindowError};

struct LocalState {
    remaining: i64,
    buf: VecDeque<u8>,
    closed: bool,
}

/// Inbound budget and buffer of one stream.
pub struct LocalWindow {
    max: usize,
    state: Mutex<LocalState>,
    notify: Notify,
}

impl LocalWindow {
    /// Create a window advertising `max` bytes.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            state: Mutex::new(LocalState {
                remaining: max as i64,
                buf: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Advertised maximum.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Budget left for the peer.
    pub fn remaining(&self) -> i64 {
        self.state.lock().remaining
    }

    /// Number of buffered, unread bytes.
    pub fn buffered(&self) -> usize {
        self.state.lock().buf.len()
    }

    /// Accept a FWD payload from the peer.
    ///
    /// A payload larger than the remaining budget is a protocol violation;
    /// the window is left untouched and the caller tears the stream down.
    pub fn enqueue(&self, data: &[u8]) -> Result<(), WindowError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(WindowError::Closed);
            }
            let remaining = state.remaining - data.len() as i64;
            if remaining < 0 || remaining > self.max as i64 {
                return Err(WindowError::Violation {
                    remaining,
                    max: self.max,
                });
            }
            state.remaining = remaining;
            state.buf.extend(data);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Read buffered bytes, waiting while the buffer is empty.
    ///
    /// Returns the number of bytes copied, which is also the budget restored
    /// to the peer. `Ok(0)` means the window is closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, WindowError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if !state.buf.is_empty() {
                    let n = buf.len().min(state.buf.len());
                    for (dst, src) in buf.iter_mut().zip(state.buf.drain(..n)) {
                        *dst = src;
                    }
                    state.remaining += n as i64;
                    return Ok(n);
                }
                if state.closed {
                    return Ok(0);
                }
            }

            notified.await;
        }
    }

    /// Close the window. Buffered bytes stay readable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether the window has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

struct RemoteState {
    remaining: i64,
    closed: bool,
}

/// Our record of the peer's inbound budget.
pub struct RemoteWindow {
    max: usize,
    state: Mutex<RemoteState>,
    notify: Notify,
    write_lock: tokio::sync::Mutex<()>,
}

impl RemoteWindow {
    /// Create a window for a peer that advertised `max` bytes.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            state: Mutex::new(RemoteState {
                remaining: max as i64,
                closed: false,
            }),
            notify: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Advertised maximum.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Budget left for our writes.
    pub fn remaining(&self) -> i64 {
        self.state.lock().remaining
    }

    /// Apply an ACK of `n` bytes from the peer.
    pub fn grow(&self, n: usize) -> Result<(), WindowError> {
        {
            let mut state = self.state.lock();
            let remaining = state.remaining + n as i64;
            if remaining < 0 || remaining > self.max as i64 {
                return Err(WindowError::OutOfRange {
                    remaining,
                    max: self.max,
                });
            }
            state.remaining = remaining;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Send `data` through `send`, one chunk per available window.
    ///
    /// Each chunk is at most `min(left, remaining, 65535)` bytes and is
    /// charged to the window before it is handed to `send`. Concurrent
    /// writers are serialized so their bytes do not interleave.
    pub async fn write<F, Fut>(&self, data: &[u8], mut send: F) -> Result<usize, WindowError>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let _guard = self.write_lock.lock().await;
        let mut written = 0;
        while written < data.len() {
            let take = self.reserve(data.len() - written).await?;
            send(data[written..written + take].to_vec()).await?;
            written += take;
        }
        Ok(written)
    }

    async fn reserve(&self, want: usize) -> Result<usize, WindowError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(WindowError::Closed);
                }
                if state.remaining > 0 {
                    let take = want
                        .min(state.remaining as usize)
                        .min(MAX_FWD_PAYLOAD_LEN);
                    state.remaining -= take as i64;
                    return Ok(take);
                }
            }

            notified.await;
        }
    }

    /// Close the window, failing blocked and future writers.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}

/// Split a restored byte count into ACK-sized pieces.
pub fn ack_chunks(mut n: usize) -> impl Iterator<Item = u16> {
    std::iter::from_fn(move || {
        if n == 0 {
            return None;
        }
        let chunk = n.min(u16::MAX as usize);
        n -= chunk;
        Some(chunk as u16)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn test_local_violation_leaves_state_untouched() {
        let lw = LocalWindow::new(10);
        lw.enqueue(&[1; 6]).unwrap();

        let err = lw.enqueue(&[2; 5]).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(lw.remaining(), 4);
        assert_eq!(lw.buffered(), 6);
    }

    #[tokio::test]
    async fn test_local_read_restores_budget() {
        let lw = LocalWindow::new(8);
        lw.enqueue(b"abcdefgh").unwrap();
        assert_eq!(lw.remaining(), 0);

        let mut buf = [0u8; 3];
        assert_eq!(lw.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(lw.remaining(), 3);
        lw.enqueue(b"xyz").unwrap();
        assert_eq!(lw.remaining(), 0);
    }

    #[tokio::test]
    async fn test_local_close_drains_before_eof() {
        let lw = LocalWindow::new(8);
        lw.enqueue(b"hi").unwrap();
        lw.close();

        let mut buf = [0u8; 8];
        assert_eq!(lw.read(&mut buf).await.unwrap(), 2);
        assert_eq!(lw.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(lw.enqueue(b"x"), Err(WindowError::Closed)));
    }

    #[tokio::test]
    async fn test_local_read_waits_for_data() {
        let lw = Arc::new(LocalWindow::new(8));
        let reader = {
            let lw = Arc::clone(&lw);
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                let n = lw.read(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        lw.enqueue(b"ok").unwrap();
        assert_eq!(reader.await.unwrap(), b"ok");
    }

    #[test]
    fn test_remote_grow_out_of_range() {
        let rw = RemoteWindow::new(10);
        let err = rw.grow(1).unwrap_err();
        assert!(matches!(err, WindowError::OutOfRange { remaining: 11, max: 10 }));
        assert_eq!(rw.remaining(), 10);
    }

    #[tokio::test]
    async fn test_remote_write_blocks_until_ack() {
        let rw = Arc::new(RemoteWindow::new(4));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let writer = {
            let rw = Arc::clone(&rw);
            tokio::spawn(async move {
                rw.write(b"abcdef", |chunk| {
                    let tx = tx.clone();
                    async move {
                        tx.send(chunk).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
                    }
                })
                .await
            })
        };

        assert_eq!(rx.recv().await.unwrap(), b"abcd");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert_eq!(rw.remaining(), 0);

        rw.grow(4).unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"ef");
        assert_eq!(writer.await.unwrap().unwrap(), 6);
        assert_eq!(rw.remaining(), 2);
    }

    #[tokio::test]
    async fn test_remote_close_fails_blocked_writer() {
        let rw = Arc::new(RemoteWindow::new(1));
        let writer = {
            let rw = Arc::clone(&rw);
            tokio::spawn(async move { rw.write(b"ab", |_| async { Ok(()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        rw.close();
        assert!(matches!(writer.await.unwrap(), Err(WindowError::Closed)));
    }

    #[test]
    fn test_ack_chunks() {
        assert_eq!(ack_chunks(0).count(), 0);
        assert_eq!(ack_chunks(10).collect::<Vec<_>>(), vec![10]);
        assert_eq!(
            ack_chunks(65536).collect::<Vec<_>>(),
            vec![u16::MAX, 1]
        );
    }

    /// Pipes a writer's FWD chunks into a peer's local window and feeds the
    /// reader's ACKs back, checking both budgets stay in range throughout.
    #[tokio::test]
    async fn test_window_pair_round_trip() {
        const MAX: usize = 64 * 1024;
        let rw = Arc::new(RemoteWindow::new(MAX));
        let lw = Arc::new(LocalWindow::new(MAX));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();

        let writer = {
            let (rw, lw) = (Arc::clone(&rw), Arc::clone(&lw));
            tokio::spawn(async move {
                rw.write(&payload, |chunk| {
                    let lw = Arc::clone(&lw);
                    async move {
                        assert!(chunk.len() <= MAX_FWD_PAYLOAD_LEN);
                        lw.enqueue(&chunk).map_err(io::Error::from)
                    }
                })
                .await
            })
        };

        let mut got = Vec::with_capacity(expected.len());
        let mut buf = vec![0u8; 7_000];
        while got.len() < expected.len() {
            let n = lw.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
            for ack in ack_chunks(n) {
                rw.grow(ack as usize).unwrap();
            }
            assert!((0..=MAX as i64).contains(&lw.remaining()));
            assert!((0..=MAX as i64).contains(&rw.remaining()));
        }

        assert_eq!(writer.await.unwrap().unwrap(), expected.len());
        assert_eq!(got, expected);
    }
}
