//! Per-operation read and write deadlines for client sockets
//!
//! A read or write that stays pending longer than its limit fails with
//! `TimedOut`. The clock starts when an operation first returns pending and
//! resets once it completes, so a slow but moving peer is never cut off.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

pin_project! {
    #[derive(Debug)]
    pub struct Deadline<T> {
        #[pin]
        inner: T,
        read: Timer,
        write: Timer,
    }
}

#[derive(Debug)]
struct Timer {
    limit: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    armed: bool,
}

impl Timer {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            limit,
            sleep: None,
            armed: false,
        }
    }

    fn reset(&mut self) {
        self.armed = false;
    }

    /// Called after the inner operation returned pending
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        let Some(limit) = self.limit else {
            return false;
        };
        let deadline = Instant::now() + limit;
        let sleep = self.sleep.get_or_insert_with(|| Box::pin(sleep_until(deadline)));
        if !self.armed {
            sleep.as_mut().reset(deadline);
            self.armed = true;
        }
        if sleep.as_mut().poll(cx).is_ready() {
            self.armed = false;
            return true;
        }
        false
    }
}

impl<T> Deadline<T> {
    pub fn new(inner: T, read: Option<Duration>, write: Option<Duration>) -> Self {
        Self {
            inner,
            read: Timer::new(read),
            write: Timer::new(write),
        }
    }
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", op))
}

impl<T: AsyncRead> AsyncRead for Deadline<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read.reset();
                Poll::Ready(result)
            }
            Poll::Pending if this.read.poll_expired(cx) => Poll::Ready(Err(timed_out("read"))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncWrite> AsyncWrite for Deadline<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write.reset();
                Poll::Ready(result)
            }
            Poll::Pending if this.write.poll_expired(cx) => Poll::Ready(Err(timed_out("write"))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_flush(cx) {
            Poll::Ready(result) => {
                this.write.reset();
                Poll::Ready(result)
            }
            Poll::Pending if this.write.poll_expired(cx) => Poll::Ready(Err(timed_out("flush"))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_shutdown(cx) {
            Poll::Ready(result) => {
                this.write.reset();
                Poll::Ready(result)
            }
            Poll::Pending if this.write.poll_expired(cx) => {
                Poll::Ready(Err(timed_out("shutdown")))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn test_stalled_read_times_out() {
        let (client, _peer) = tokio::io::duplex(64);
        let mut stream = Deadline::new(client, Some(Duration::from_secs(30)), None);

        let started = Instant::now();
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_peer_fails_writes() {
        let (client, _peer) = tokio::io::duplex(16);
        let mut stream = Deadline::new(client, None, Some(Duration::from_secs(5)));

        let err = stream.write_all(&[7u8; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_the_clock() {
        let (client, mut peer) = tokio::io::duplex(64);
        let mut stream = Deadline::new(client, Some(Duration::from_secs(10)), None);

        let feeder = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(8)).await;
                peer.write_all(b"x").await.unwrap();
            }
            peer
        });

        let mut buf = [0u8; 1];
        for _ in 0..3 {
            stream.read_exact(&mut buf).await.unwrap();
        }
        assert_eq!(&buf, b"x");
        drop(feeder.await.unwrap());
    }

    #[tokio::test]
    async fn test_without_limits_is_transparent() {
        let (client, mut peer) = tokio::io::duplex(64);
        let mut stream = Deadline::new(client, None, None);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
