//! The download receiver: bridges the backend's streamed response body to
//! pull-oriented client reads.
//!
//! The SFTP read model is "give me `length` bytes at `offset`", while the
//! backend hands the gateway body chunks as they arrive. A small pump task
//! owns the body and an in-memory buffer capped at
//! [`DOWNLOAD_BUFFER_LIMIT`]; pending read requests are served strictly in
//! FIFO order as soon as enough bytes are buffered. While the buffer is over
//! the cap the pump simply stops polling the body, which propagates
//! backpressure to the backend socket.

use crate::metrics;
use crate::swift::{Error, ErrorKind, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant, Sleep};

/// Upper bound on bytes buffered between backend and client.
pub const DOWNLOAD_BUFFER_LIMIT: usize = 1024 * 1024;

/// Idle window between backend chunks on the FTP data path.
pub const IDLE_CHUNK_TIMEOUT: Duration = Duration::from_secs(20);

struct ReadRequest {
    length: usize,
    reply: oneshot::Sender<Result<Option<Bytes>>>,
}

/// Handle for reading a downloading object. Dropping it stops the pump and
/// closes the backend body, which tears down the connection.
#[derive(Debug)]
pub struct DownloadReceiver {
    size: u64,
    requests: mpsc::UnboundedSender<ReadRequest>,
}

impl std::fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadRequest").field("length", &self.length).finish()
    }
}

impl DownloadReceiver {
    /// Spawns the pump over a backend body stream. `size` is the total
    /// object size; reads beyond it are clamped.
    pub fn spawn<S>(body: S, size: u64) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(body, rx, DOWNLOAD_BUFFER_LIMIT));
        DownloadReceiver { size, requests: tx }
    }

    /// Total size of the object being downloaded.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Requests `length` bytes at `offset`. Requests are served in the order
    /// they are issued, against the body's own running offset; `offset` only
    /// participates in end-of-file clamping. Returns `None` at end of file.
    pub async fn read(&self, offset: u64, length: u32) -> Result<Option<Bytes>> {
        let mut length = length as u64;
        if offset.saturating_add(length) > self.size {
            length = self.size.saturating_sub(offset);
        }
        if length == 0 {
            return Ok(None);
        }

        let (reply, response) = oneshot::channel();
        let request = ReadRequest {
            length: length as usize,
            reply,
        };
        self.requests
            .send(request)
            .map_err(|_| Error::from(ErrorKind::ConnectionLost))?;
        let data = response
            .await
            .map_err(|_| Error::from(ErrorKind::ConnectionLost))??;
        if let Some(data) = &data {
            metrics::count("transfer.egress_bytes", data.len() as u64);
        }
        Ok(data)
    }
}

enum Termination {
    Complete,
    Failed(ErrorKind, String),
}

async fn pump<S>(mut body: S, mut requests: mpsc::UnboundedReceiver<ReadRequest>, limit: usize)
where
    S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
{
    let mut buffer = BytesMut::new();
    let mut queue: VecDeque<ReadRequest> = VecDeque::new();
    let mut done: Option<Termination> = None;

    loop {
        // The readloop: serve from the front while requests can be satisfied.
        while let Some(front) = queue.front() {
            if buffer.len() >= front.length {
                let request = match queue.pop_front() {
                    Some(request) => request,
                    None => break,
                };
                let data = buffer.split_to(request.length).freeze();
                let _ = request.reply.send(Ok(Some(data)));
            } else if let Some(termination) = &done {
                let request = match queue.pop_front() {
                    Some(request) => request,
                    None => break,
                };
                let outcome = match termination {
                    Termination::Complete if !buffer.is_empty() => {
                        // Short final read: whatever the body still had.
                        Ok(Some(buffer.split_to(buffer.len()).freeze()))
                    }
                    Termination::Complete => Ok(None),
                    Termination::Failed(kind, message) => {
                        Err(Error::new(*kind, message.clone()))
                    }
                };
                let _ = request.reply.send(outcome);
            } else {
                break;
            }
        }

        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => queue.push_back(request),
                // Handle dropped: stop producing. Dropping the body closes
                // the backend transport.
                None => return,
            },
            chunk = body.next(), if done.is_none() && buffer.len() <= limit => {
                match chunk {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(error)) => {
                        done = Some(Termination::Failed(error.kind(), error.to_string()));
                    }
                    None => done = Some(Termination::Complete),
                }
            }
        }
    }
}

/// Wraps a body stream with a per-chunk idle timer. If no chunk arrives
/// within `timeout` the stream yields [`ErrorKind::Timeout`] and stops,
/// which aborts the transfer and closes the backend socket.
#[derive(Debug)]
pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    fired: bool,
}

impl<S> IdleTimeoutStream<S> {
    /// Arms the timer around a stream.
    pub fn new(inner: S, timeout: Duration) -> Self {
        IdleTimeoutStream {
            inner,
            timeout,
            sleep: Box::pin(sleep(timeout)),
            fired: false,
        }
    }
}

impl<S> Stream for IdleTimeoutStream<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.fired {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(item) => {
                let deadline = Instant::now() + this.timeout;
                this.sleep.as_mut().reset(deadline);
                Poll::Ready(item)
            }
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.fired = true;
                    Poll::Ready(Some(Err(Error::new(
                        ErrorKind::Timeout,
                        "no data from backend within the idle window",
                    ))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

fn to_io_error(error: Error) -> io::Error {
    let kind = match error.kind() {
        ErrorKind::Timeout => io::ErrorKind::TimedOut,
        ErrorKind::ConnectionLost => io::ErrorKind::ConnectionAborted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, error)
}

/// Adapts a body stream into the `AsyncRead` the FTP data channel copies
/// from.
pub fn into_async_read<S>(stream: S) -> Box<dyn AsyncRead + Send + Sync + Unpin>
where
    S: Stream<Item = Result<Bytes>> + Send + Sync + Unpin + 'static,
{
    use futures::TryStreamExt;
    use tokio_util::compat::FuturesAsyncReadCompatExt;
    Box::new(stream.map_err(to_io_error).into_async_read().compat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio_stream::wrappers::ReceiverStream;

    fn receiver_pair(
        size: u64,
        channel_capacity: usize,
    ) -> (mpsc::Sender<Result<Bytes>>, DownloadReceiver) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let receiver = DownloadReceiver::spawn(ReceiverStream::new(rx), size);
        (tx, receiver)
    }

    #[tokio::test]
    async fn serves_reads_in_fifo_order_across_chunk_boundaries() {
        let (tx, receiver) = receiver_pair(10, 8);
        tx.send(Ok(Bytes::from_static(b"0123"))).await.unwrap();

        let first = receiver.read(0, 2).await.unwrap().unwrap();
        assert_eq!(&first[..], b"01");

        // Second read spans the chunk boundary and must wait for more data.
        let pending = tokio::spawn({
            let rx_handle = receiver;
            async move {
                let second = rx_handle.read(2, 6).await.unwrap().unwrap();
                (second, rx_handle)
            }
        });
        tx.send(Ok(Bytes::from_static(b"456789"))).await.unwrap();
        let (second, receiver) = pending.await.unwrap();
        assert_eq!(&second[..], b"234567");

        drop(tx);
        let tail = receiver.read(8, 100).await.unwrap().unwrap();
        assert_eq!(&tail[..], b"89");
    }

    #[tokio::test]
    async fn clamps_reads_past_the_end() {
        let (tx, receiver) = receiver_pair(4, 8);
        tx.send(Ok(Bytes::from_static(b"abcd"))).await.unwrap();
        drop(tx);

        let data = receiver.read(0, 99).await.unwrap().unwrap();
        assert_eq!(&data[..], b"abcd");
        // Everything delivered: further reads are end-of-file.
        assert_eq!(receiver.read(4, 10).await.unwrap(), None);
        assert_eq!(receiver.read(100, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn normal_termination_means_eof_for_pending_readers() {
        let (tx, receiver) = receiver_pair(100, 8);
        let pending = tokio::spawn(async move {
            let outcome = receiver.read(0, 50).await;
            (outcome, receiver)
        });
        tx.send(Ok(Bytes::from_static(b"short"))).await.unwrap();
        drop(tx); // response complete, despite announcing 100 bytes

        let (outcome, _receiver) = pending.await.unwrap();
        // The buffered remainder is delivered short.
        assert_eq!(&outcome.unwrap().unwrap()[..], b"short");
    }

    #[tokio::test]
    async fn abnormal_termination_reaches_every_pending_reader() {
        let (tx, receiver) = receiver_pair(100, 8);
        tx.send(Err(Error::from(ErrorKind::ConnectionLost)))
            .await
            .unwrap();

        let outcome = receiver.read(0, 10).await;
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::ConnectionLost);
        let outcome = receiver.read(10, 10).await;
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::ConnectionLost);
    }

    #[tokio::test]
    async fn buffer_cap_pauses_the_backend() {
        // A pump with no pending reads fills its buffer past the cap once,
        // then stops polling the body; the channel backs up.
        let big = DOWNLOAD_BUFFER_LIMIT + 1;
        let (tx, _receiver) = receiver_pair(10 * big as u64, 1);
        tx.send(Ok(Bytes::from(vec![0u8; big]))).await.unwrap();
        // Give the pump a chance to swallow the oversize chunk.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(Ok(Bytes::from_static(b"queued"))).await.unwrap();
        // Buffer is over the cap, so this chunk stays in the channel.
        let err = tx.try_send(Ok(Bytes::from_static(b"stuck")));
        assert!(err.is_err(), "backend should be paused at the buffer cap");
    }

    #[tokio::test]
    async fn idle_timeout_fires_between_chunks() {
        tokio::time::pause();
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(4);
        let mut stream = IdleTimeoutStream::new(
            ReceiverStream::new(rx),
            Duration::from_secs(20),
        );

        tx.send(Ok(Bytes::from_static(b"x"))).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"x");

        tokio::time::advance(Duration::from_secs(21)).await;
        let second = stream.next().await.unwrap();
        assert_eq!(second.unwrap_err().kind(), ErrorKind::Timeout);
        assert!(stream.next().await.is_none());
    }
}
