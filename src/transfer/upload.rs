//! The upload sender: bridges pushed client writes to a single backend PUT.
//!
//! Writes arrive offset-ordered from the SFTP session and are assumed
//! sequential from zero. The first write lazily starts the PUT with a
//! chunked body fed from a queue; every accepted write completes in
//! acceptance order and the queue applies hysteresis backpressure: the
//! writer stalls above [`MAX_BUFFER_WRITES`] queued entries and resumes once
//! the backend has drained it below [`BUFFER_WRITES_RESUME`].

use crate::metrics;
use crate::swift::{Error, ErrorKind, Headers, RequestBody, Result, SwiftConnection};
use bytes::Bytes;
use futures::StreamExt;
use hyper::Body;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Queue depth above which the writer is paused.
pub const MAX_BUFFER_WRITES: usize = 20;
/// Queue depth below which a paused writer resumes.
pub const BUFFER_WRITES_RESUME: usize = 5;

/// Streams one object's bytes from client writes into a backend PUT.
#[derive(Debug)]
pub struct UploadSender {
    conn: Arc<SwiftConnection>,
    container: String,
    object: String,
    tx: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
    task: Option<JoinHandle<Result<Headers>>>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    paused: bool,
    bytes_accepted: u64,
}

impl UploadSender {
    /// Creates a sender for one object. Nothing is sent until the first
    /// write (or close, for zero-byte objects).
    pub fn new(conn: Arc<SwiftConnection>, container: &str, object: &str) -> Self {
        UploadSender {
            conn,
            container: container.to_string(),
            object: object.to_string(),
            tx: None,
            task: None,
            pending: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            paused: false,
            bytes_accepted: 0,
        }
    }

    /// Total bytes accepted so far.
    pub fn bytes_accepted(&self) -> u64 {
        self.bytes_accepted
    }

    fn start(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel::<io::Result<Bytes>>();
        let pending = Arc::clone(&self.pending);
        let drained = Arc::clone(&self.drained);
        // The inspect hook fires when the backend connection pulls an entry
        // out of the queue, which is the moment the write is consumed.
        let stream = UnboundedReceiverStream::new(rx).inspect(move |_| {
            pending.fetch_sub(1, Ordering::AcqRel);
            drained.notify_waiters();
        });
        let body = Body::wrap_stream(stream);

        let conn = Arc::clone(&self.conn);
        let container = self.container.clone();
        let object = self.object.clone();
        self.task = Some(tokio::spawn(async move {
            conn.put_object(&container, &object, &[], RequestBody::Stream(body))
                .await
        }));
        self.tx = Some(tx);
    }

    /// Accepts one write. Resolves once the chunk is queued and the queue is
    /// under its limit; fails with [`ErrorKind::ConnectionLost`] when the
    /// backend request died underneath it.
    pub async fn write(&mut self, data: Bytes) -> Result<usize> {
        if self.tx.is_none() {
            self.start();
        }

        if self.paused {
            while self.pending.load(Ordering::Acquire) >= BUFFER_WRITES_RESUME {
                let drained = self.drained.notified();
                if self.pending.load(Ordering::Acquire) < BUFFER_WRITES_RESUME {
                    break;
                }
                drained.await;
            }
            self.paused = false;
        }

        let length = data.len();
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return Err(Error::from(ErrorKind::ConnectionLost)),
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(Ok(data)).is_err() {
            // Receiver gone: the PUT ended early. The error itself surfaces
            // at close; the write reports the lost connection.
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::from(ErrorKind::ConnectionLost));
        }
        if self.pending.load(Ordering::Acquire) > MAX_BUFFER_WRITES {
            self.paused = true;
        }

        self.bytes_accepted += length as u64;
        metrics::count("transfer.ingress_bytes", length as u64);
        Ok(length)
    }

    /// Finishes the upload: drains the queue, terminates the chunked body
    /// and returns the PUT outcome. A close without any write still issues
    /// the PUT so zero-byte objects are stored. [`ErrorKind::NotFound`]
    /// means the target container does not exist.
    pub async fn close(mut self) -> Result<Headers> {
        if self.task.is_none() {
            self.start();
        }
        // Dropping the queue sender signals end-of-body once drained.
        drop(self.tx.take());
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::new(ErrorKind::ConnectionLost, e))?,
            None => Err(Error::from(ErrorKind::LocalError)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn unauthenticated_sender() -> UploadSender {
        let http = SwiftConnection::default_http_client(Duration::from_secs(1), 1);
        let conn = Arc::new(SwiftConnection::new(
            http,
            "http://127.0.0.1:1/auth/v1.0",
            "user",
            "key",
        ));
        UploadSender::new(conn, "container", "object")
    }

    #[tokio::test]
    async fn dead_backend_fails_pending_writes_with_connection_lost() {
        // The connection was never authenticated, so the PUT task dies on
        // its first poll and drops the queue receiver.
        let mut sender = unauthenticated_sender();
        let _ = sender.write(Bytes::from_static(b"first")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = sender.write(Bytes::from_static(b"second")).await;
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::ConnectionLost);
    }

    #[tokio::test]
    async fn close_surfaces_the_put_outcome() {
        let sender = unauthenticated_sender();
        let outcome = sender.close().await;
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::UnAuthenticated);
    }

    #[tokio::test]
    async fn byte_accounting_tracks_accepted_writes() {
        let mut sender = unauthenticated_sender();
        if sender.write(Bytes::from_static(b"12345")).await.is_ok() {
            assert_eq!(sender.bytes_accepted(), 5);
        }
    }
}
