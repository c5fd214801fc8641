use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, RelayResult};

/// Opens the downstream sink for a new session.
///
/// `seq` is the 1-based number of the session since the relay started.
pub trait SinkOpener: Send + Sync + 'static {
    fn open(&self, seq: u64) -> BoxFuture<'static, RelayResult<SinkWriter>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub frames: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct SinkShared {
    abort: CancellationToken,
    closed: AtomicBool,
    failure: Mutex<Option<RelayError>>,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl SinkShared {
    fn failure(&self) -> Option<RelayError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First failure wins. Aborts the writer task.
    fn fail(&self, err: RelayError) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.abort.cancel();
    }
}

/// Handle used by whoever watches the process behind a sink.
#[derive(Clone)]
pub struct SinkMonitor {
    shared: Arc<SinkShared>,
}

impl SinkMonitor {
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<RelayError> {
        self.shared.failure()
    }

    pub fn fail(&self, err: RelayError) {
        self.shared.fail(err);
    }
}

/// Single-writer byte stream to the encoder.
///
/// Buffers go through a bounded queue to one task that owns the stream, so
/// bytes of two frames never interleave and a slow reader suspends `write`.
pub struct SinkWriter {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<SinkShared>,
}

impl SinkWriter {
    /// Starts the writer task. `capacity` is the number of queued buffers.
    pub fn spawn<W>(writer: W, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(SinkShared::default());
        let task = tokio::spawn(write_loop(writer, rx, Arc::clone(&shared)));
        Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            shared,
        }
    }

    pub fn monitor(&self) -> SinkMonitor {
        SinkMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Enqueues one buffer, waiting while the queue is full.
    pub async fn write(&self, buf: Bytes) -> RelayResult<()> {
        if let Some(err) = self.shared.failure() {
            return Err(err);
        }
        let Some(tx) = self.sender() else {
            return Err(RelayError::write_failure("sink is closed"));
        };

        tokio::select! {
            biased;
            _ = self.shared.abort.cancelled() => Err(self.stopped()),
            sent = tx.send(buf) => sent.map_err(|_| self.stopped()),
        }
    }

    /// Resolves once the sink has failed, whether through a write error or
    /// through a [`SinkMonitor`], with the recorded error.
    pub async fn failed(&self) -> RelayError {
        self.shared.abort.cancelled().await;
        self.stopped()
    }

    /// Ends the input stream once queued buffers are written. Returns `true`
    /// only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.shared.closed.store(true, Ordering::Release);
        tx.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<RelayError> {
        self.shared.failure()
    }

    /// Records a fatal error, closes the stream and drops whatever is still queued.
    pub fn fail(&self, err: RelayError) {
        self.close();
        self.shared.fail(err);
    }

    /// Closes the stream and waits for the writer task to drain it. If that
    /// takes longer than `timeout` the remaining buffers are dropped.
    pub async fn finish(&self, timeout: Duration) -> RelayResult<()> {
        self.close();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                log::warn!("sink: drain did not finish within {:?}, aborting", timeout);
                self.shared.fail(RelayError::write_failure(format!(
                    "drain timed out after {timeout:?}"
                )));
                let _ = task.await;
            }
        }
        match self.shared.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            frames: self.shared.frames.load(Ordering::Relaxed),
            bytes: self.shared.bytes.load(Ordering::Relaxed),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn stopped(&self) -> RelayError {
        self.shared
            .failure()
            .unwrap_or_else(|| RelayError::write_failure("sink writer stopped"))
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, shared: Arc<SinkShared>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let buf = tokio::select! {
            biased;
            _ = shared.abort.cancelled() => break,
            buf = rx.recv() => match buf {
                Some(buf) => buf,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = shared.abort.cancelled() => break,
            res = writer.write_all(&buf) => res,
        };
        if let Err(e) = written {
            log::error!(
                "sink: write failed after {} frames: {}",
                shared.frames.load(Ordering::Relaxed),
                e
            );
            shared.fail(RelayError::write_failure(e.to_string()));
            break;
        }

        shared.frames.fetch_add(1, Ordering::Relaxed);
        shared.bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
    }
    rx.close();

    if !shared.abort.is_cancelled() {
        if let Err(e) = writer.shutdown().await {
            log::warn!("sink: shutdown failed: {}", e);
        }
    }
    log::debug!(
        "sink: stream closed, {} frames / {} bytes written",
        shared.frames.load(Ordering::Relaxed),
        shared.bytes.load(Ordering::Relaxed)
    );
}

#[cfg(test)]
#[path = "sink_test.rs"]
mod sink_test;
