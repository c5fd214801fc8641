use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult},
    frame::{Frame, FrameGeometry},
    half::half_table,
    reformat::Reformatter,
    sink::{SinkOpener, SinkWriter},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Idle,
    Connected,
    Draining,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub id: Uuid,
    pub seq: u64,
    pub connected_at: DateTime<Utc>,
    pub frames_forwarded: u64,
    pub frames_rejected: u64,
    pub bytes_forwarded: u64,
    pub error: Option<String>,
}

impl SessionStatus {
    fn new(id: Uuid, seq: u64) -> Self {
        Self {
            id,
            seq,
            connected_at: Utc::now(),
            frames_forwarded: 0,
            frames_rejected: 0,
            bytes_forwarded: 0,
            error: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RelayStatus {
    pub state: RelayState,
    pub geometry: FrameGeometry,
    pub sessions_total: u64,
    pub session: Option<SessionStatus>,
    pub last_session: Option<SessionStatus>,
}

/// Outcome of a finished session.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub id: Uuid,
    pub seq: u64,
    pub frames_forwarded: u64,
    pub frames_rejected: u64,
    pub bytes_written: u64,
    pub error: Option<RelayError>,
}

/// Binds one producer at a time to a freshly opened sink.
///
/// State: `Idle -> Connected -> Draining -> Idle`, with `Failed` reachable
/// from an active session. Only one session holds the slot; `connect` while
/// it is taken fails with [`RelayError::ConcurrentSession`].
pub struct Relay {
    geometry: FrameGeometry,
    reformatter: Reformatter,
    opener: Arc<dyn SinkOpener>,
    drain_timeout: Duration,
    status: watch::Sender<RelayStatus>,
    cancel: CancellationToken,
}

impl Relay {
    pub fn new(geometry: FrameGeometry, opener: Arc<dyn SinkOpener>) -> Self {
        let (status, _) = watch::channel(RelayStatus {
            state: RelayState::Idle,
            geometry,
            sessions_total: 0,
            session: None,
            last_session: None,
        });
        Self {
            geometry,
            reformatter: Reformatter::new(half_table()),
            opener,
            drain_timeout: Duration::from_secs(30),
            status,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn status(&self) -> RelayStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    /// Claims the session slot and opens the sink.
    pub async fn connect(self: &Arc<Self>) -> RelayResult<Session> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let id = Uuid::new_v4();
        let mut seq = 0;
        let claimed = self.status.send_if_modified(|status| {
            if status.state != RelayState::Idle {
                return false;
            }
            status.sessions_total += 1;
            seq = status.sessions_total;
            status.state = RelayState::Connected;
            status.session = Some(SessionStatus::new(id, seq));
            true
        });
        if !claimed {
            log::warn!("relay: rejecting producer, a session is already active");
            return Err(RelayError::ConcurrentSession);
        }

        // releases the slot if opening fails or this future is dropped
        let slot = SessionSlot {
            relay: Arc::clone(self),
            id,
            released: false,
        };

        let sink = match self.opener.open(seq).await {
            Ok(sink) => sink,
            Err(e) => {
                log::error!("relay: session {} could not open the sink: {}", seq, e);
                let message = e.to_string();
                slot.modify(|state, session| {
                    *state = RelayState::Failed;
                    session.error = Some(message);
                });
                return Err(e);
            }
        };
        log::info!("relay: session {} ({}) connected, {}", seq, id, self.geometry);

        Ok(Session {
            slot,
            seq,
            sink,
            reformatter: self.reformatter,
            geometry: self.geometry,
            drain_timeout: self.drain_timeout,
            cancel: self.cancel.child_token(),
            failure: None,
            frames_forwarded: 0,
            frames_rejected: 0,
        })
    }

    /// Cancels the active session and waits for the slot to become idle.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let mut rx = self.status.subscribe();
        let idle = async move {
            rx.wait_for(|status| status.state == RelayState::Idle)
                .await
                .is_ok()
        };
        tokio::time::timeout(timeout, idle).await.unwrap_or(false)
    }
}

struct SessionSlot {
    relay: Arc<Relay>,
    id: Uuid,
    released: bool,
}

impl SessionSlot {
    fn modify(&self, f: impl FnOnce(&mut RelayState, &mut SessionStatus)) {
        self.relay.status.send_if_modified(|status| {
            let RelayStatus { state, session, .. } = status;
            match session {
                Some(session) if session.id == self.id => {
                    f(state, session);
                    true
                }
                _ => false,
            }
        });
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.relay.status.send_if_modified(|status| {
            if status.session.as_ref().map(|s| s.id) != Some(self.id) {
                return false;
            }
            status.state = RelayState::Idle;
            status.last_session = status.session.take();
            true
        });
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// One producer's attachment. Frames pushed here reach the sink in call order.
pub struct Session {
    slot: SessionSlot,
    seq: u64,
    sink: SinkWriter,
    reformatter: Reformatter,
    geometry: FrameGeometry,
    drain_timeout: Duration,
    cancel: CancellationToken,
    failure: Option<RelayError>,
    frames_forwarded: u64,
    frames_rejected: u64,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.slot.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Cancelled when the relay shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn failure(&self) -> Option<&RelayError> {
        self.failure.as_ref()
    }

    /// Converts one frame and queues it for the sink.
    ///
    /// A malformed frame is rejected on its own; sink errors fail the
    /// session and every later call returns the same error.
    pub async fn push_frame(&mut self, data: Bytes) -> RelayResult<()> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if self.cancel.is_cancelled() {
            return Err(self.fail(RelayError::Cancelled));
        }

        let frame = Frame::new(self.geometry, data);
        let converted = match self.reformatter.reformat_blocking(frame).await {
            Ok(converted) => converted,
            Err(e @ RelayError::MalformedFrame { .. }) => {
                self.frames_rejected += 1;
                log::warn!("relay: session {} dropped frame: {}", self.seq, e);
                self.slot.modify(|_, session| session.frames_rejected += 1);
                return Err(e);
            }
            Err(e) => return Err(self.fail(e)),
        };

        let len = converted.len() as u64;
        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            res = self.sink.write(converted) => res,
        };
        if let Err(e) = written {
            return Err(self.fail(e));
        }

        self.frames_forwarded += 1;
        self.slot.modify(|_, session| {
            session.frames_forwarded += 1;
            session.bytes_forwarded += len;
        });
        Ok(())
    }

    /// Waits for the sink to fail while no frame is in flight (the encoder
    /// exited, for one) and fails the session with that error.
    pub async fn sink_failed(&mut self) -> RelayError {
        if let Some(err) = &self.failure {
            return err.clone();
        }
        let err = self.sink.failed().await;
        self.fail(err)
    }

    /// Drains and closes the sink, then frees the slot for the next producer.
    pub async fn finish(mut self) -> SessionSummary {
        self.slot.modify(|state, _| *state = RelayState::Draining);
        log::info!("relay: session {} draining", self.seq);

        let drained = self.sink.finish(self.drain_timeout).await;
        let error = match (self.failure.take(), drained) {
            (Some(e), _) => Some(e),
            (None, Err(e)) => {
                log::error!("relay: session {} failed while draining: {}", self.seq, e);
                Some(e)
            }
            (None, Ok(())) => None,
        };

        let stats = self.sink.stats();
        let summary = SessionSummary {
            id: self.slot.id,
            seq: self.seq,
            frames_forwarded: self.frames_forwarded,
            frames_rejected: self.frames_rejected,
            bytes_written: stats.bytes,
            error,
        };
        self.slot.release();
        log::info!(
            "relay: session {} ended, {} frames forwarded, {} rejected, {} bytes written",
            summary.seq,
            summary.frames_forwarded,
            summary.frames_rejected,
            summary.bytes_written
        );
        summary
    }

    fn fail(&mut self, err: RelayError) -> RelayError {
        log::error!("relay: session {} failed: {}", self.seq, err);
        match err {
            // keep what is already queued, finish() drains it
            RelayError::Cancelled => {
                self.sink.close();
            }
            _ => self.sink.fail(err.clone()),
        }
        self.failure = Some(err.clone());
        let message = err.to_string();
        self.slot.modify(|state, session| {
            *state = RelayState::Failed;
            session.error = Some(message);
        });
        err
    }
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod relay_test;
