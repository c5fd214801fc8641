use std::{fmt::Display, sync::Arc};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::Response,
};
use frame_bus::{
    error::RelayError,
    relay::{Relay, Session},
};
use futures::{SinkExt as _, Stream, StreamExt as _};

// close reasons are limited to 123 bytes by the protocol
const MAX_CLOSE_REASON: usize = 120;

/// Producer endpoint: every binary message is one complete frame.
pub async fn frame_ws(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> Response {
    // leave room above one frame so oversized messages are rejected as
    // malformed frames instead of tearing down the connection
    let limit = relay.geometry().input_len().saturating_mul(2).max(1 << 20);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut tx, rx) = socket.split();

    let mut session = match relay.connect().await {
        Ok(session) => session,
        Err(e) => {
            log::warn!("frame channel: producer rejected: {}", e);
            let _ = tx.send(close_message(&e)).await;
            return;
        }
    };
    log::info!(
        "frame channel: producer connected, session {}",
        session.seq()
    );

    match pump_frames(&mut session, rx).await {
        PumpEnd::Disconnected => {
            log::info!(
                "frame channel: producer disconnected, session {}",
                session.seq()
            );
        }
        PumpEnd::Shutdown => {
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "relay shutting down".into(),
                })))
                .await;
        }
        PumpEnd::Failed(e) => {
            let _ = tx.send(close_message(&e)).await;
        }
    }

    let summary = session.finish().await;
    if let Some(e) = summary.error {
        log::error!("frame channel: session {} ended with error: {}", summary.seq, e);
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum PumpEnd {
    Disconnected,
    Shutdown,
    Failed(RelayError),
}

/// Feeds inbound messages to the session one at a time. The next message is
/// not read until the previous frame is queued, so a slow encoder holds the
/// producer back through the socket. An encoder failure ends the pump even
/// while the producer is idle.
pub(crate) async fn pump_frames<S, E>(session: &mut Session, mut messages: S) -> PumpEnd
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let cancel = session.cancellation();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpEnd::Shutdown,
            err = session.sink_failed() => return PumpEnd::Failed(err),
            next = messages.next() => next,
        };

        let data = match next {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => {
                log::warn!("frame channel: ignoring {} byte text message", text.len());
                continue;
            }
            Some(Ok(Message::Close(_))) | None => return PumpEnd::Disconnected,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                log::warn!("frame channel: receive failed: {}", e);
                return PumpEnd::Disconnected;
            }
        };

        match session.push_frame(data).await {
            Ok(()) => {}
            Err(RelayError::Cancelled) => return PumpEnd::Shutdown,
            Err(e) if e.is_session_fatal() => return PumpEnd::Failed(e),
            // malformed frames are logged and counted by the session
            Err(_) => {}
        }
    }
}

fn close_message(err: &RelayError) -> Message {
    let code = match err {
        RelayError::ConcurrentSession => close_code::AGAIN,
        _ => close_code::ERROR,
    };
    let mut reason = err.to_string();
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
