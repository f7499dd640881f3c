//! Per-connection WebSocket task
//!
//! Runs the post-handshake admission check, registers with the hub and then
//! pumps frames both ways until the peer leaves, the hub terminates the
//! connection, or a close is queued.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use super::Shared;
use crate::admission::{AdmissionRequest, Stage};
use crate::hub::{ConnectionEvent, ConnectionHandle, Outbound, Registration};
use crate::protocol::CloseReason;

fn close_frame(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.reason().into(),
    }))
}

/// Write one frame unless the hub terminates the connection first.
///
/// A peer that stops reading stalls the write; termination must still end
/// the task. Returns false when the connection should end.
async fn write<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    handle: &ConnectionHandle,
    message: Message,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        biased;

        _ = handle.terminated() => {
            debug!("{} terminated during write", handle.id());
            false
        }
        result = sink.send(message) => match result {
            Ok(()) => true,
            Err(e) => {
                debug!("Write to {} failed: {}", handle.id(), e);
                false
            }
        },
    }
}

pub(super) async fn serve<S>(
    shared: Arc<Shared>,
    ws: WebSocketStream<S>,
    request: AdmissionRequest,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = request.peer;
    let (mut sink, mut stream) = ws.split();

    let established = request.at_stage(Stage::Established);
    if let Err(rejection) = shared.gate.evaluate(&established).await {
        shared.record_rejection(Stage::Established.as_str(), rejection.as_str());
        let _ = sink.send(close_frame(rejection.close_reason())).await;
        return;
    }

    if shared.is_shutting_down() {
        let _ = sink.send(close_frame(CloseReason::Shutdown)).await;
        return;
    }

    let Registration {
        handle,
        mut outbound,
    } = shared.hub.register(peer);
    let id = handle.id();

    loop {
        tokio::select! {
            biased;

            _ = handle.terminated() => {
                debug!("{} terminated by server", id);
                break;
            }
            item = outbound.recv() => {
                let message = match item {
                    Some(Outbound::Text(text)) => Message::Text(text.to_string()),
                    Some(Outbound::Ping) => Message::Ping(Vec::new()),
                    Some(Outbound::Close(reason)) => {
                        debug!("Closing {}: {}", id, reason.reason());
                        write(&mut sink, &handle, close_frame(reason)).await;
                        break;
                    }
                    None => break,
                };
                if !write(&mut sink, &handle, message).await {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        shared.hub.handle_event(id, ConnectionEvent::Message(text.into_bytes()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        shared.hub.handle_event(id, ConnectionEvent::Message(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        trace!("Pong from {}", id);
                        shared.hub.handle_event(id, ConnectionEvent::Pong);
                    }
                    // Pings are answered by the protocol layer
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!("{} closed by peer: {:?}", id, frame);
                        // Sends the queued close reply
                        let _ = sink.flush().await;
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("Read from {} failed: {}", id, e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    shared.hub.handle_event(id, ConnectionEvent::Closed);
}
