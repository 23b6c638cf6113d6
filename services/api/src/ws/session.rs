//! Manages the call-side WebSocket connection for one media stream.
//!
//! Each accepted connection gets its own `RelaySession`, its own `CallLeg`
//! handle, and (once the stream starts) its own agent task. Nothing is shared
//! across calls.

use super::{
    protocol::{OutboundMedia, TwilioEvent, TwilioFrame},
    provider::{self, AgentCommand},
    relay::{CallEvent, RelaySession, Step},
};
use crate::{audio, state::AppState};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, instrument, warn};

/// Axum handler to upgrade an HTTP connection to a media-stream WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Lifecycle state of the call-side connection handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LegState {
    Open,
    Closing,
    Closed,
}

/// Write half of the call-side connection, shared between the connection loop
/// and the agent task. No frame is sent unless the leg is open and the stream
/// SID is known.
pub(crate) struct CallLeg {
    sink: SplitSink<WebSocket, Message>,
    stream_sid: Option<String>,
    state: LegState,
}

impl CallLeg {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink,
            stream_sid: None,
            state: LegState::Open,
        }
    }

    /// Records the stream SID from the `start` event. The SID is immutable
    /// once set.
    fn set_stream_sid(&mut self, sid: String) {
        if self.stream_sid.is_none() {
            self.stream_sid = Some(sid);
        } else {
            warn!("stream SID already set; keeping the original");
        }
    }

    fn ready(&self, frame: &str) -> Option<String> {
        if self.state != LegState::Open {
            warn!(frame, state = ?self.state, "dropping outbound frame on a non-open call leg");
            return None;
        }
        match &self.stream_sid {
            Some(sid) => Some(sid.clone()),
            None => {
                warn!(frame, "dropping outbound frame before the stream SID is known");
                None
            }
        }
    }

    /// Sends one chunk of agent audio to the caller. A no-op (with a log) if
    /// the leg is not open or the stream SID is unknown.
    pub(crate) async fn send_media(&mut self, payload: &str) {
        let Some(stream_sid) = self.ready("media") else {
            return;
        };
        let frame = TwilioFrame::Media {
            stream_sid,
            media: OutboundMedia {
                payload: payload.to_string(),
            },
        };
        self.send(&frame).await;
    }

    /// Tells Twilio to discard buffered playback audio (barge-in).
    pub(crate) async fn send_clear(&mut self) {
        let Some(stream_sid) = self.ready("clear") else {
            return;
        };
        self.send(&TwilioFrame::Clear { stream_sid }).await;
    }

    async fn send(&mut self, frame: &TwilioFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                if let Err(e) = self.sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "call leg send failed; marking the leg closed");
                    self.state = LegState::Closed;
                }
            }
            Err(e) => error!(error = %e, "failed to serialize an outbound frame"),
        }
    }

    /// Closes the call leg. Idempotent.
    pub(crate) async fn close(&mut self) {
        if self.state == LegState::Open {
            self.state = LegState::Closing;
            if let Err(e) = self.sink.close().await {
                debug!(error = %e, "call leg close handshake failed");
            }
        }
        self.state = LegState::Closed;
    }
}

/// Main handler for one media-stream connection.
///
/// Drives the relay state machine with translated call-side frames, spawns
/// the agent task once the stream starts, and tears both legs down together
/// when the call ends.
#[instrument(name = "media_stream", skip_all, fields(call_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let call_id: u32 = rand::random();
    tracing::Span::current().record("call_id", call_id);
    info!("Twilio connected. Awaiting stream start...");

    let (sink, mut socket_rx) = socket.split();
    let call_leg = Arc::new(Mutex::new(CallLeg::new(sink)));
    let mut relay = RelaySession::new();
    let mut agent_tx: Option<mpsc::Sender<AgentCommand>> = None;

    while let Some(msg_result) = socket_rx.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "call leg transport error");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => {
                info!("Twilio closed the media stream");
                break;
            }
            Message::Binary(_) => {
                debug!("ignoring unexpected binary frame");
                continue;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        // One malformed frame must not drop the call.
        let frame = match serde_json::from_str::<TwilioEvent>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "discarding malformed media-stream frame");
                continue;
            }
        };

        let event = match frame {
            TwilioEvent::Start { start } => CallEvent::SessionStarted {
                stream_sid: start.stream_sid,
                params: start.custom_parameters,
            },
            TwilioEvent::Media { media } => match audio::decode_payload(&media.payload) {
                Some(bytes) => CallEvent::InboundAudio(bytes),
                None => {
                    warn!("discarding media frame with an invalid base64 payload");
                    continue;
                }
            },
            TwilioEvent::Stop => CallEvent::SessionStopped,
            TwilioEvent::Other => {
                debug!("ignoring unrecognized media-stream event");
                continue;
            }
        };

        match relay.apply(event) {
            Step::OpenAgent { stream_sid, params } => {
                info!(%stream_sid, "media stream started");
                call_leg.lock().await.set_stream_sid(stream_sid);
                agent_tx = Some(provider::start_agent_session(
                    state.clone(),
                    params,
                    call_leg.clone(),
                ));
            }
            Step::ForwardAudio(bytes) => {
                if let Some(tx) = &agent_tx {
                    if tx.send(AgentCommand::UserAudio(bytes)).await.is_err() {
                        warn!("agent connection is gone; dropping caller audio");
                    }
                }
            }
            Step::Shutdown => {
                info!("media stream ended");
                break;
            }
            Step::Ignore(reason) => debug!(reason, "frame not forwarded"),
        }
    }

    // Closing either leg closes the other: hang up the agent side, then the
    // call side, whatever caused the loop to exit.
    relay.terminate();
    if let Some(tx) = agent_tx.take() {
        let _ = tx.send(AgentCommand::Hangup).await;
    }
    call_leg.lock().await.close().await;
    info!("call relay terminated");
}
