//! Handles the WebSocket connection to the ElevenLabs conversational agent
//! for one call.

use super::AgentCommand;
use crate::{audio, state::AppState, ws::session::CallLeg};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};

const SIGNED_URL_ENDPOINT: &str =
    "https://api.elevenlabs.io/v1/convai/conversation/get_signed_url";

/// Errors raised while bootstrapping the agent connection.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("agent endpoint request rejected: {status}")]
    UpstreamAuth { status: StatusCode },
    #[error("agent endpoint unreachable: {0}")]
    UpstreamUnavailable(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

/// Fetches a one-time signed WebSocket URL for the configured agent.
///
/// The URL is single-use and short-lived, so every call performs a fresh
/// fetch; there is no retry and no caching.
pub async fn fetch_signed_url(
    http: &reqwest::Client,
    agent_id: &str,
    api_key: &str,
) -> Result<String, SetupError> {
    let response = http
        .get(SIGNED_URL_ENDPOINT)
        .query(&[("agent_id", agent_id)])
        .header("xi-api-key", api_key)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(SetupError::UpstreamAuth { status });
    }

    let body: SignedUrlResponse = response.json().await?;
    Ok(body.signed_url)
}

// --- Local ElevenLabs ConvAI Types (for encapsulation) ---
mod convai_types {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Debug)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub(super) enum ClientEvent {
        /// The initiation handshake: per-call agent configuration overrides.
        ConversationInitiationClientData {
            conversation_config_override: ConfigOverride,
        },
        /// Keepalive answer, echoing the ping's event id.
        Pong { event_id: String },
    }

    #[derive(Serialize, Debug)]
    pub(super) struct ConfigOverride {
        pub agent: AgentOverride,
    }

    #[derive(Serialize, Debug)]
    pub(super) struct AgentOverride {
        pub prompt: PromptOverride,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub first_message: Option<String>,
    }

    #[derive(Serialize, Debug)]
    pub(super) struct PromptOverride {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub prompt: Option<String>,
    }

    /// Caller audio frame. Untagged on the wire: the frame is just the one
    /// field.
    #[derive(Serialize, Debug)]
    pub(super) struct UserAudioChunk {
        pub user_audio_chunk: String,
    }

    #[derive(Deserialize, Debug)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub(super) enum ServerEvent {
        ConversationInitiationMetadata,
        /// Agent audio. The payload location differs between provider
        /// variants; exactly one of the two fields is populated.
        Audio {
            audio: Option<AudioChunk>,
            audio_event: Option<AudioEvent>,
        },
        /// The caller started speaking; buffered agent audio must be
        /// discarded.
        Interruption,
        Ping {
            ping_event: Option<PingEvent>,
        },
        #[serde(other)]
        Other,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct AudioChunk {
        pub chunk: String,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct AudioEvent {
        pub audio_base_64: String,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct PingEvent {
        pub event_id: String,
    }

    impl ServerEvent {
        /// Extracts the base64 audio payload from whichever variant field is
        /// present.
        pub(super) fn audio_payload(self) -> Option<String> {
            match self {
                ServerEvent::Audio { audio, audio_event } => audio
                    .map(|a| a.chunk)
                    .or(audio_event.map(|e| e.audio_base_64)),
                _ => None,
            }
        }
    }
}

fn build_initiation(params: &HashMap<String, String>) -> convai_types::ClientEvent {
    convai_types::ClientEvent::ConversationInitiationClientData {
        conversation_config_override: convai_types::ConfigOverride {
            agent: convai_types::AgentOverride {
                prompt: convai_types::PromptOverride {
                    prompt: params.get("prompt").cloned(),
                },
                first_message: params.get("initialScript").cloned(),
            },
        },
    }
}

/// Runs the agent connection for one call.
///
/// Fetches the signed URL, connects, sends the initiation handshake, and then
/// relays events in both directions until the call ends or the transport
/// fails.
pub(crate) async fn run(
    state: &Arc<AppState>,
    params: HashMap<String, String>,
    mut rx: mpsc::Receiver<AgentCommand>,
    call_leg: Arc<Mutex<CallLeg>>,
) -> Result<()> {
    let signed_url = fetch_signed_url(
        &state.http,
        &state.config.elevenlabs_agent_id,
        &state.config.elevenlabs_api_key,
    )
    .await
    .context("could not obtain a signed agent URL")?;

    let (ws_stream, _) = connect_async(signed_url.as_str())
        .await
        .context("failed to open the agent WebSocket")?;
    info!("Connected to conversational agent");
    let (mut agent_tx, mut agent_rx) = ws_stream.split();

    // The initiation handshake must reach the agent before any audio does:
    // it carries the prompt and opening line for this call.
    let initiation = build_initiation(&params);
    agent_tx
        .send(WsMessage::Text(serde_json::to_string(&initiation)?.into()))
        .await
        .context("failed to send the initiation handshake")?;

    // Caller audio that arrived while the connection was opening is dropped,
    // not replayed.
    let mut dropped = 0usize;
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            AgentCommand::Hangup => {
                let _ = agent_tx.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            AgentCommand::UserAudio(_) => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!(dropped, "discarded caller audio received before the agent connection opened");
    }

    loop {
        tokio::select! {
            // Commands from the call-side orchestrator.
            Some(cmd) = rx.recv() => {
                match cmd {
                    AgentCommand::UserAudio(bytes) => {
                        let frame = convai_types::UserAudioChunk {
                            user_audio_chunk: audio::encode_payload(&bytes),
                        };
                        agent_tx
                            .send(WsMessage::Text(serde_json::to_string(&frame)?.into()))
                            .await
                            .context("failed to forward caller audio")?;
                    }
                    AgentCommand::Hangup => {
                        let _ = agent_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            },
            // Events from the agent.
            Some(msg_result) = agent_rx.next() => {
                match msg_result {
                    Ok(WsMessage::Text(text)) => {
                        // One malformed event must not drop the connection.
                        let event = match serde_json::from_str::<convai_types::ServerEvent>(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(error = %e, "discarding malformed agent event");
                                continue;
                            }
                        };

                        match event {
                            convai_types::ServerEvent::ConversationInitiationMetadata => {
                                info!("Received conversation initiation metadata");
                            }
                            event @ convai_types::ServerEvent::Audio { .. } => {
                                match event.audio_payload() {
                                    Some(chunk) => call_leg.lock().await.send_media(&chunk).await,
                                    None => warn!("agent audio event carried no payload"),
                                }
                            }
                            convai_types::ServerEvent::Interruption => {
                                // Barge-in: cut buffered playback immediately.
                                call_leg.lock().await.send_clear().await;
                            }
                            convai_types::ServerEvent::Ping { ping_event } => {
                                if let Some(ping) = ping_event {
                                    let pong = convai_types::ClientEvent::Pong {
                                        event_id: ping.event_id,
                                    };
                                    agent_tx
                                        .send(WsMessage::Text(serde_json::to_string(&pong)?.into()))
                                        .await
                                        .context("failed to answer keepalive ping")?;
                                }
                            }
                            convai_types::ServerEvent::Other => {
                                debug!("ignoring unhandled agent event type");
                            }
                        }
                    }
                    Ok(WsMessage::Close(close_frame)) => {
                        info!(?close_frame, "agent closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "agent WebSocket transport error");
                        break;
                    }
                }
            },
            else => break,
        }
    }

    info!("agent connection ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::convai_types::{ClientEvent, ServerEvent};
    use super::*;

    #[test]
    fn test_initiation_handshake_shape() {
        let params = HashMap::from([
            ("prompt".to_string(), "You are a helpful agent".to_string()),
            ("initialScript".to_string(), "Hello there!".to_string()),
        ]);

        let value =
            serde_json::to_value(build_initiation(&params)).expect("handshake should serialize");

        assert_eq!(value["type"], "conversation_initiation_client_data");
        let agent = &value["conversation_config_override"]["agent"];
        assert_eq!(agent["prompt"]["prompt"], "You are a helpful agent");
        assert_eq!(agent["first_message"], "Hello there!");
    }

    #[test]
    fn test_initiation_handshake_omits_absent_overrides() {
        let value = serde_json::to_value(build_initiation(&HashMap::new()))
            .expect("handshake should serialize");

        let agent = &value["conversation_config_override"]["agent"];
        assert!(agent.get("first_message").is_none());
        assert!(agent["prompt"].get("prompt").is_none());
    }

    #[test]
    fn test_user_audio_chunk_is_untagged() {
        let frame = convai_types::UserAudioChunk {
            user_audio_chunk: audio::encode_payload(b"hello"),
        };

        let value = serde_json::to_value(&frame).expect("frame should serialize");
        let object = value.as_object().expect("frame should be an object");
        assert_eq!(object.len(), 1);
        assert_eq!(value["user_audio_chunk"], "aGVsbG8=");
    }

    #[test]
    fn test_audio_event_chunk_variant() {
        let raw = r#"{"type": "audio", "audio": {"chunk": "QUJD"}}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("event should parse");
        assert_eq!(event.audio_payload().as_deref(), Some("QUJD"));
    }

    #[test]
    fn test_audio_event_base64_variant() {
        let raw = r#"{"type": "audio", "audio_event": {"audio_base_64": "QUJD", "event_id": 7}}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("event should parse");
        assert_eq!(event.audio_payload().as_deref(), Some("QUJD"));
    }

    #[test]
    fn test_audio_event_without_payload() {
        let raw = r#"{"type": "audio"}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("event should parse");
        assert!(event.audio_payload().is_none());
    }

    #[test]
    fn test_ping_event_produces_matching_pong() {
        let raw = r#"{"type": "ping", "ping_event": {"event_id": "x1", "ping_ms": 50}}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("event should parse");

        let ServerEvent::Ping { ping_event } = event else {
            panic!("expected Ping");
        };
        let ping = ping_event.expect("ping_event should be present");

        let pong = ClientEvent::Pong {
            event_id: ping.event_id,
        };
        let value = serde_json::to_value(&pong).expect("pong should serialize");
        assert_eq!(value["type"], "pong");
        assert_eq!(value["event_id"], "x1");
    }

    #[test]
    fn test_ping_without_event_id_parses() {
        let raw = r#"{"type": "ping"}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("event should parse");
        let ServerEvent::Ping { ping_event } = event else {
            panic!("expected Ping");
        };
        assert!(ping_event.is_none());
    }

    #[test]
    fn test_interruption_event_parses() {
        let raw = r#"{"type": "interruption", "interruption_event": {"reason": "user"}}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("event should parse");
        assert!(matches!(event, ServerEvent::Interruption));
    }

    #[test]
    fn test_initiation_metadata_parses() {
        let raw = r#"{
            "type": "conversation_initiation_metadata",
            "conversation_initiation_metadata_event": {"conversation_id": "c1"}
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("event should parse");
        assert!(matches!(event, ServerEvent::ConversationInitiationMetadata));
    }

    #[test]
    fn test_unknown_event_types_map_to_other() {
        for raw in [
            r#"{"type": "agent_response", "agent_response_event": {"agent_response": "hi"}}"#,
            r#"{"type": "vad_score", "vad_score_event": {"vad_score": 0.9}}"#,
        ] {
            let event: ServerEvent = serde_json::from_str(raw).expect("event should parse");
            assert!(matches!(event, ServerEvent::Other));
        }
    }
}
