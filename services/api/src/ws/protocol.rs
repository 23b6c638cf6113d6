//! Defines the Twilio media-stream wire protocol carried over the call-side
//! WebSocket connection.
//!
//! Both directions are JSON frames tagged by an `event` field. Unrecognized
//! inbound events collapse into a single catch-all variant so new frame kinds
//! from the provider never break an active call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Frames received from Twilio on the media-stream connection.
#[derive(Deserialize, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TwilioEvent {
    /// The stream is live; carries the call-leg identifier and the custom
    /// parameters attached when the call was placed.
    Start { start: StreamStart },
    /// One chunk of caller audio, base64-encoded.
    Media { media: MediaPayload },
    /// The stream has ended; no further frames follow.
    Stop,
    /// Any other event kind (`connected`, `mark`, ...) is ignored.
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Deserialize, Debug)]
pub struct MediaPayload {
    pub payload: String,
}

/// Frames sent to Twilio on the media-stream connection. Every outbound frame
/// must carry the stream SID assigned in the `start` event.
#[derive(Serialize, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TwilioFrame {
    /// Agent audio for playback to the caller.
    #[serde(rename_all = "camelCase")]
    Media {
        stream_sid: String,
        media: OutboundMedia,
    },
    /// Discards any audio Twilio has buffered for playback (barge-in).
    #[serde(rename_all = "camelCase")]
    Clear { stream_sid: String },
}

#[derive(Serialize, Debug)]
pub struct OutboundMedia {
    pub payload: String,
}
