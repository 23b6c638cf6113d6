//! Base64 codec helpers for media-stream audio payloads.
//!
//! Audio is relayed opaquely: Twilio delivers base64-encoded chunks which are
//! decoded once at the call side and re-encoded for the agent protocol. No
//! resampling or transcoding happens anywhere in the bridge.

use base64::Engine;
use bytes::Bytes;

/// Decodes a base64 media payload into raw audio bytes.
/// Returns `None` if the payload is not valid base64.
pub fn decode_payload(payload: &str) -> Option<Bytes> {
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()
        .map(Bytes::from)
}

/// Encodes raw audio bytes as a base64 payload string.
pub fn encode_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
