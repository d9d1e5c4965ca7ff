//! Heartbeat payloads and sender resolution.
//!
//! A heartbeat is the sender's wall clock in milliseconds, as a decimal
//! UTF-8 string, published on `<namespace>/heartbeat/<identity>`.

use crate::keys;
use crate::transport::Sample;

/// Encode a heartbeat payload.
pub fn encode(now_ms: u64) -> Vec<u8> {
    now_ms.to_string().into_bytes()
}

/// Decode a heartbeat payload. Returns None for anything malformed.
pub fn decode(payload: &[u8]) -> Option<u64> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}

/// Identity of the sender, from the topic's trailing segment.
pub fn sender(namespace: &str, sample: &Sample) -> Option<String> {
    keys::heartbeat_identity(namespace, &sample.topic).map(str::to_string)
}
