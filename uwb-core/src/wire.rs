//! Config payload: role tag (1 byte) + preamble (i32 BE) + session key (u32 BE) + address blob.
//!
//! No length prefix; the address runs to the end of the payload.

use crate::protocol::{Role, UwbSessionConfig, PREAMBLE_UNASSIGNED};

/// Size of the fixed part of the payload (role + preamble + session key).
pub const HEADER_LEN: usize = 9;

const PREAMBLE_AT: usize = 1;
const SESSION_KEY_AT: usize = 5;

/// Encode a config into its payload. Never fails.
pub fn encode_config(config: &UwbSessionConfig) -> Vec<u8> {
    let preamble = config
        .preamble_index()
        .map(i32::from)
        .unwrap_or(PREAMBLE_UNASSIGNED);
    let mut out = Vec::with_capacity(HEADER_LEN + config.peer_address().len());
    out.push(config.role().tag());
    out.extend_from_slice(&preamble.to_be_bytes());
    out.extend_from_slice(&config.session_id().to_be_bytes());
    out.extend_from_slice(config.peer_address());
    out
}

/// Decode a payload. The address blob may be empty.
pub fn decode_config(bytes: &[u8]) -> Result<UwbSessionConfig, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TruncatedPayload { len: bytes.len() });
    }
    let role = Role::from_tag(bytes[0]);
    let preamble = i32::from_be_bytes([
        bytes[PREAMBLE_AT],
        bytes[PREAMBLE_AT + 1],
        bytes[PREAMBLE_AT + 2],
        bytes[PREAMBLE_AT + 3],
    ]);
    let preamble_index = match preamble {
        PREAMBLE_UNASSIGNED => None,
        p => Some(u8::try_from(p).map_err(|_| DecodeError::PreambleOutOfRange(p))?),
    };
    let session_id = u32::from_be_bytes([
        bytes[SESSION_KEY_AT],
        bytes[SESSION_KEY_AT + 1],
        bytes[SESSION_KEY_AT + 2],
        bytes[SESSION_KEY_AT + 3],
    ]);
    Ok(UwbSessionConfig::new(
        role,
        session_id,
        preamble_index,
        bytes[HEADER_LEN..].to_vec(),
    ))
}

/// Error decoding a config payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated config payload: {len} bytes, need at least 9")]
    TruncatedPayload { len: usize },
    #[error("preamble index {0} out of range")]
    PreambleOutOfRange(i32),
}
