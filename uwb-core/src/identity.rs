//! Peer identity and per-session secrets: transport-assigned peer ids, session key nonces.

use std::cmp::Ordering;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque transport-assigned endpoint id.
///
/// Only stable for one discovery run; never persist it across discovery restarts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Smallest session key handed out (keeps at least 16 bits of entropy in play).
pub const SESSION_KEY_MIN: u32 = 0x1_0000;
/// Largest session key handed out; peers may read the field as a signed 32-bit value.
pub const SESSION_KEY_MAX: u32 = i32::MAX as u32;

/// Fresh random session key for a Controller. Always non-zero.
pub fn generate_session_key() -> u32 {
    rand::thread_rng().gen_range(SESSION_KEY_MIN..=SESSION_KEY_MAX)
}

/// Tie-break between two sides that both claim Controller.
/// The greater address keeps the role; `None` when the addresses are equal.
pub fn keeps_controller(local_address: &[u8], peer_address: &[u8]) -> Option<bool> {
    match local_address.cmp(peer_address) {
        Ordering::Greater => Some(true),
        Ordering::Less => Some(false),
        Ordering::Equal => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_keys_in_range() {
        for _ in 0..1000 {
            let k = generate_session_key();
            assert!(k >= SESSION_KEY_MIN);
            assert!(k <= SESSION_KEY_MAX);
        }
    }

    #[test]
    fn tie_break_is_symmetric() {
        let a = [0xAA, 0xBB];
        let b = [0xAA, 0xBC];
        assert_eq!(keeps_controller(&a, &b), Some(false));
        assert_eq!(keeps_controller(&b, &a), Some(true));
        assert_eq!(keeps_controller(&a, &a), None);
    }

    #[test]
    fn peer_id_display() {
        let id = PeerId::from("endpoint-7");
        assert_eq!(id.to_string(), "endpoint-7");
        assert_eq!(id.as_str(), "endpoint-7");
    }
}
