//! Ranging session parameters exchanged between peers before UWB ranging starts.

use serde::{Deserialize, Serialize};

/// Wire tag for the Accessory role (also used for an unknown role).
pub const ROLE_TAG_ACCESSORY: u8 = 0;
/// Wire tag for the Controller role.
pub const ROLE_TAG_CONTROLLER: u8 = 1;

/// Wire value of a preamble index that has not been assigned yet.
pub const PREAMBLE_UNASSIGNED: i32 = -1;

/// UWB channel both ends range on. Not carried in the config payload.
pub const UWB_CHANNEL: u8 = 9;

/// Role of one side in a two-device ranging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Supplies the authoritative preamble and session key.
    Controller,
    /// Adopts the Controller's parameters.
    Accessory,
}

impl Role {
    /// Default role for a connection: the initiating side controls.
    pub fn for_connection(is_incoming: bool) -> Self {
        if is_incoming {
            Role::Accessory
        } else {
            Role::Controller
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Role::Controller => ROLE_TAG_CONTROLLER,
            Role::Accessory => ROLE_TAG_ACCESSORY,
        }
    }

    /// Any tag other than the Controller tag is read as Accessory.
    pub fn from_tag(tag: u8) -> Self {
        if tag == ROLE_TAG_CONTROLLER {
            Role::Controller
        } else {
            Role::Accessory
        }
    }
}

/// Negotiated ranging parameters. Immutable once built.
///
/// `session_key_info` is always the big-endian bytes of `session_id` and the
/// channel is always [`UWB_CHANNEL`], so the only independent fields are the
/// ones carried by the config payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UwbSessionConfig {
    role: Role,
    session_id: u32,
    session_key_info: Vec<u8>,
    channel: u8,
    preamble_index: Option<u8>,
    peer_address: Vec<u8>,
}

impl UwbSessionConfig {
    pub fn new(
        role: Role,
        session_id: u32,
        preamble_index: Option<u8>,
        peer_address: Vec<u8>,
    ) -> Self {
        Self {
            role,
            session_id,
            session_key_info: session_id.to_be_bytes().to_vec(),
            channel: UWB_CHANNEL,
            preamble_index,
            peer_address,
        }
    }

    /// Accessory announcement: own address only, preamble and key left for the Controller.
    pub fn accessory_announcement(local_address: Vec<u8>) -> Self {
        Self::new(Role::Accessory, 0, None, local_address)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn session_key_info(&self) -> &[u8] {
        &self.session_key_info
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn preamble_index(&self) -> Option<u8> {
        self.preamble_index
    }

    pub fn peer_address(&self) -> &[u8] {
        &self.peer_address
    }

    /// Same parameters, seen from `role` and targeting `peer_address`.
    pub fn with_role_and_peer(&self, role: Role, peer_address: Vec<u8>) -> Self {
        Self::new(role, self.session_id, self.preamble_index, peer_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_direction_picks_role() {
        assert_eq!(Role::for_connection(false), Role::Controller);
        assert_eq!(Role::for_connection(true), Role::Accessory);
    }

    #[test]
    fn unknown_tag_reads_as_accessory() {
        assert_eq!(Role::from_tag(1), Role::Controller);
        assert_eq!(Role::from_tag(0), Role::Accessory);
        assert_eq!(Role::from_tag(7), Role::Accessory);
    }

    #[test]
    fn key_info_follows_session_id() {
        let cfg = UwbSessionConfig::new(Role::Controller, 4242, Some(10), vec![0xAA]);
        assert_eq!(cfg.session_key_info(), &[0, 0, 0x10, 0x92]);
        assert_eq!(cfg.channel(), UWB_CHANNEL);
    }
}
