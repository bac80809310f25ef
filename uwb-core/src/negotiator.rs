//! Role negotiation: pick Controller/Accessory, build our offer, resolve the peer's reply.

use tracing::{debug, info};

use crate::error::RadioError;
use crate::identity::{self, generate_session_key};
use crate::protocol::{Role, UwbSessionConfig};
use crate::radio::RadioCollaborator;
use crate::wire::{self, DecodeError};

/// Build the config we announce to the peer for `role`.
///
/// The address slot carries our own radio address. A Controller also fixes the
/// preamble and a fresh session key; an Accessory leaves both unassigned.
pub fn prepare_offer(
    role: Role,
    radio: &mut dyn RadioCollaborator,
) -> Result<UwbSessionConfig, RadioError> {
    let address = radio.local_address()?;
    match role {
        Role::Controller => {
            let preamble = radio.controller_preamble()?;
            let session_key = generate_session_key();
            debug!("controller offer: preamble {preamble}, session key {session_key}");
            Ok(UwbSessionConfig::new(
                Role::Controller,
                session_key,
                Some(preamble),
                address,
            ))
        }
        Role::Accessory => Ok(UwbSessionConfig::accessory_announcement(address)),
    }
}

/// Combine our offer with the peer's payload into the config the radio is started with.
///
/// As Controller only the peer's address is taken; as Accessory the peer's
/// preamble and session key are used verbatim. When both sides claim
/// Controller, the greater address keeps the role.
pub fn resolve(local: &UwbSessionConfig, incoming: &[u8]) -> Result<UwbSessionConfig, NegotiationError> {
    let remote = wire::decode_config(incoming)?;
    let remote_address = remote.peer_address().to_vec();
    match (local.role(), remote.role()) {
        (Role::Controller, Role::Accessory) => {
            Ok(local.with_role_and_peer(Role::Controller, remote_address))
        }
        (Role::Accessory, Role::Controller) => adopt_controller(&remote),
        (Role::Controller, Role::Controller) => {
            match identity::keeps_controller(local.peer_address(), &remote_address) {
                Some(true) => {
                    info!("both sides claimed controller; keeping the role");
                    Ok(local.with_role_and_peer(Role::Controller, remote_address))
                }
                Some(false) => {
                    info!("both sides claimed controller; yielding to peer");
                    adopt_controller(&remote)
                }
                None => Err(NegotiationError::RoleConflict(Role::Controller)),
            }
        }
        (Role::Accessory, Role::Accessory) => Err(NegotiationError::RoleConflict(Role::Accessory)),
    }
}

fn adopt_controller(remote: &UwbSessionConfig) -> Result<UwbSessionConfig, NegotiationError> {
    if remote.preamble_index().is_none() {
        return Err(NegotiationError::MissingControllerParams);
    }
    Ok(remote.with_role_and_peer(Role::Accessory, remote.peer_address().to_vec()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("both sides claim the {0:?} role")]
    RoleConflict(Role),
    #[error("controller payload without preamble index")]
    MissingControllerParams,
}
