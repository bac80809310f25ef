//! Error taxonomy shared by the engine and its collaborators.

use crate::identity::PeerId;
use crate::wire::DecodeError;

/// Out-of-band transport failure (discover, advertise, connect, send).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("advertising failed: {0}")]
    Advertise(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Failure reported by the UWB radio.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("UWB not supported on this device")]
    Unsupported,
    #[error("local address unavailable: {0}")]
    Address(String),
    #[error("start ranging failed: {0}")]
    Start(String),
    #[error("stop ranging failed: {0}")]
    Stop(String),
    #[error("ranging session error: {0}")]
    Session(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Error returned or emitted by the engine. Every variant names enough context to display.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("transport error{}: {source}", peer_suffix(.peer))]
    Transport {
        peer: Option<PeerId>,
        source: TransportError,
    },
    #[error("invalid config payload from {peer}: {source}")]
    Decode { peer: PeerId, source: DecodeError },
    #[error("radio error{}: {source}", peer_suffix(.peer))]
    Radio {
        peer: Option<PeerId>,
        source: RadioError,
    },
    #[error("peer {0} is already ranging")]
    AlreadyRanging(PeerId),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("active session limit of {limit} reached")]
    SessionLimit { limit: usize },
    #[error("permission required: {0}")]
    Permission(String),
    #[error("engine stopped")]
    EngineStopped,
}

fn peer_suffix(peer: &Option<PeerId>) -> String {
    peer.as_ref()
        .map(|p| format!(" (peer {p})"))
        .unwrap_or_default()
}

impl EngineError {
    pub fn transport(peer: Option<&PeerId>, source: TransportError) -> Self {
        match source {
            TransportError::PermissionDenied(msg) => EngineError::Permission(msg),
            source => EngineError::Transport {
                peer: peer.cloned(),
                source,
            },
        }
    }

    pub fn radio(peer: Option<&PeerId>, source: RadioError) -> Self {
        match source {
            RadioError::PermissionDenied(msg) => EngineError::Permission(msg),
            source => EngineError::Radio {
                peer: peer.cloned(),
                source,
            },
        }
    }
}
