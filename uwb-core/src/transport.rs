//! Out-of-band transport collaborator: discovery, connection lifecycle and payload delivery.

use crate::error::TransportError;
use crate::identity::PeerId;

/// Callbacks from the OOB transport, delivered to the engine as messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OobEvent {
    Found { id: PeerId, name: String },
    Lost { id: PeerId },
    ConnectionRequested { id: PeerId, is_incoming: bool },
    Connected { id: PeerId },
    Disconnected { id: PeerId },
    Rejected { id: PeerId },
    Payload { id: PeerId, bytes: Vec<u8> },
    /// Discovery or advertising failed as a whole.
    DiscoveryFailed(TransportError),
}

/// Calls the engine makes into the OOB transport. Results arrive as [`OobEvent`]s.
pub trait OobTransport: Send {
    /// Start browsing for peers and advertising ourselves as `local_name`.
    fn start_discovery(&mut self, local_name: &str) -> Result<(), TransportError>;

    fn stop_discovery(&mut self);

    fn request_connection(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    fn accept_connection(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    fn reject_connection(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    fn disconnect(&mut self, peer: &PeerId);

    fn send_payload(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<(), TransportError>;
}
