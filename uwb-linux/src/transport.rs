//! OOB transport handle the engine calls into. Work is queued for the LAN link task.

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;
use uwb_core::{OobTransport, PeerId, TransportError};

/// Work for the LAN link task (see `discovery::run_discovery`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    StartDiscovery(String),
    StopDiscovery,
    Request(Uuid),
    Accept(Uuid),
    Reject(Uuid),
    Disconnect(Uuid),
    Send(Uuid, Vec<u8>),
}

pub struct LanTransport {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl LanTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// `failed` builds the error returned when the link task is gone.
    fn queue(
        &self,
        cmd: LinkCommand,
        failed: fn(String) -> TransportError,
    ) -> Result<(), TransportError> {
        self.tx.send(cmd).map_err(|_| failed(LINK_DOWN.into()))
    }
}

/// Peer ids on the LAN are the remote daemon's instance uuid.
pub fn instance_of(peer: &PeerId) -> Result<Uuid, TransportError> {
    Uuid::parse_str(peer.as_str())
        .map_err(|_| TransportError::Connect(format!("not a LAN peer id: {peer}")))
}

const LINK_DOWN: &str = "LAN link task stopped";

impl OobTransport for LanTransport {
    fn start_discovery(&mut self, local_name: &str) -> Result<(), TransportError> {
        self.queue(
            LinkCommand::StartDiscovery(local_name.to_owned()),
            TransportError::Discovery,
        )
    }

    fn stop_discovery(&mut self) {
        if let Err(e) = self.queue(LinkCommand::StopDiscovery, TransportError::Discovery) {
            debug!("stop discovery: {e}");
        }
    }

    fn request_connection(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let id = instance_of(peer)?;
        self.queue(LinkCommand::Request(id), TransportError::Connect)
    }

    fn accept_connection(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let id = instance_of(peer)?;
        self.queue(LinkCommand::Accept(id), TransportError::Connect)
    }

    fn reject_connection(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let id = instance_of(peer)?;
        self.queue(LinkCommand::Reject(id), TransportError::Connect)
    }

    fn disconnect(&mut self, peer: &PeerId) {
        let queued = instance_of(peer)
            .and_then(|id| self.queue(LinkCommand::Disconnect(id), TransportError::Connect));
        if let Err(e) = queued {
            debug!("disconnect {peer}: {e}");
        }
    }

    fn send_payload(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        let id = instance_of(peer)?;
        self.queue(LinkCommand::Send(id, bytes.to_vec()), TransportError::Send)
    }
}
