//! Recording collaborators for unit tests.

use crate::error::{RadioError, TransportError};
use crate::identity::PeerId;
use crate::protocol::UwbSessionConfig;
use crate::radio::{RadioCollaborator, StartOutcome};
use crate::transport::OobTransport;

pub struct MockRadio {
    pub supported: bool,
    pub address: Vec<u8>,
    pub preamble: u8,
    pub address_error: Option<RadioError>,
    pub start_outcome: StartOutcome,
    pub start_error: Option<RadioError>,
    pub started: Vec<(PeerId, UwbSessionConfig)>,
    pub stop_calls: Vec<PeerId>,
}

impl MockRadio {
    pub fn with_address(address: Vec<u8>) -> Self {
        Self {
            supported: true,
            address,
            preamble: 10,
            address_error: None,
            start_outcome: StartOutcome::Running,
            start_error: None,
            started: Vec::new(),
            stop_calls: Vec::new(),
        }
    }

    pub fn stops_for(&self, peer: &PeerId) -> usize {
        self.stop_calls.iter().filter(|p| *p == peer).count()
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::with_address(vec![0x01, 0x02])
    }
}

impl RadioCollaborator for MockRadio {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn local_address(&mut self) -> Result<Vec<u8>, RadioError> {
        match &self.address_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.address.clone()),
        }
    }

    fn controller_preamble(&mut self) -> Result<u8, RadioError> {
        Ok(self.preamble)
    }

    fn start_ranging(
        &mut self,
        peer: &PeerId,
        config: &UwbSessionConfig,
    ) -> Result<StartOutcome, RadioError> {
        if let Some(e) = &self.start_error {
            return Err(e.clone());
        }
        self.started.push((peer.clone(), config.clone()));
        Ok(self.start_outcome)
    }

    fn stop_ranging(&mut self, peer: &PeerId) -> Result<(), RadioError> {
        self.stop_calls.push(peer.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTransport {
    pub discovery_starts: Vec<String>,
    pub discovery_stops: usize,
    pub discovery_error: Option<TransportError>,
    /// Number of upcoming connection requests that fail.
    pub failing_requests: u32,
    pub connection_requests: Vec<PeerId>,
    pub accepted: Vec<PeerId>,
    pub rejected: Vec<PeerId>,
    pub disconnects: Vec<PeerId>,
    pub sent: Vec<(PeerId, Vec<u8>)>,
}

impl MockTransport {
    /// Payloads sent to `peer`, oldest first.
    pub fn sent_to(&self, peer: &PeerId) -> Vec<Vec<u8>> {
        self.sent
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

impl OobTransport for MockTransport {
    fn start_discovery(&mut self, local_name: &str) -> Result<(), TransportError> {
        if let Some(e) = &self.discovery_error {
            return Err(e.clone());
        }
        self.discovery_starts.push(local_name.to_owned());
        Ok(())
    }

    fn stop_discovery(&mut self) {
        self.discovery_stops += 1;
    }

    fn request_connection(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.connection_requests.push(peer.clone());
        if self.failing_requests > 0 {
            self.failing_requests -= 1;
            return Err(TransportError::Connect("refused".into()));
        }
        Ok(())
    }

    fn accept_connection(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.accepted.push(peer.clone());
        Ok(())
    }

    fn reject_connection(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.rejected.push(peer.clone());
        Ok(())
    }

    fn disconnect(&mut self, peer: &PeerId) {
        self.disconnects.push(peer.clone());
    }

    fn send_payload(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        self.sent.push((peer.clone(), bytes.to_vec()));
        Ok(())
    }
}
