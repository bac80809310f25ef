//! UWB radio collaborator: the platform binding that performs the actual ranging.

use crate::error::RadioError;
use crate::identity::PeerId;
use crate::protocol::UwbSessionConfig;

/// 3D unit direction vector reported by the radio (peer frame, x right, y up, z forward).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// One raw measurement as the platform delivers it. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMeasurement {
    pub distance: Option<f64>,
    pub direction: Option<Vec3>,
    pub azimuth: Option<f64>,
    pub elevation: Option<f64>,
    pub horizontal_angle: Option<f64>,
}

/// How the radio answered a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Session is already running (synchronous platform API).
    Running,
    /// Confirmation follows as [`RadioEvent::Started`].
    Pending,
}

/// Events pushed by the radio. The binding maps its own peer tokens back to peer ids.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Started(PeerId),
    Position(PeerId, RawMeasurement),
    PeerLost(PeerId),
    SessionError(PeerId, RadioError),
}

/// Calls the engine makes into the radio. Implementations must not block for long;
/// anything slow is reported back through [`RadioEvent`]s.
pub trait RadioCollaborator: Send {
    /// Whether this device has a usable UWB radio.
    fn is_supported(&self) -> bool {
        true
    }

    /// Local radio address shared with the peer.
    fn local_address(&mut self) -> Result<Vec<u8>, RadioError>;

    /// Preamble index the local radio picks when acting as Controller.
    fn controller_preamble(&mut self) -> Result<u8, RadioError>;

    fn start_ranging(
        &mut self,
        peer: &PeerId,
        config: &UwbSessionConfig,
    ) -> Result<StartOutcome, RadioError>;

    /// Tear down the ranging session with `peer`. Must tolerate peers that never started.
    fn stop_ranging(&mut self, peer: &PeerId) -> Result<(), RadioError>;
}
