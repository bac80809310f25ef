//! UWB peer ranging engine.
//! Host-driven core: the host passes collaborator events and commands; the core drives
//! per-peer sessions and publishes endpoint and session events. `engine` runs it on tokio.

pub mod config;
pub mod core;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod identity;
pub mod negotiator;
pub mod normalize;
pub mod protocol;
pub mod radio;
pub mod session;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use crate::core::RangingCore;
pub use endpoint::{ConnectionDirection, Endpoint, EndpointEvent, EndpointState};
pub use engine::{Engine, EngineInbox, OobSink, RadioSink};
pub use error::{EngineError, RadioError, TransportError};
pub use identity::PeerId;
pub use normalize::RangingSample;
pub use protocol::{Role, UwbSessionConfig};
pub use radio::{RadioCollaborator, RadioEvent, RawMeasurement, StartOutcome, Vec3};
pub use session::{SessionEvent, SessionState, StopReason};
pub use transport::{OobEvent, OobTransport};
pub use wire::{decode_config, encode_config, DecodeError};
