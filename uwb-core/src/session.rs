//! Per-peer session state machine. Pure: no I/O; returns actions for the coordinator to run.

use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::identity::PeerId;
use crate::negotiator::{self, NegotiationError};
use crate::normalize::RangingSample;
use crate::protocol::{Role, UwbSessionConfig};
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RoleNegotiating,
    ConfigExchanged,
    Starting,
    Ranging,
    Stopping,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ExplicitStop,
    PeerDisconnected,
    Timeout,
    ConfigError,
    RadioError,
}

/// Lifecycle and result stream delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        peer_id: PeerId,
    },
    Stopped {
        peer_id: PeerId,
        reason: StopReason,
        /// Underlying error message, when there is one.
        detail: Option<String>,
    },
    Sample(RangingSample),
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    SendPayload(Vec<u8>),
    StartRadio(UwbSessionConfig),
    StopRadio,
    Disconnect,
    Emit(SessionEvent),
}

pub struct Session {
    peer_id: PeerId,
    role: Role,
    offer: Option<UwbSessionConfig>,
    config: Option<UwbSessionConfig>,
    state: SessionState,
    last_activity: u64,
    /// Peer payload that arrived before our own offer was ready.
    early_payload: Option<Vec<u8>>,
}

impl Session {
    pub fn new(peer_id: PeerId, role: Role, now: u64) -> Self {
        Self {
            peer_id,
            role,
            offer: None,
            config: None,
            state: SessionState::Idle,
            last_activity: now,
            early_payload: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Intended role until negotiation resolves, then the negotiated one.
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Resolved parameters; `None` until the peer's payload has been accepted.
    pub fn config(&self) -> Option<&UwbSessionConfig> {
        self.config.as_ref()
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    /// Stash a payload that arrived while the coordinator held no session for this peer.
    pub fn buffer_payload(&mut self, bytes: Vec<u8>) {
        self.early_payload = Some(bytes);
    }

    /// OOB link is up and our offer is built: send it and wait for the peer's.
    pub fn begin_negotiation(&mut self, offer: UwbSessionConfig, now: u64) -> Vec<SessionAction> {
        if self.state != SessionState::Idle {
            warn!(
                "session {}: negotiation requested in {:?}; ignoring",
                self.peer_id, self.state
            );
            return vec![];
        }
        debug!("session {}: negotiating as {:?}", self.peer_id, offer.role());
        self.state = SessionState::RoleNegotiating;
        self.last_activity = now;
        let mut actions = vec![SessionAction::SendPayload(wire::encode_config(&offer))];
        self.offer = Some(offer);
        if let Some(early) = self.early_payload.take() {
            actions.extend(self.on_peer_payload(&early, now));
        }
        actions
    }

    pub fn on_peer_payload(&mut self, bytes: &[u8], now: u64) -> Vec<SessionAction> {
        match self.state {
            SessionState::Idle => {
                debug!("session {}: buffering early config payload", self.peer_id);
                self.early_payload = Some(bytes.to_vec());
                vec![]
            }
            SessionState::RoleNegotiating => {
                let Some(offer) = self.offer.as_ref() else {
                    return self.fail(StopReason::ConfigError, Some("no local offer".into()));
                };
                match negotiator::resolve(offer, bytes) {
                    Ok(config) => {
                        info!(
                            "session {}: config exchanged, role {:?}, session id {}",
                            self.peer_id,
                            config.role(),
                            config.session_id()
                        );
                        self.role = config.role();
                        self.config = Some(config.clone());
                        self.state = SessionState::ConfigExchanged;
                        self.last_activity = now;
                        vec![SessionAction::StartRadio(config)]
                    }
                    Err(e) => {
                        warn!("session {}: negotiation failed: {e}", self.peer_id);
                        let detail = match e {
                            NegotiationError::Decode(source) => EngineError::Decode {
                                peer: self.peer_id.clone(),
                                source,
                            }
                            .to_string(),
                            other => other.to_string(),
                        };
                        self.fail(StopReason::ConfigError, Some(detail))
                    }
                }
            }
            state => {
                debug!(
                    "session {}: config payload in {state:?}; ignoring",
                    self.peer_id
                );
                vec![]
            }
        }
    }

    /// The coordinator is about to call the radio. Returns false if not in `ConfigExchanged`.
    pub fn mark_starting(&mut self, now: u64) -> bool {
        if self.state != SessionState::ConfigExchanged {
            return false;
        }
        self.state = SessionState::Starting;
        self.last_activity = now;
        true
    }

    /// Radio confirmed the session is running.
    pub fn on_radio_started(&mut self, now: u64) -> Vec<SessionAction> {
        if self.state != SessionState::Starting {
            debug!(
                "session {}: radio start confirmation in {:?}; ignoring",
                self.peer_id, self.state
            );
            return vec![];
        }
        info!("session {}: ranging", self.peer_id);
        self.state = SessionState::Ranging;
        self.last_activity = now;
        vec![SessionAction::Emit(SessionEvent::Started {
            peer_id: self.peer_id.clone(),
        })]
    }

    /// Samples are only forwarded while ranging.
    pub fn on_sample(&mut self, sample: RangingSample, now: u64) -> Vec<SessionAction> {
        if self.state != SessionState::Ranging {
            return vec![];
        }
        self.last_activity = now;
        vec![SessionAction::Emit(SessionEvent::Sample(sample))]
    }

    /// Orderly shutdown through `Stopping`. No-op once closed.
    pub fn stop(&mut self, reason: StopReason, detail: Option<String>) -> Vec<SessionAction> {
        if self.state.is_terminal() {
            return vec![];
        }
        self.state = SessionState::Stopping;
        self.close(reason, detail)
    }

    /// Failure path through `Error`. Still releases the radio. No-op once closed.
    pub fn fail(&mut self, reason: StopReason, detail: Option<String>) -> Vec<SessionAction> {
        if self.state.is_terminal() {
            return vec![];
        }
        self.state = SessionState::Error;
        self.close(reason, detail)
    }

    fn close(&mut self, reason: StopReason, detail: Option<String>) -> Vec<SessionAction> {
        info!(
            "session {}: closing from {:?} ({reason:?})",
            self.peer_id, self.state
        );
        let mut actions = vec![SessionAction::StopRadio];
        if reason != StopReason::PeerDisconnected {
            actions.push(SessionAction::Disconnect);
        }
        actions.push(SessionAction::Emit(SessionEvent::Stopped {
            peer_id: self.peer_id.clone(),
            reason,
            detail,
        }));
        self.state = SessionState::Closed;
        self.early_payload = None;
        actions
    }

    /// Whether the session sat idle past its limit. A limit of 0 disables the check.
    pub fn is_expired(&self, now: u64, handshake_ticks: u64, ranging_idle_ticks: u64) -> bool {
        let limit = match self.state {
            SessionState::Idle
            | SessionState::RoleNegotiating
            | SessionState::ConfigExchanged
            | SessionState::Starting => handshake_ticks,
            SessionState::Ranging => ranging_idle_ticks,
            SessionState::Stopping | SessionState::Closed | SessionState::Error => 0,
        };
        limit > 0 && now.saturating_sub(self.last_activity) > limit
    }
}
