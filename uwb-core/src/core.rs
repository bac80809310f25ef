//! Host-driven session registry: RangingCore receives commands and collaborator events,
//! drives the per-peer state machines and publishes endpoint/session events.

use std::collections::{HashMap, VecDeque};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::endpoint::{ConnectionDirection, Endpoint, EndpointEvent, EndpointRegistry, EndpointState};
use crate::error::{EngineError, RadioError, TransportError};
use crate::identity::PeerId;
use crate::negotiator;
use crate::normalize;
use crate::protocol::Role;
use crate::radio::{RadioCollaborator, RadioEvent, StartOutcome};
use crate::session::{Session, SessionAction, SessionEvent, SessionState, StopReason};
use crate::transport::{OobEvent, OobTransport};

/// Main coordinator. One instance owns every session; the engine task is its only caller.
pub struct RangingCore<R, T> {
    config: EngineConfig,
    radio: R,
    transport: T,
    endpoints: EndpointRegistry,
    sessions: HashMap<PeerId, Session>,
    /// Config payloads from linked or linking peers that have no session yet.
    pending_payloads: HashMap<PeerId, Vec<u8>>,
    tick_count: u64,
    restart_pending: bool,
    endpoint_tx: broadcast::Sender<EndpointEvent>,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl<R: RadioCollaborator, T: OobTransport> RangingCore<R, T> {
    pub fn new(config: EngineConfig, radio: R, transport: T) -> Self {
        let capacity = config.event_capacity.max(1);
        let (endpoint_tx, _) = broadcast::channel(capacity);
        let (session_tx, _) = broadcast::channel(capacity);
        Self {
            config,
            radio,
            transport,
            endpoints: EndpointRegistry::new(),
            sessions: HashMap::new(),
            pending_payloads: HashMap::new(),
            tick_count: 0,
            restart_pending: false,
            endpoint_tx,
            session_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn subscribe_endpoints(&self) -> broadcast::Receiver<EndpointEvent> {
        self.endpoint_tx.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    pub(crate) fn event_senders(
        &self,
    ) -> (
        broadcast::Sender<EndpointEvent>,
        broadcast::Sender<SessionEvent>,
    ) {
        (self.endpoint_tx.clone(), self.session_tx.clone())
    }

    pub fn radio_supported(&self) -> bool {
        self.radio.is_supported()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.endpoints()
    }

    pub fn session_state(&self, peer: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer).map(Session::state)
    }

    /// Peers with a live session, sorted.
    pub fn active_sessions(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn discover(&mut self, local_name: &str) -> Result<(), EngineError> {
        self.endpoints
            .start_discovery(&mut self.transport, local_name)
            .map_err(|e| EngineError::transport(None, e))
    }

    pub fn stop_discovery(&mut self) {
        let sessions = &self.sessions;
        self.endpoints
            .stop_discovery(&mut self.transport, |p| sessions.contains_key(p));
    }

    /// Open an OOB link without starting a session.
    pub fn connect(&mut self, peer: &PeerId) -> Result<(), EngineError> {
        let Some(endpoint) = self.endpoints.get(peer) else {
            return Err(EngineError::UnknownPeer(peer.clone()));
        };
        if matches!(
            endpoint.state,
            EndpointState::Connected | EndpointState::Pending
        ) {
            debug!("connect to {peer}: already {:?}", endpoint.state);
            return Ok(());
        }
        self.request_connection(peer)
    }

    /// Answer an incoming connection request surfaced as `EndpointEvent::ConnectionRequested`.
    pub fn handle_connection_request(
        &mut self,
        peer: &PeerId,
        accept: bool,
    ) -> Result<(), EngineError> {
        match self.endpoints.get(peer) {
            Some(e) if e.state == EndpointState::Pending => {}
            _ => return Err(EngineError::UnknownPeer(peer.clone())),
        }
        let result = if accept {
            info!("accepting connection from {peer}");
            self.transport.accept_connection(peer)
        } else {
            info!("rejecting connection from {peer}");
            self.transport.reject_connection(peer)
        };
        result.map_err(|e| EngineError::transport(Some(peer), e))
    }

    /// Create a session for `peer` and connect to it if needed. Negotiation starts once linked.
    pub fn start_ranging(&mut self, peer: &PeerId) -> Result<(), EngineError> {
        if self.sessions.contains_key(peer) {
            warn!("start ranging with {peer} rejected: session already live");
            return Err(EngineError::AlreadyRanging(peer.clone()));
        }
        let Some(endpoint) = self.endpoints.get(peer) else {
            return Err(EngineError::UnknownPeer(peer.clone()));
        };
        let (state, direction) = (endpoint.state, endpoint.direction);
        if let Some(limit) = self.limit_reached() {
            warn!("start ranging with {peer} rejected: {limit} sessions live");
            return Err(EngineError::SessionLimit { limit });
        }
        if !self.radio.is_supported() {
            return Err(EngineError::radio(Some(peer), RadioError::Unsupported));
        }

        let role = Role::for_connection(direction == Some(ConnectionDirection::Incoming));
        match state {
            EndpointState::Connected | EndpointState::Pending => {}
            _ => self.request_connection(peer)?,
        }

        info!("starting ranging with {peer} as {role:?}");
        let mut session = Session::new(peer.clone(), role, self.tick_count);
        if let Some(early) = self.pending_payloads.remove(peer) {
            session.buffer_payload(early);
        }
        self.sessions.insert(peer.clone(), session);
        if state == EndpointState::Connected {
            self.begin_negotiation(peer);
        }
        self.finish();
        Ok(())
    }

    /// Stop the session with `peer`. Missing or already closed sessions are a no-op.
    pub fn stop_ranging(&mut self, peer: &PeerId) {
        let actions = self.with_session(peer, |s, _| s.stop(StopReason::ExplicitStop, None));
        if actions.is_empty() {
            debug!("stop ranging with {peer}: no live session");
            return;
        }
        self.run_actions(peer, actions);
        self.finish();
    }

    /// Stop every session and drop every OOB link. Nothing survives, even if a collaborator fails.
    pub fn stop_all(&mut self) {
        info!("stopping all sessions ({} live)", self.sessions.len());
        for peer in self.active_sessions() {
            let actions = self.with_session(&peer, |s, _| s.stop(StopReason::ExplicitStop, None));
            self.run_actions(&peer, actions);
            if self.sessions.remove(&peer).is_some() {
                warn!("session {peer} did not close cleanly; forcing closed");
            }
        }
        for peer in self.endpoints.linked() {
            self.drop_link(&peer);
        }
        self.pending_payloads.clear();
        self.finish();
    }

    /// Advance the tick counter and close sessions that went quiet.
    pub fn tick(&mut self) {
        self.tick_count += 1;
        let now = self.tick_count;
        let (handshake, idle) = (
            self.config.handshake_timeout_ticks,
            self.config.ranging_idle_timeout_ticks,
        );
        let mut expired: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now, handshake, idle))
            .map(|s| s.peer_id().clone())
            .collect();
        expired.sort();
        for peer in expired {
            info!("session {peer} timed out");
            let actions = self.with_session(&peer, |s, _| s.stop(StopReason::Timeout, None));
            self.run_actions(&peer, actions);
        }
        self.finish();
    }

    pub fn handle_oob_event(&mut self, event: OobEvent) {
        self.dispatch_oob(event);
        self.finish();
    }

    pub fn handle_radio_event(&mut self, event: RadioEvent) {
        let (peer, actions) = match event {
            RadioEvent::Started(peer) => {
                let actions = self.with_session(&peer, |s, now| s.on_radio_started(now));
                (peer, actions)
            }
            RadioEvent::Position(peer, raw) => {
                let Some(sample) = normalize::normalize(&peer, &raw) else {
                    debug!("empty measurement for {peer}; dropping");
                    return;
                };
                let actions = self.with_session(&peer, |s, now| s.on_sample(sample, now));
                (peer, actions)
            }
            RadioEvent::PeerLost(peer) => {
                let actions = self.with_session(&peer, |s, _| {
                    s.stop(
                        StopReason::PeerDisconnected,
                        Some("radio lost peer".to_owned()),
                    )
                });
                (peer, actions)
            }
            RadioEvent::SessionError(peer, e) => {
                warn!("radio session error for {peer}: {e}");
                let detail = EngineError::radio(Some(&peer), e).to_string();
                let actions =
                    self.with_session(&peer, |s, _| s.fail(StopReason::RadioError, Some(detail)));
                (peer, actions)
            }
        };
        self.run_actions(&peer, actions);
        self.finish();
    }

    fn dispatch_oob(&mut self, event: OobEvent) {
        match event {
            OobEvent::Found { id, name } => {
                if let Some(ev) = self.endpoints.on_found(id, name) {
                    self.emit_endpoint(ev);
                }
            }
            OobEvent::Lost { id } => {
                if let Some(ev) = self.endpoints.on_lost(&id) {
                    self.emit_endpoint(ev);
                }
                // Ranging sessions ride out advertisement loss.
                let actions = self.with_session(&id, |s, _| {
                    if s.state() == SessionState::Ranging {
                        vec![]
                    } else {
                        s.fail(
                            StopReason::PeerDisconnected,
                            Some("endpoint lost".to_owned()),
                        )
                    }
                });
                self.run_actions(&id, actions);
            }
            OobEvent::ConnectionRequested { id, is_incoming } => {
                let Some(ev) = self.endpoints.on_connection_requested(&id, is_incoming) else {
                    return;
                };
                self.emit_endpoint(ev);
                if is_incoming {
                    return;
                }
                if let Err(e) = self.transport.accept_connection(&id) {
                    warn!("accepting own connection to {id} failed: {e}");
                    let detail = EngineError::transport(Some(&id), e).to_string();
                    let actions = self.with_session(&id, |s, _| {
                        s.fail(StopReason::PeerDisconnected, Some(detail))
                    });
                    self.run_actions(&id, actions);
                }
            }
            OobEvent::Connected { id } => {
                let Some(ev) = self.endpoints.on_connected(&id) else {
                    return;
                };
                let incoming = matches!(
                    &ev,
                    EndpointEvent::Connected(e) if e.direction == Some(ConnectionDirection::Incoming)
                );
                self.emit_endpoint(ev);
                if self.sessions.contains_key(&id) {
                    self.begin_negotiation(&id);
                } else if incoming {
                    self.open_responder_session(&id);
                } else {
                    debug!("connected to {id}; no session requested");
                }
            }
            OobEvent::Disconnected { id } => {
                if let Some(ev) = self.endpoints.on_disconnected(&id) {
                    self.emit_endpoint(ev);
                }
                self.pending_payloads.remove(&id);
                let actions =
                    self.with_session(&id, |s, _| s.fail(StopReason::PeerDisconnected, None));
                self.run_actions(&id, actions);
            }
            OobEvent::Rejected { id } => {
                if let Some(ev) = self.endpoints.on_rejected(&id) {
                    self.emit_endpoint(ev);
                }
                self.pending_payloads.remove(&id);
                let actions = self.with_session(&id, |s, _| {
                    s.fail(
                        StopReason::PeerDisconnected,
                        Some("connection rejected".to_owned()),
                    )
                });
                self.run_actions(&id, actions);
            }
            OobEvent::Payload { id, bytes } => {
                if self.sessions.contains_key(&id) {
                    let actions = self.with_session(&id, |s, now| s.on_peer_payload(&bytes, now));
                    self.run_actions(&id, actions);
                } else if self.endpoints.get(&id).is_some_and(|e| {
                    matches!(e.state, EndpointState::Connected | EndpointState::Pending)
                }) {
                    debug!("holding config payload from {id} until ranging starts");
                    self.pending_payloads.insert(id, bytes);
                } else {
                    warn!("payload from unconnected peer {id}; dropping");
                }
            }
            OobEvent::DiscoveryFailed(e) => {
                warn!("discovery failed: {e}");
                self.emit_endpoint(EndpointEvent::DiscoveryFailed(e));
            }
        }
    }

    fn request_connection(&mut self, peer: &PeerId) -> Result<(), EngineError> {
        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.request_connection(peer) {
                Ok(()) => {
                    debug!("connection to {peer} requested (attempt {attempt}/{attempts})");
                    return Ok(());
                }
                Err(e) if attempt < attempts && !matches!(e, TransportError::PermissionDenied(_)) => {
                    warn!("connection request to {peer} failed (attempt {attempt}/{attempts}): {e}");
                    self.transport.disconnect(peer);
                    attempt += 1;
                }
                Err(e) => {
                    warn!("giving up on connection to {peer}: {e}");
                    return Err(EngineError::transport(Some(peer), e));
                }
            }
        }
    }

    /// Incoming link completed without a local session: answer as Accessory.
    fn open_responder_session(&mut self, peer: &PeerId) {
        if let Some(limit) = self.limit_reached() {
            warn!("session limit {limit} reached; dropping connection from {peer}");
            self.drop_link(peer);
            return;
        }
        if !self.radio.is_supported() {
            warn!("no UWB radio; dropping connection from {peer}");
            self.drop_link(peer);
            return;
        }
        info!("opening responder session for {peer}");
        let mut session = Session::new(peer.clone(), Role::for_connection(true), self.tick_count);
        if let Some(early) = self.pending_payloads.remove(peer) {
            session.buffer_payload(early);
        }
        self.sessions.insert(peer.clone(), session);
        self.begin_negotiation(peer);
    }

    fn begin_negotiation(&mut self, peer: &PeerId) {
        let Some(role) = self.sessions.get(peer).map(Session::role) else {
            return;
        };
        let actions = match negotiator::prepare_offer(role, &mut self.radio) {
            Ok(offer) => self.with_session(peer, |s, now| s.begin_negotiation(offer, now)),
            Err(e) => {
                warn!("cannot build offer for {peer}: {e}");
                let detail = EngineError::radio(Some(peer), e).to_string();
                self.with_session(peer, |s, _| s.fail(StopReason::RadioError, Some(detail)))
            }
        };
        self.run_actions(peer, actions);
    }

    fn with_session(
        &mut self,
        peer: &PeerId,
        f: impl FnOnce(&mut Session, u64) -> Vec<SessionAction>,
    ) -> Vec<SessionAction> {
        let now = self.tick_count;
        match self.sessions.get_mut(peer) {
            Some(session) => f(session, now),
            None => {
                debug!("no session for {peer}; ignoring");
                vec![]
            }
        }
    }

    fn run_actions(&mut self, peer: &PeerId, actions: Vec<SessionAction>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::SendPayload(bytes) => {
                    if let Err(e) = self.transport.send_payload(peer, &bytes) {
                        warn!("sending config to {peer} failed: {e}");
                        let detail = EngineError::transport(Some(peer), e).to_string();
                        queue.extend(self.with_session(peer, |s, _| {
                            s.fail(StopReason::PeerDisconnected, Some(detail))
                        }));
                    }
                }
                SessionAction::StartRadio(config) => {
                    let now = self.tick_count;
                    let Some(session) = self.sessions.get_mut(peer) else {
                        continue;
                    };
                    if !session.mark_starting(now) {
                        continue;
                    }
                    match self.radio.start_ranging(peer, &config) {
                        Ok(StartOutcome::Running) => queue.extend(session.on_radio_started(now)),
                        Ok(StartOutcome::Pending) => {
                            debug!("radio start for {peer} pending confirmation")
                        }
                        Err(e) => {
                            warn!("radio start for {peer} failed: {e}");
                            let detail = EngineError::radio(Some(peer), e).to_string();
                            queue.extend(session.fail(StopReason::RadioError, Some(detail)));
                        }
                    }
                }
                SessionAction::StopRadio => {
                    if let Err(e) = self.radio.stop_ranging(peer) {
                        warn!("radio stop for {peer} failed: {e}; closing anyway");
                    }
                }
                SessionAction::Disconnect => self.drop_link(peer),
                SessionAction::Emit(event) => self.emit_session(event),
            }
        }
        self.reap(peer);
    }

    fn drop_link(&mut self, peer: &PeerId) {
        self.transport.disconnect(peer);
        self.pending_payloads.remove(peer);
        let linked = self.endpoints.get(peer).is_some_and(|e| {
            matches!(e.state, EndpointState::Connected | EndpointState::Pending)
        });
        if linked {
            if let Some(ev) = self.endpoints.on_disconnected(peer) {
                self.emit_endpoint(ev);
            }
        }
    }

    fn reap(&mut self, peer: &PeerId) {
        if self
            .sessions
            .get(peer)
            .is_some_and(|s| s.state().is_terminal())
        {
            self.sessions.remove(peer);
            debug!("session {peer} removed");
            if self.config.restart_discovery_on_close {
                self.restart_pending = true;
            }
        }
    }

    /// Runs once per entry point so a burst of closures restarts discovery only once.
    fn finish(&mut self) {
        if !std::mem::take(&mut self.restart_pending) {
            return;
        }
        let sessions = &self.sessions;
        let restarted = self
            .endpoints
            .restart_discovery(&mut self.transport, |p| sessions.contains_key(p));
        if let Err(e) = restarted {
            warn!("discovery restart failed: {e}");
            self.emit_endpoint(EndpointEvent::DiscoveryFailed(e));
        }
    }

    fn limit_reached(&self) -> Option<usize> {
        self.config
            .session_limit()
            .filter(|limit| self.sessions.len() >= *limit)
    }

    fn emit_endpoint(&self, event: EndpointEvent) {
        // No subscribers is fine.
        let _ = self.endpoint_tx.send(event);
    }

    fn emit_session(&self, event: SessionEvent) {
        let _ = self.session_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UwbSessionConfig;
    use crate::radio::{RawMeasurement, Vec3};
    use crate::testing::{MockRadio, MockTransport};
    use crate::wire::encode_config;

    type TestCore = RangingCore<MockRadio, MockTransport>;

    fn core_with(config: EngineConfig, address: Vec<u8>) -> TestCore {
        RangingCore::new(config, MockRadio::with_address(address), MockTransport::default())
    }

    fn core() -> TestCore {
        core_with(EngineConfig::default(), vec![0xAA, 0xBB, 0xCC, 0xDD])
    }

    fn id(s: &str) -> PeerId {
        PeerId::from(s)
    }

    fn accessory_reply() -> Vec<u8> {
        encode_config(&UwbSessionConfig::accessory_announcement(vec![0x11, 0x22]))
    }

    fn drain<E: Clone>(rx: &mut broadcast::Receiver<E>) -> Vec<E> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn stops(events: &[SessionEvent]) -> Vec<(PeerId, StopReason)> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Stopped {
                    peer_id, reason, ..
                } => Some((peer_id.clone(), *reason)),
                _ => None,
            })
            .collect()
    }

    fn found(core: &mut TestCore, peer: &str) {
        core.handle_oob_event(OobEvent::Found {
            id: id(peer),
            name: peer.to_uppercase(),
        });
    }

    fn link_outgoing(core: &mut TestCore, peer: &str) {
        core.handle_oob_event(OobEvent::ConnectionRequested {
            id: id(peer),
            is_incoming: false,
        });
        core.handle_oob_event(OobEvent::Connected { id: id(peer) });
    }

    fn ranging_with(core: &mut TestCore, peer: &str) {
        found(core, peer);
        core.start_ranging(&id(peer)).unwrap();
        link_outgoing(core, peer);
        core.handle_oob_event(OobEvent::Payload {
            id: id(peer),
            bytes: accessory_reply(),
        });
        assert_eq!(core.session_state(&id(peer)), Some(SessionState::Ranging));
    }

    #[test]
    fn controller_flow_reaches_ranging() {
        let mut core = core();
        let mut sessions = core.subscribe_sessions();
        found(&mut core, "b");
        core.start_ranging(&id("b")).unwrap();
        assert_eq!(core.transport().connection_requests, vec![id("b")]);
        assert_eq!(core.session_state(&id("b")), Some(SessionState::Idle));

        link_outgoing(&mut core, "b");
        assert_eq!(core.transport().accepted, vec![id("b")]);
        assert_eq!(
            core.session_state(&id("b")),
            Some(SessionState::RoleNegotiating)
        );
        let sent = core.transport().sent_to(&id("b"));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], 1);

        core.handle_oob_event(OobEvent::Payload {
            id: id("b"),
            bytes: accessory_reply(),
        });
        assert_eq!(core.session_state(&id("b")), Some(SessionState::Ranging));
        let (peer, cfg) = &core.radio().started[0];
        assert_eq!(peer, &id("b"));
        assert_eq!(cfg.role(), Role::Controller);
        assert_eq!(cfg.preamble_index(), Some(10));
        assert_eq!(cfg.peer_address(), &[0x11, 0x22]);
        assert_eq!(
            drain(&mut sessions),
            vec![SessionEvent::Started { peer_id: id("b") }]
        );
    }

    #[test]
    fn second_start_is_rejected() {
        let mut core = core();
        found(&mut core, "b");
        core.start_ranging(&id("b")).unwrap();
        assert_eq!(
            core.start_ranging(&id("b")),
            Err(EngineError::AlreadyRanging(id("b")))
        );
        link_outgoing(&mut core, "b");
        core.handle_oob_event(OobEvent::Payload {
            id: id("b"),
            bytes: accessory_reply(),
        });
        assert_eq!(
            core.start_ranging(&id("b")),
            Err(EngineError::AlreadyRanging(id("b")))
        );
        assert_eq!(core.radio().started.len(), 1);
        assert_eq!(core.transport().connection_requests.len(), 1);
    }

    #[test]
    fn start_rejects_unknown_peer_and_missing_radio() {
        let mut core = core();
        assert_eq!(
            core.start_ranging(&id("ghost")),
            Err(EngineError::UnknownPeer(id("ghost")))
        );
        core.radio.supported = false;
        found(&mut core, "b");
        assert!(!core.radio_supported());
        assert_eq!(
            core.start_ranging(&id("b")),
            Err(EngineError::Radio {
                peer: Some(id("b")),
                source: RadioError::Unsupported
            })
        );
        assert!(core.active_sessions().is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut core = core();
        ranging_with(&mut core, "b");
        let mut sessions = core.subscribe_sessions();
        core.stop_ranging(&id("b"));
        core.stop_ranging(&id("b"));
        core.stop_ranging(&id("never"));
        assert_eq!(
            stops(&drain(&mut sessions)),
            vec![(id("b"), StopReason::ExplicitStop)]
        );
        assert_eq!(core.radio().stops_for(&id("b")), 1);
        assert_eq!(core.transport().disconnects, vec![id("b")]);
        assert_eq!(core.session_state(&id("b")), None);
    }

    #[test]
    fn disconnect_forces_closure_in_every_state() {
        // Idle, negotiating, ranging
        for stage in 0..3 {
            let mut core = core();
            let mut sessions = core.subscribe_sessions();
            found(&mut core, "b");
            core.start_ranging(&id("b")).unwrap();
            if stage >= 1 {
                link_outgoing(&mut core, "b");
            }
            if stage >= 2 {
                core.handle_oob_event(OobEvent::Payload {
                    id: id("b"),
                    bytes: accessory_reply(),
                });
            }
            core.handle_oob_event(OobEvent::Disconnected { id: id("b") });
            assert_eq!(
                stops(&drain(&mut sessions)),
                vec![(id("b"), StopReason::PeerDisconnected)],
                "stage {stage}"
            );
            assert_eq!(core.radio().stops_for(&id("b")), 1, "stage {stage}");
            assert!(core.transport().disconnects.is_empty(), "stage {stage}");
            assert!(core.active_sessions().is_empty());

            core.handle_oob_event(OobEvent::Disconnected { id: id("b") });
            assert_eq!(core.radio().stops_for(&id("b")), 1);
        }
    }

    #[test]
    fn two_engines_negotiate_complementary_roles() {
        let mut a = core_with(EngineConfig::default(), vec![0xAA, 0xBB, 0xCC, 0xDD]);
        let mut b = core_with(EngineConfig::default(), vec![0x11, 0x22]);
        let mut b_endpoints = b.subscribe_endpoints();
        let mut a_sessions = a.subscribe_sessions();
        let mut b_sessions = b.subscribe_sessions();

        found(&mut a, "b");
        a.start_ranging(&id("b")).unwrap();
        a.handle_oob_event(OobEvent::ConnectionRequested {
            id: id("b"),
            is_incoming: false,
        });
        b.handle_oob_event(OobEvent::ConnectionRequested {
            id: id("a"),
            is_incoming: true,
        });
        assert!(matches!(
            drain(&mut b_endpoints).as_slice(),
            [EndpointEvent::ConnectionRequested {
                is_incoming: true,
                ..
            }]
        ));
        b.handle_connection_request(&id("a"), true).unwrap();
        assert_eq!(b.transport().accepted, vec![id("a")]);

        a.handle_oob_event(OobEvent::Connected { id: id("b") });
        b.handle_oob_event(OobEvent::Connected { id: id("a") });
        assert_eq!(
            b.session_state(&id("a")),
            Some(SessionState::RoleNegotiating)
        );

        let a_offer = a.transport().sent_to(&id("b")).remove(0);
        let b_offer = b.transport().sent_to(&id("a")).remove(0);
        b.handle_oob_event(OobEvent::Payload {
            id: id("a"),
            bytes: a_offer,
        });
        a.handle_oob_event(OobEvent::Payload {
            id: id("b"),
            bytes: b_offer,
        });

        let a_cfg = &a.radio().started[0].1;
        let b_cfg = &b.radio().started[0].1;
        assert_eq!(a_cfg.role(), Role::Controller);
        assert_eq!(b_cfg.role(), Role::Accessory);
        assert_eq!(a_cfg.session_id(), b_cfg.session_id());
        assert_eq!(b_cfg.preamble_index(), Some(10));
        assert_eq!(a_cfg.peer_address(), &[0x11, 0x22]);
        assert_eq!(b_cfg.peer_address(), &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(
            drain(&mut a_sessions),
            vec![SessionEvent::Started { peer_id: id("b") }]
        );
        assert_eq!(
            drain(&mut b_sessions),
            vec![SessionEvent::Started { peer_id: id("a") }]
        );
    }

    #[test]
    fn incoming_request_can_be_rejected() {
        let mut core = core();
        assert_eq!(
            core.handle_connection_request(&id("x"), true),
            Err(EngineError::UnknownPeer(id("x")))
        );
        core.handle_oob_event(OobEvent::ConnectionRequested {
            id: id("x"),
            is_incoming: true,
        });
        core.handle_connection_request(&id("x"), false).unwrap();
        assert_eq!(core.transport().rejected, vec![id("x")]);
        assert!(core.transport().accepted.is_empty());
    }

    #[test]
    fn session_limit_is_enforced() {
        let config = EngineConfig {
            max_active_sessions: 1,
            ..EngineConfig::default()
        };
        let mut core = core_with(config, vec![0xAA]);
        found(&mut core, "b");
        found(&mut core, "c");
        core.start_ranging(&id("b")).unwrap();
        assert_eq!(
            core.start_ranging(&id("c")),
            Err(EngineError::SessionLimit { limit: 1 })
        );

        // Over the cap an incoming link is dropped instead of answered.
        core.handle_oob_event(OobEvent::ConnectionRequested {
            id: id("d"),
            is_incoming: true,
        });
        core.handle_oob_event(OobEvent::Connected { id: id("d") });
        assert_eq!(core.session_state(&id("d")), None);
        assert_eq!(core.transport().disconnects, vec![id("d")]);

        core.stop_ranging(&id("b"));
        found(&mut core, "c");
        core.start_ranging(&id("c")).unwrap();
    }

    #[test]
    fn handshake_timeout_closes_session() {
        let config = EngineConfig {
            handshake_timeout_ticks: 2,
            ..EngineConfig::default()
        };
        let mut core = core_with(config, vec![0xAA]);
        let mut sessions = core.subscribe_sessions();
        found(&mut core, "b");
        core.start_ranging(&id("b")).unwrap();
        core.tick();
        core.tick();
        assert_eq!(core.session_state(&id("b")), Some(SessionState::Idle));
        core.tick();
        assert_eq!(core.session_state(&id("b")), None);
        assert_eq!(
            stops(&drain(&mut sessions)),
            vec![(id("b"), StopReason::Timeout)]
        );
        assert_eq!(core.radio().stops_for(&id("b")), 1);
        assert_eq!(core.transport().disconnects, vec![id("b")]);
    }

    #[test]
    fn ranging_idle_timeout_is_reset_by_samples() {
        let config = EngineConfig {
            handshake_timeout_ticks: 0,
            ranging_idle_timeout_ticks: 2,
            ..EngineConfig::default()
        };
        let mut core = core_with(config, vec![0xAA]);
        ranging_with(&mut core, "b");
        for _ in 0..5 {
            core.tick();
            core.handle_radio_event(RadioEvent::Position(
                id("b"),
                RawMeasurement {
                    distance: Some(1.0),
                    ..Default::default()
                },
            ));
        }
        assert_eq!(core.session_state(&id("b")), Some(SessionState::Ranging));
        core.tick();
        core.tick();
        core.tick();
        assert_eq!(core.session_state(&id("b")), None);
    }

    #[test]
    fn stop_all_leaves_nothing_behind() {
        let mut core = core();
        let mut sessions = core.subscribe_sessions();
        ranging_with(&mut core, "b");
        ranging_with(&mut core, "c");
        found(&mut core, "d");
        core.connect(&id("d")).unwrap();
        link_outgoing(&mut core, "d");
        found(&mut core, "e");
        core.connect(&id("e")).unwrap();
        core.handle_oob_event(OobEvent::ConnectionRequested {
            id: id("e"),
            is_incoming: false,
        });
        drain(&mut sessions);

        core.stop_all();
        assert!(core.active_sessions().is_empty());
        assert!(core.endpoints().iter().all(|e| !matches!(
            e.state,
            EndpointState::Connected | EndpointState::Pending
        )));
        let mut disconnects = core.transport().disconnects.clone();
        disconnects.sort();
        assert_eq!(disconnects, vec![id("b"), id("c"), id("d"), id("e")]);
        assert_eq!(
            stops(&drain(&mut sessions)),
            vec![
                (id("b"), StopReason::ExplicitStop),
                (id("c"), StopReason::ExplicitStop)
            ]
        );
        assert_eq!(core.radio().stop_calls.len(), 2);
    }

    #[test]
    fn samples_are_normalized_and_gated_on_ranging() {
        let mut core = core();
        core.radio.start_outcome = StartOutcome::Pending;
        let mut sessions = core.subscribe_sessions();
        found(&mut core, "b");
        core.start_ranging(&id("b")).unwrap();
        link_outgoing(&mut core, "b");
        core.handle_oob_event(OobEvent::Payload {
            id: id("b"),
            bytes: accessory_reply(),
        });
        assert_eq!(core.session_state(&id("b")), Some(SessionState::Starting));

        let raw = RawMeasurement {
            distance: Some(2.5),
            direction: Some(Vec3::new(0.0, 1.0, 0.0)),
            ..Default::default()
        };
        core.handle_radio_event(RadioEvent::Position(id("b"), raw.clone()));
        assert!(drain(&mut sessions).is_empty());

        core.handle_radio_event(RadioEvent::Started(id("b")));
        core.handle_radio_event(RadioEvent::Position(id("b"), raw));
        core.handle_radio_event(RadioEvent::Position(id("b"), RawMeasurement::default()));
        let events = drain(&mut sessions);
        assert_eq!(events.len(), 2);
        match &events[1] {
            SessionEvent::Sample(s) => {
                assert_eq!(s.distance_m, Some(2.5));
                assert!(s.azimuth_rad.unwrap().abs() < 1e-12);
            }
            other => panic!("expected sample, got {other:?}"),
        }
    }

    #[test]
    fn radio_failures_close_with_radio_error() {
        let mut core = core();
        core.radio.start_error = Some(RadioError::Start("busy".into()));
        let mut sessions = core.subscribe_sessions();
        found(&mut core, "b");
        core.start_ranging(&id("b")).unwrap();
        link_outgoing(&mut core, "b");
        core.handle_oob_event(OobEvent::Payload {
            id: id("b"),
            bytes: accessory_reply(),
        });
        assert_eq!(
            stops(&drain(&mut sessions)),
            vec![(id("b"), StopReason::RadioError)]
        );
        assert_eq!(core.radio().stops_for(&id("b")), 1);

        core.radio.start_error = None;
        ranging_with(&mut core, "c");
        core.handle_radio_event(RadioEvent::SessionError(
            id("c"),
            RadioError::Session("lost sync".into()),
        ));
        match drain(&mut sessions).last() {
            Some(SessionEvent::Stopped { reason, detail, .. }) => {
                assert_eq!(*reason, StopReason::RadioError);
                assert_eq!(
                    detail.as_deref(),
                    Some("radio error (peer c): ranging session error: lost sync")
                );
            }
            other => panic!("expected stop, got {other:?}"),
        }
    }

    #[test]
    fn radio_peer_lost_keeps_oob_link() {
        let mut core = core();
        ranging_with(&mut core, "b");
        core.handle_radio_event(RadioEvent::PeerLost(id("b")));
        assert_eq!(core.session_state(&id("b")), None);
        assert_eq!(core.radio().stops_for(&id("b")), 1);
        assert!(core.transport().disconnects.is_empty());
        assert_eq!(
            core.endpoints.get(&id("b")).map(|e| e.state),
            Some(EndpointState::Connected)
        );
    }

    #[test]
    fn endpoint_lost_spares_ranging_sessions() {
        let mut core = core();
        ranging_with(&mut core, "b");
        found(&mut core, "c");
        core.start_ranging(&id("c")).unwrap();

        core.handle_oob_event(OobEvent::Lost { id: id("b") });
        core.handle_oob_event(OobEvent::Lost { id: id("c") });
        assert_eq!(core.session_state(&id("b")), Some(SessionState::Ranging));
        assert_eq!(core.session_state(&id("c")), None);
        assert_eq!(core.radio().stops_for(&id("c")), 1);
    }

    #[test]
    fn connect_retries_then_gives_up() {
        let mut core = core();
        core.transport.failing_requests = 2;
        found(&mut core, "b");
        core.start_ranging(&id("b")).unwrap();
        assert_eq!(core.transport().connection_requests.len(), 3);
        assert_eq!(core.transport().disconnects, vec![id("b"), id("b")]);

        core.transport.failing_requests = 3;
        found(&mut core, "c");
        let err = core.start_ranging(&id("c")).unwrap_err();
        assert!(matches!(err, EngineError::Transport { .. }));
        assert_eq!(core.session_state(&id("c")), None);
    }

    #[test]
    fn payload_before_start_is_held() {
        let mut core = core();
        found(&mut core, "b");
        core.connect(&id("b")).unwrap();
        link_outgoing(&mut core, "b");
        assert_eq!(core.session_state(&id("b")), None);

        core.handle_oob_event(OobEvent::Payload {
            id: id("b"),
            bytes: accessory_reply(),
        });
        core.start_ranging(&id("b")).unwrap();
        assert_eq!(core.session_state(&id("b")), Some(SessionState::Ranging));
        assert_eq!(core.transport().connection_requests, vec![id("b")]);
    }

    #[test]
    fn payload_racing_incoming_connect_is_kept() {
        let mut core = core();
        core.handle_oob_event(OobEvent::ConnectionRequested {
            id: id("x"),
            is_incoming: true,
        });
        core.handle_connection_request(&id("x"), true).unwrap();
        let offer = UwbSessionConfig::new(Role::Controller, 777, Some(11), vec![0x42]);
        core.handle_oob_event(OobEvent::Payload {
            id: id("x"),
            bytes: encode_config(&offer),
        });
        core.handle_oob_event(OobEvent::Connected { id: id("x") });

        assert_eq!(core.session_state(&id("x")), Some(SessionState::Ranging));
        let (_, cfg) = &core.radio().started[0];
        assert_eq!(cfg.role(), Role::Accessory);
        assert_eq!(cfg.session_id(), 777);
        assert_eq!(cfg.preamble_index(), Some(11));
        assert_eq!(cfg.peer_address(), &[0x42]);
    }

    #[test]
    fn bad_payload_closes_only_that_session() {
        let mut core = core();
        let mut sessions = core.subscribe_sessions();
        ranging_with(&mut core, "b");
        found(&mut core, "c");
        core.start_ranging(&id("c")).unwrap();
        link_outgoing(&mut core, "c");
        core.handle_oob_event(OobEvent::Payload {
            id: id("c"),
            bytes: vec![1, 2, 3],
        });
        assert_eq!(core.session_state(&id("c")), None);
        assert_eq!(core.session_state(&id("b")), Some(SessionState::Ranging));
        assert!(stops(&drain(&mut sessions)).contains(&(id("c"), StopReason::ConfigError)));
    }

    #[test]
    fn discovery_restarts_after_close() {
        let mut core = core();
        let mut endpoints = core.subscribe_endpoints();
        core.discover("me").unwrap();
        ranging_with(&mut core, "b");
        core.stop_ranging(&id("b"));
        assert_eq!(core.transport().discovery_starts, vec!["me", "me"]);
        assert_eq!(core.transport().discovery_stops, 1);

        core.transport.discovery_error = Some(TransportError::Discovery("radio off".into()));
        ranging_with(&mut core, "c");
        core.stop_ranging(&id("c"));
        assert!(drain(&mut endpoints)
            .iter()
            .any(|e| matches!(e, EndpointEvent::DiscoveryFailed(_))));
    }

    #[test]
    fn restart_spares_other_handshakes() {
        let mut core = core();
        core.discover("me").unwrap();
        ranging_with(&mut core, "b");

        found(&mut core, "c");
        core.start_ranging(&id("c")).unwrap();
        core.handle_oob_event(OobEvent::ConnectionRequested {
            id: id("c"),
            is_incoming: false,
        });
        found(&mut core, "d");
        core.start_ranging(&id("d")).unwrap();
        core.handle_oob_event(OobEvent::ConnectionRequested {
            id: id("e"),
            is_incoming: true,
        });
        found(&mut core, "f");

        core.stop_ranging(&id("b"));
        assert_eq!(core.transport().discovery_stops, 1);
        let states: Vec<(PeerId, EndpointState)> = core
            .endpoints()
            .into_iter()
            .map(|e| (e.id, e.state))
            .collect();
        assert_eq!(
            states,
            vec![
                (id("c"), EndpointState::Pending),
                (id("d"), EndpointState::Found),
                (id("e"), EndpointState::Pending),
            ]
        );

        core.handle_oob_event(OobEvent::Connected { id: id("c") });
        assert_eq!(
            core.session_state(&id("c")),
            Some(SessionState::RoleNegotiating)
        );
        assert_eq!(core.transport().sent_to(&id("c")).len(), 1);

        link_outgoing(&mut core, "d");
        assert!(core.transport().accepted.contains(&id("d")));
        assert_eq!(
            core.session_state(&id("d")),
            Some(SessionState::RoleNegotiating)
        );

        assert_eq!(core.handle_connection_request(&id("e"), true), Ok(()));
    }

    #[test]
    fn discovery_failure_is_reported() {
        let mut core = core();
        core.transport.discovery_error = Some(TransportError::PermissionDenied("nearby".into()));
        assert_eq!(
            core.discover("me"),
            Err(EngineError::Permission("nearby".into()))
        );
    }
}
