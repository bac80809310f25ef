//! Endpoint registry: de-duplicates OOB discovery callbacks and tracks connection state.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::identity::PeerId;
use crate::transport::OobTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Found,
    Pending,
    Connected,
    Disconnected,
    Lost,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

/// A peer seen on the OOB transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: PeerId,
    pub display_name: String,
    pub state: EndpointState,
    /// Set once a connection has been requested in either direction.
    pub direction: Option<ConnectionDirection>,
}

impl Endpoint {
    fn found(id: PeerId, display_name: String) -> Self {
        Self {
            id,
            display_name,
            state: EndpointState::Found,
            direction: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    Found(Endpoint),
    Lost(Endpoint),
    /// Must be answered with `handle_connection_request` when incoming.
    ConnectionRequested { endpoint: Endpoint, is_incoming: bool },
    Connected(Endpoint),
    Disconnected(Endpoint),
    Rejected(Endpoint),
    DiscoveryFailed(TransportError),
}

/// Owned by the coordinator; nothing else mutates it.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: HashMap<PeerId, Endpoint>,
    /// Local name we advertise under while discovery runs.
    advertised_as: Option<String>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &PeerId) -> Option<&Endpoint> {
        self.endpoints.get(id)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = self.endpoints.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Peers with a link up or being set up, sorted.
    pub fn linked(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .endpoints
            .values()
            .filter(|e| matches!(e.state, EndpointState::Connected | EndpointState::Pending))
            .map(|e| e.id.clone())
            .collect();
        out.sort();
        out
    }

    pub fn start_discovery(
        &mut self,
        transport: &mut dyn OobTransport,
        local_name: &str,
    ) -> Result<(), TransportError> {
        transport.start_discovery(local_name)?;
        info!("discovery started as {local_name:?}");
        self.advertised_as = Some(local_name.to_owned());
        Ok(())
    }

    /// `in_use` marks peers with a live session; their endpoints survive.
    pub fn stop_discovery(
        &mut self,
        transport: &mut dyn OobTransport,
        in_use: impl Fn(&PeerId) -> bool,
    ) {
        transport.stop_discovery();
        self.advertised_as = None;
        self.clear_idle(in_use);
        info!("discovery stopped");
    }

    /// Stop and restart discovery so previously connected peers show up again.
    /// No-op unless discovery is running. Connected and pending endpoints are kept,
    /// as are those `in_use` reports a live session for.
    pub fn restart_discovery(
        &mut self,
        transport: &mut dyn OobTransport,
        in_use: impl Fn(&PeerId) -> bool,
    ) -> Result<(), TransportError> {
        let Some(name) = self.advertised_as.clone() else {
            return Ok(());
        };
        transport.stop_discovery();
        self.clear_idle(in_use);
        if let Err(e) = transport.start_discovery(&name) {
            self.advertised_as = None;
            return Err(e);
        }
        debug!("discovery restarted");
        Ok(())
    }

    /// Forget endpoints that are only advertisements. A link in progress is kept.
    fn clear_idle(&mut self, in_use: impl Fn(&PeerId) -> bool) {
        self.endpoints.retain(|id, e| {
            matches!(e.state, EndpointState::Connected | EndpointState::Pending) || in_use(id)
        });
    }

    /// Repeated advertisements from a known id are absorbed.
    pub fn on_found(&mut self, id: PeerId, name: String) -> Option<EndpointEvent> {
        if let Some(existing) = self.endpoints.get_mut(&id) {
            existing.display_name = name;
            return None;
        }
        debug!("endpoint {id} ({name}) found");
        let endpoint = Endpoint::found(id.clone(), name);
        self.endpoints.insert(id, endpoint.clone());
        Some(EndpointEvent::Found(endpoint))
    }

    /// Advertisement gone. A connected endpoint keeps its link and stays registered.
    pub fn on_lost(&mut self, id: &PeerId) -> Option<EndpointEvent> {
        if self.get(id).is_some_and(|e| e.state == EndpointState::Connected) {
            debug!("endpoint {id} stopped advertising; link still up");
            return None;
        }
        let Some(mut endpoint) = self.endpoints.remove(id) else {
            debug!("lost unknown endpoint {id}; ignoring");
            return None;
        };
        debug!("endpoint {id} lost");
        endpoint.state = EndpointState::Lost;
        Some(EndpointEvent::Lost(endpoint))
    }

    /// An incoming request may come from a peer we never discovered; it is registered as pending.
    pub fn on_connection_requested(
        &mut self,
        id: &PeerId,
        is_incoming: bool,
    ) -> Option<EndpointEvent> {
        let direction = if is_incoming {
            ConnectionDirection::Incoming
        } else {
            ConnectionDirection::Outgoing
        };
        if !self.endpoints.contains_key(id) {
            if !is_incoming {
                warn!("connection requested for unknown endpoint {id}; ignoring");
                return None;
            }
            self.endpoints
                .insert(id.clone(), Endpoint::found(id.clone(), id.to_string()));
        }
        let endpoint = self.endpoints.get_mut(id)?;
        if endpoint.state == EndpointState::Connected {
            debug!("connection request for already connected endpoint {id}; ignoring");
            return None;
        }
        endpoint.state = EndpointState::Pending;
        endpoint.direction = Some(direction);
        Some(EndpointEvent::ConnectionRequested {
            endpoint: endpoint.clone(),
            is_incoming,
        })
    }

    pub fn on_connected(&mut self, id: &PeerId) -> Option<EndpointEvent> {
        let Some(endpoint) = self.endpoints.get_mut(id) else {
            warn!("connected callback for unknown endpoint {id}; ignoring");
            return None;
        };
        if endpoint.state == EndpointState::Connected {
            return None;
        }
        info!("endpoint {id} connected");
        endpoint.state = EndpointState::Connected;
        Some(EndpointEvent::Connected(endpoint.clone()))
    }

    pub fn on_disconnected(&mut self, id: &PeerId) -> Option<EndpointEvent> {
        let Some(mut endpoint) = self.endpoints.remove(id) else {
            debug!("disconnect from unknown endpoint {id}; ignoring");
            return None;
        };
        info!("endpoint {id} disconnected");
        endpoint.state = EndpointState::Disconnected;
        Some(EndpointEvent::Disconnected(endpoint))
    }

    pub fn on_rejected(&mut self, id: &PeerId) -> Option<EndpointEvent> {
        let Some(endpoint) = self.endpoints.get_mut(id) else {
            warn!("rejection from unknown endpoint {id}; ignoring");
            return None;
        };
        info!("connection with {id} rejected");
        endpoint.state = EndpointState::Rejected;
        Some(EndpointEvent::Rejected(endpoint.clone()))
    }
}
