//! LAN out-of-band link: UDP multicast beacons for discovery, unicast datagrams for
//! connection control and config payloads. One socket carries both.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use uwb_core::{OobEvent, OobSink, PeerId};

use crate::transport::LinkCommand;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const PEER_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DATAGRAM: usize = 65536;

/// Datagram body (bincode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanMessage {
    Beacon {
        service_id: String,
        instance: Uuid,
        name: String,
    },
    ConnectRequest {
        from: Uuid,
        name: String,
    },
    ConnectResponse {
        from: Uuid,
        accepted: bool,
    },
    Payload {
        from: Uuid,
        bytes: Vec<u8>,
    },
    Disconnect {
        from: Uuid,
    },
}

impl LanMessage {
    fn sender(&self) -> Uuid {
        match self {
            LanMessage::Beacon { instance, .. } => *instance,
            LanMessage::ConnectRequest { from, .. }
            | LanMessage::ConnectResponse { from, .. }
            | LanMessage::Payload { from, .. }
            | LanMessage::Disconnect { from } => *from,
        }
    }
}

struct PeerState {
    addr: SocketAddr,
    name: String,
    last_seen: Instant,
    /// Reported as found since discovery last (re)started.
    announced: bool,
}

struct Link {
    incoming: bool,
    local_accepted: bool,
    remote_accepted: bool,
    connected: bool,
}

/// Result of one step: callbacks for the engine and datagrams to send.
#[derive(Debug, Default, PartialEq)]
pub struct Effects {
    pub events: Vec<OobEvent>,
    pub outgoing: Vec<(SocketAddr, LanMessage)>,
}

/// Link bookkeeping. No I/O; the loops below feed it and carry out its effects.
pub struct LanState {
    instance: Uuid,
    service_id: String,
    group: SocketAddr,
    /// Advertised name while discovery runs.
    local_name: Option<String>,
    peers: HashMap<Uuid, PeerState>,
    links: HashMap<Uuid, Link>,
}

fn peer_id(id: Uuid) -> PeerId {
    PeerId::from(id.to_string())
}

impl LanState {
    pub fn new(instance: Uuid, service_id: String, group: SocketAddr) -> Self {
        Self {
            instance,
            service_id,
            group,
            local_name: None,
            peers: HashMap::new(),
            links: HashMap::new(),
        }
    }

    fn beacon(&self) -> Option<LanMessage> {
        self.local_name.as_ref().map(|name| LanMessage::Beacon {
            service_id: self.service_id.clone(),
            instance: self.instance,
            name: name.clone(),
        })
    }

    /// Beacon to multicast, if discovery is running.
    pub fn on_beacon_timer(&self) -> Effects {
        let mut fx = Effects::default();
        if let Some(b) = self.beacon() {
            fx.outgoing.push((self.group, b));
        }
        fx
    }

    pub fn on_command(&mut self, cmd: LinkCommand) -> Effects {
        let mut fx = Effects::default();
        match cmd {
            LinkCommand::StartDiscovery(name) => {
                info!("advertising as {name:?}");
                self.local_name = Some(name);
                fx = self.on_beacon_timer();
                // Peers already heard from are reported again right away.
                let mut known: Vec<(&Uuid, &mut PeerState)> = self.peers.iter_mut().collect();
                known.sort_by_key(|(id, _)| **id);
                for (id, p) in known {
                    p.announced = true;
                    fx.events.push(OobEvent::Found {
                        id: peer_id(*id),
                        name: p.name.clone(),
                    });
                }
            }
            LinkCommand::StopDiscovery => {
                self.local_name = None;
            }
            LinkCommand::Request(id) => {
                let Some(peer) = self.peers.get(&id) else {
                    warn!("connection request to unknown LAN peer {id}");
                    fx.events.push(OobEvent::Rejected { id: peer_id(id) });
                    return fx;
                };
                self.links.insert(
                    id,
                    Link {
                        incoming: false,
                        local_accepted: false,
                        remote_accepted: false,
                        connected: false,
                    },
                );
                fx.outgoing.push((
                    peer.addr,
                    LanMessage::ConnectRequest {
                        from: self.instance,
                        name: self.local_name.clone().unwrap_or_default(),
                    },
                ));
                fx.events.push(OobEvent::ConnectionRequested {
                    id: peer_id(id),
                    is_incoming: false,
                });
            }
            LinkCommand::Accept(id) => {
                let Some(link) = self.links.get_mut(&id) else {
                    debug!("accept for unknown link {id}");
                    return fx;
                };
                link.local_accepted = true;
                if link.incoming {
                    if let Some(peer) = self.peers.get(&id) {
                        fx.outgoing.push((
                            peer.addr,
                            LanMessage::ConnectResponse {
                                from: self.instance,
                                accepted: true,
                            },
                        ));
                    }
                }
                if link.remote_accepted && !link.connected {
                    link.connected = true;
                    fx.events.push(OobEvent::Connected { id: peer_id(id) });
                }
            }
            LinkCommand::Reject(id) => {
                let Some(link) = self.links.remove(&id) else {
                    return fx;
                };
                if link.incoming {
                    if let Some(peer) = self.peers.get(&id) {
                        fx.outgoing.push((
                            peer.addr,
                            LanMessage::ConnectResponse {
                                from: self.instance,
                                accepted: false,
                            },
                        ));
                    }
                }
                fx.events.push(OobEvent::Rejected { id: peer_id(id) });
            }
            LinkCommand::Disconnect(id) => {
                if self.links.remove(&id).is_some() {
                    if let Some(peer) = self.peers.get(&id) {
                        fx.outgoing
                            .push((peer.addr, LanMessage::Disconnect { from: self.instance }));
                    }
                }
            }
            LinkCommand::Send(id, bytes) => {
                let connected = self.links.get(&id).is_some_and(|l| l.connected);
                match self.peers.get(&id) {
                    Some(peer) if connected => fx.outgoing.push((
                        peer.addr,
                        LanMessage::Payload {
                            from: self.instance,
                            bytes,
                        },
                    )),
                    _ => warn!("payload for {id} without a link; dropping"),
                }
            }
        }
        fx
    }

    pub fn on_message(&mut self, from: SocketAddr, msg: LanMessage, now: Instant) -> Effects {
        let mut fx = Effects::default();
        let sender = msg.sender();
        if sender == self.instance {
            return fx;
        }
        if let Some(p) = self.peers.get_mut(&sender) {
            p.addr = from;
            p.last_seen = now;
        }
        match msg {
            LanMessage::Beacon {
                service_id, name, ..
            } => {
                if service_id != self.service_id {
                    return fx;
                }
                let discovering = self.local_name.is_some();
                let peer = self.peers.entry(sender).or_insert_with(|| PeerState {
                    addr: from,
                    name: name.clone(),
                    last_seen: now,
                    announced: false,
                });
                peer.name = name;
                if discovering && !peer.announced {
                    peer.announced = true;
                    fx.events.push(OobEvent::Found {
                        id: peer_id(sender),
                        name: peer.name.clone(),
                    });
                }
            }
            LanMessage::ConnectRequest { name, .. } => {
                self.peers.entry(sender).or_insert_with(|| PeerState {
                    addr: from,
                    name,
                    last_seen: now,
                    announced: false,
                });
                match self.links.get_mut(&sender) {
                    // Both sides asked at once: treat as mutual.
                    Some(link) if !link.incoming => {
                        link.remote_accepted = true;
                        fx.outgoing.push((
                            from,
                            LanMessage::ConnectResponse {
                                from: self.instance,
                                accepted: true,
                            },
                        ));
                        if link.local_accepted && !link.connected {
                            link.connected = true;
                            fx.events.push(OobEvent::Connected {
                                id: peer_id(sender),
                            });
                        }
                    }
                    Some(_) => debug!("duplicate connection request from {sender}"),
                    None => {
                        self.links.insert(
                            sender,
                            Link {
                                incoming: true,
                                local_accepted: false,
                                remote_accepted: true,
                                connected: false,
                            },
                        );
                        fx.events.push(OobEvent::ConnectionRequested {
                            id: peer_id(sender),
                            is_incoming: true,
                        });
                    }
                }
            }
            LanMessage::ConnectResponse { accepted, .. } => {
                if !accepted {
                    if self.links.remove(&sender).is_some() {
                        fx.events.push(OobEvent::Rejected {
                            id: peer_id(sender),
                        });
                    }
                    return fx;
                }
                let Some(link) = self.links.get_mut(&sender) else {
                    debug!("response from {sender} without a pending request");
                    return fx;
                };
                link.remote_accepted = true;
                if link.local_accepted && !link.connected {
                    link.connected = true;
                    fx.events.push(OobEvent::Connected {
                        id: peer_id(sender),
                    });
                }
            }
            LanMessage::Payload { bytes, .. } => {
                if self.links.get(&sender).is_some_and(|l| l.connected) {
                    fx.events.push(OobEvent::Payload {
                        id: peer_id(sender),
                        bytes,
                    });
                } else {
                    debug!("payload from {sender} without a link; dropping");
                }
            }
            LanMessage::Disconnect { .. } => {
                if self.links.remove(&sender).is_some() {
                    fx.events.push(OobEvent::Disconnected {
                        id: peer_id(sender),
                    });
                }
            }
        }
        fx
    }

    /// Drop peers silent for `PEER_TIMEOUT`, and their links with them.
    pub fn expire(&mut self, now: Instant) -> Effects {
        let mut fx = Effects::default();
        let mut gone: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) >= PEER_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        gone.sort();
        for id in gone {
            let announced = self.peers.remove(&id).is_some_and(|p| p.announced);
            debug!("LAN peer {id} timed out");
            if self.links.remove(&id).is_some() {
                fx.events.push(OobEvent::Disconnected { id: peer_id(id) });
            }
            if announced {
                fx.events.push(OobEvent::Lost { id: peer_id(id) });
            }
        }
        fx
    }
}

pub async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

pub fn group_addr(discovery_port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, discovery_port))
}

pub async fn run_discovery(
    socket: UdpSocket,
    state: LanState,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    sink: OobSink,
) -> std::io::Result<()> {
    let socket = Arc::new(socket);
    let state = Arc::new(Mutex::new(state));

    let beacon_task = tokio::spawn(beacon_loop(socket.clone(), state.clone()));
    let recv_task = tokio::spawn(recv_loop(socket.clone(), state.clone(), sink.clone()));
    let command_task = tokio::spawn(command_loop(
        socket.clone(),
        state.clone(),
        commands,
        sink.clone(),
    ));
    let timeout_task = tokio::spawn(peer_timeout_loop(socket, state, sink));

    // Ends when the socket fails or the engine drops its transport.
    tokio::select! {
        r = recv_task => r.unwrap_or(Ok(())),
        _ = command_task => Ok(()),
        _ = beacon_task => Ok(()),
        _ = timeout_task => Ok(()),
    }
}

/// Run one state step. Events are queued to the engine while the state lock is held,
/// and before any datagram the peer could answer, so the engine sees a peer's events
/// in the order the link state changed.
async fn apply(
    socket: &UdpSocket,
    state: &Mutex<LanState>,
    sink: &OobSink,
    step: impl FnOnce(&mut LanState) -> Effects,
) -> bool {
    let outgoing = {
        let mut state = state.lock().await;
        let fx = step(&mut state);
        for event in fx.events {
            if sink.send(event).await.is_err() {
                return false;
            }
        }
        fx.outgoing
    };
    for (dest, msg) in outgoing {
        if let Err(e) = send_message(socket, dest, &msg).await {
            warn!("send to {dest} failed: {e}");
        }
    }
    true
}

async fn send_message(socket: &UdpSocket, dest: SocketAddr, msg: &LanMessage) -> std::io::Result<()> {
    let frame = bincode::serialize(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    socket.send_to(&frame, dest).await.map(|_| ())
}

async fn beacon_loop(socket: Arc<UdpSocket>, state: Arc<Mutex<LanState>>) {
    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
    loop {
        ticker.tick().await;
        let fx = state.lock().await.on_beacon_timer();
        for (dest, msg) in fx.outgoing {
            if let Err(e) = send_message(&socket, dest, &msg).await {
                debug!("beacon to {dest} failed: {e}");
            }
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<LanState>>,
    sink: OobSink,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let msg: LanMessage = match bincode::deserialize(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                debug!("undecodable datagram from {from}: {e}");
                continue;
            }
        };
        let now = Instant::now();
        if !apply(&socket, &state, &sink, |s| s.on_message(from, msg, now)).await {
            return Ok(());
        }
    }
}

async fn command_loop(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<LanState>>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    sink: OobSink,
) {
    while let Some(cmd) = commands.recv().await {
        if !apply(&socket, &state, &sink, |s| s.on_command(cmd)).await {
            break;
        }
    }
}

async fn peer_timeout_loop(socket: Arc<UdpSocket>, state: Arc<Mutex<LanState>>, sink: OobSink) {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        if !apply(&socket, &state, &sink, |s| s.expire(now)).await {
            return;
        }
    }
}
