//! Async engine: runs a [`RangingCore`] on its own tokio task and exposes a cloneable handle.
//!
//! Commands from the application and callbacks from the collaborators share one queue,
//! so the core only ever sees one message at a time.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::core::RangingCore;
use crate::endpoint::{Endpoint, EndpointEvent};
use crate::error::EngineError;
use crate::identity::PeerId;
use crate::radio::{RadioCollaborator, RadioEvent};
use crate::session::{SessionEvent, SessionState};
use crate::transport::{OobEvent, OobTransport};

type Reply<V> = oneshot::Sender<V>;

enum Command {
    Discover {
        local_name: String,
        reply: Reply<Result<(), EngineError>>,
    },
    StopDiscovery {
        reply: Reply<()>,
    },
    Connect {
        peer: PeerId,
        reply: Reply<Result<(), EngineError>>,
    },
    HandleConnectionRequest {
        peer: PeerId,
        accept: bool,
        reply: Reply<Result<(), EngineError>>,
    },
    StartRanging {
        peer: PeerId,
        reply: Reply<Result<(), EngineError>>,
    },
    StopRanging {
        peer: PeerId,
        reply: Reply<()>,
    },
    StopAll {
        reply: Reply<()>,
    },
    Endpoints {
        reply: Reply<Vec<Endpoint>>,
    },
    SessionState {
        peer: PeerId,
        reply: Reply<Option<SessionState>>,
    },
    RadioSupported {
        reply: Reply<bool>,
    },
    Oob(OobEvent),
    Radio(RadioEvent),
    Shutdown {
        reply: Reply<()>,
    },
}

/// Where the OOB transport delivers its callbacks.
#[derive(Clone)]
pub struct OobSink {
    tx: mpsc::Sender<Command>,
}

impl OobSink {
    pub async fn send(&self, event: OobEvent) -> Result<(), EngineError> {
        self.tx
            .send(Command::Oob(event))
            .await
            .map_err(|_| EngineError::EngineStopped)
    }
}

/// Where the radio delivers its callbacks.
#[derive(Clone)]
pub struct RadioSink {
    tx: mpsc::Sender<Command>,
}

impl RadioSink {
    pub async fn send(&self, event: RadioEvent) -> Result<(), EngineError> {
        self.tx
            .send(Command::Radio(event))
            .await
            .map_err(|_| EngineError::EngineStopped)
    }
}

/// Receiving half of the engine queue, created before the collaborators so they can hold sinks.
pub struct EngineInbox {
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
}

impl EngineInbox {
    pub fn new(config: &EngineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        Self { tx, rx }
    }

    pub fn oob_sink(&self) -> OobSink {
        OobSink {
            tx: self.tx.clone(),
        }
    }

    pub fn radio_sink(&self) -> RadioSink {
        RadioSink {
            tx: self.tx.clone(),
        }
    }
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::Sender<Command>,
    endpoint_tx: broadcast::Sender<EndpointEvent>,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl Engine {
    /// Move `core` onto its own task. The task ends on [`Engine::shutdown`].
    pub fn spawn<R, T>(inbox: EngineInbox, core: RangingCore<R, T>) -> (Engine, JoinHandle<()>)
    where
        R: RadioCollaborator + 'static,
        T: OobTransport + 'static,
    {
        let (endpoint_tx, session_tx) = core.event_senders();
        let EngineInbox { tx, rx } = inbox;
        let handle = tokio::spawn(run(core, rx));
        (
            Engine {
                commands: tx,
                endpoint_tx,
                session_tx,
            },
            handle,
        )
    }

    pub fn subscribe_endpoints(&self) -> broadcast::Receiver<EndpointEvent> {
        self.endpoint_tx.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    async fn request<V>(&self, make: impl FnOnce(Reply<V>) -> Command) -> Result<V, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    pub async fn discover(&self, local_name: impl Into<String>) -> Result<(), EngineError> {
        let local_name = local_name.into();
        self.request(|reply| Command::Discover { local_name, reply })
            .await?
    }

    pub async fn stop_discovery(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::StopDiscovery { reply }).await
    }

    pub async fn connect(&self, peer: PeerId) -> Result<(), EngineError> {
        self.request(|reply| Command::Connect { peer, reply })
            .await?
    }

    pub async fn handle_connection_request(
        &self,
        peer: PeerId,
        accept: bool,
    ) -> Result<(), EngineError> {
        self.request(|reply| Command::HandleConnectionRequest {
            peer,
            accept,
            reply,
        })
        .await?
    }

    /// Negotiate roles with `peer` and start the radio. Fails with `AlreadyRanging` if a session is live.
    pub async fn start_ranging(&self, peer: PeerId) -> Result<(), EngineError> {
        self.request(|reply| Command::StartRanging { peer, reply })
            .await?
    }

    /// Returns once the session is closed and the radio released. Idempotent.
    pub async fn stop_ranging(&self, peer: PeerId) -> Result<(), EngineError> {
        self.request(|reply| Command::StopRanging { peer, reply })
            .await
    }

    pub async fn stop_all(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::StopAll { reply }).await
    }

    pub async fn endpoints(&self) -> Result<Vec<Endpoint>, EngineError> {
        self.request(|reply| Command::Endpoints { reply }).await
    }

    pub async fn session_state(&self, peer: PeerId) -> Result<Option<SessionState>, EngineError> {
        self.request(|reply| Command::SessionState { peer, reply })
            .await
    }

    pub async fn radio_supported(&self) -> Result<bool, EngineError> {
        self.request(|reply| Command::RadioSupported { reply }).await
    }

    /// Stop every session and end the engine task.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

async fn run<R, T>(mut core: RangingCore<R, T>, mut rx: mpsc::Receiver<Command>)
where
    R: RadioCollaborator,
    T: OobTransport,
{
    let period = Duration::from_millis(core.config().tick_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;
    info!("engine running, tick every {period:?}");

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Shutdown { reply }) => {
                    core.stop_all();
                    let _ = reply.send(());
                    break;
                }
                Some(cmd) => handle_command(&mut core, cmd),
                None => {
                    debug!("all engine handles dropped");
                    core.stop_all();
                    break;
                }
            },
            _ = ticker.tick() => core.tick(),
        }
    }
    info!("engine stopped");
}

fn handle_command<R, T>(core: &mut RangingCore<R, T>, cmd: Command)
where
    R: RadioCollaborator,
    T: OobTransport,
{
    // A dropped reply receiver just means the caller stopped waiting.
    match cmd {
        Command::Discover { local_name, reply } => {
            let _ = reply.send(core.discover(&local_name));
        }
        Command::StopDiscovery { reply } => {
            core.stop_discovery();
            let _ = reply.send(());
        }
        Command::Connect { peer, reply } => {
            let _ = reply.send(core.connect(&peer));
        }
        Command::HandleConnectionRequest {
            peer,
            accept,
            reply,
        } => {
            let _ = reply.send(core.handle_connection_request(&peer, accept));
        }
        Command::StartRanging { peer, reply } => {
            let _ = reply.send(core.start_ranging(&peer));
        }
        Command::StopRanging { peer, reply } => {
            core.stop_ranging(&peer);
            let _ = reply.send(());
        }
        Command::StopAll { reply } => {
            core.stop_all();
            let _ = reply.send(());
        }
        Command::Endpoints { reply } => {
            let _ = reply.send(core.endpoints());
        }
        Command::SessionState { peer, reply } => {
            let _ = reply.send(core.session_state(&peer));
        }
        Command::RadioSupported { reply } => {
            let _ = reply.send(core.radio_supported());
        }
        Command::Oob(event) => core.handle_oob_event(event),
        Command::Radio(event) => core.handle_radio_event(event),
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UwbSessionConfig;
    use crate::radio::RawMeasurement;
    use crate::session::StopReason;
    use crate::testing::{MockRadio, MockTransport};
    use crate::wire::encode_config;

    fn id(s: &str) -> PeerId {
        PeerId::from(s)
    }

    fn spawn_with(config: EngineConfig) -> (Engine, OobSink, RadioSink, JoinHandle<()>) {
        let inbox = EngineInbox::new(&config);
        let oob = inbox.oob_sink();
        let radio = inbox.radio_sink();
        let core = RangingCore::new(
            config,
            MockRadio::with_address(vec![0xAA, 0xBB]),
            MockTransport::default(),
        );
        let (engine, handle) = Engine::spawn(inbox, core);
        (engine, oob, radio, handle)
    }

    async fn link(oob: &OobSink, peer: &str) {
        oob.send(OobEvent::Found {
            id: id(peer),
            name: peer.into(),
        })
        .await
        .unwrap();
    }

    async fn connect_and_answer(oob: &OobSink, peer: &str) {
        oob.send(OobEvent::ConnectionRequested {
            id: id(peer),
            is_incoming: false,
        })
        .await
        .unwrap();
        oob.send(OobEvent::Connected { id: id(peer) }).await.unwrap();
        oob.send(OobEvent::Payload {
            id: id(peer),
            bytes: encode_config(&UwbSessionConfig::accessory_announcement(vec![0x01])),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn ranging_round_trip_through_the_actor() {
        let (engine, oob, radio, handle) = spawn_with(EngineConfig::default());
        let mut sessions = engine.subscribe_sessions();
        let mut endpoints = engine.subscribe_endpoints();

        assert!(engine.radio_supported().await.unwrap());
        engine.discover("me").await.unwrap();
        link(&oob, "b").await;
        assert!(matches!(
            endpoints.recv().await.unwrap(),
            EndpointEvent::Found(_)
        ));
        assert_eq!(engine.endpoints().await.unwrap().len(), 1);

        engine.start_ranging(id("b")).await.unwrap();
        assert_eq!(
            engine.start_ranging(id("b")).await,
            Err(EngineError::AlreadyRanging(id("b")))
        );
        connect_and_answer(&oob, "b").await;
        assert_eq!(
            sessions.recv().await.unwrap(),
            SessionEvent::Started { peer_id: id("b") }
        );
        assert_eq!(
            engine.session_state(id("b")).await.unwrap(),
            Some(SessionState::Ranging)
        );

        radio
            .send(RadioEvent::Position(
                id("b"),
                RawMeasurement {
                    distance: Some(0.8),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        match sessions.recv().await.unwrap() {
            SessionEvent::Sample(s) => assert_eq!(s.distance_m, Some(0.8)),
            other => panic!("expected sample, got {other:?}"),
        }

        engine.stop_ranging(id("b")).await.unwrap();
        engine.stop_ranging(id("b")).await.unwrap();
        assert!(matches!(
            sessions.recv().await.unwrap(),
            SessionEvent::Stopped {
                reason: StopReason::ExplicitStop,
                ..
            }
        ));
        assert_eq!(engine.session_state(id("b")).await.unwrap(), None);
        assert!(sessions.try_recv().is_err());

        engine.shutdown().await.unwrap();
        handle.await.unwrap();
        assert_eq!(
            engine.start_ranging(id("b")).await,
            Err(EngineError::EngineStopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_drives_handshake_timeout() {
        let config = EngineConfig {
            handshake_timeout_ticks: 3,
            tick_interval_ms: 100,
            ..EngineConfig::default()
        };
        let (engine, oob, _radio, _handle) = spawn_with(config);
        let mut sessions = engine.subscribe_sessions();
        link(&oob, "b").await;
        engine.start_ranging(id("b")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(matches!(
            sessions.recv().await.unwrap(),
            SessionEvent::Stopped {
                reason: StopReason::Timeout,
                ..
            }
        ));
        assert_eq!(engine.session_state(id("b")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_stops_live_sessions() {
        let (engine, oob, _radio, handle) = spawn_with(EngineConfig::default());
        let mut sessions = engine.subscribe_sessions();
        link(&oob, "b").await;
        engine.start_ranging(id("b")).await.unwrap();
        engine.shutdown().await.unwrap();
        handle.await.unwrap();
        assert!(matches!(
            sessions.recv().await.unwrap(),
            SessionEvent::Stopped {
                reason: StopReason::ExplicitStop,
                ..
            }
        ));
    }
}
