// UWB ranging daemon: LAN discovery/negotiation, simulated radio, ranging engine.

mod config;
mod discovery;
mod radio;
mod transport;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use uwb_core::{Engine, EngineInbox, EndpointEvent, RangingCore, SessionEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("uwb-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("uwb_linux=info,uwb_core=info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let instance = Uuid::new_v4();
    info!(
        "uwb-linux {VERSION} starting as {:?} (instance {instance}, port {})",
        cfg.local_name, cfg.discovery_port
    );

    let inbox = EngineInbox::new(&cfg.engine);
    let socket = discovery::make_multicast_socket(cfg.discovery_port)
        .await
        .with_context(|| format!("binding discovery port {}", cfg.discovery_port))?;
    let (lan, link_rx) = transport::LanTransport::new();
    let state = discovery::LanState::new(
        instance,
        cfg.service_id.clone(),
        discovery::group_addr(cfg.discovery_port),
    );
    let oob_sink = inbox.oob_sink();
    tokio::spawn(async move {
        if let Err(e) = discovery::run_discovery(socket, state, link_rx, oob_sink).await {
            warn!("LAN link stopped: {e}");
        }
    });

    let radio = radio::SimulatedRadio::new(inbox.radio_sink());
    let core = RangingCore::new(cfg.engine.clone(), radio, lan);
    let (engine, engine_task) = Engine::spawn(inbox, core);

    tokio::spawn(watch_endpoints(
        engine.clone(),
        cfg.auto_accept,
        cfg.auto_range,
    ));
    tokio::spawn(watch_sessions(engine.clone()));

    engine
        .discover(cfg.local_name.clone())
        .await
        .context("starting discovery")?;

    shutdown_signal().await?;
    info!("shutting down");
    engine.shutdown().await?;
    engine_task.await?;
    Ok(())
}

async fn watch_endpoints(engine: Engine, auto_accept: bool, auto_range: bool) {
    let mut events = engine.subscribe_endpoints();
    loop {
        let event = match events.recv().await {
            Ok(ev) => ev,
            Err(RecvError::Lagged(n)) => {
                warn!("endpoint watcher lagged by {n} events");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match event {
            EndpointEvent::Found(e) => {
                info!("found {} ({})", e.display_name, e.id);
                if auto_range {
                    if let Err(err) = engine.start_ranging(e.id.clone()).await {
                        warn!("auto-range with {}: {err}", e.id);
                    }
                }
            }
            EndpointEvent::Lost(e) => info!("lost {} ({})", e.display_name, e.id),
            EndpointEvent::ConnectionRequested {
                endpoint,
                is_incoming: true,
            } => {
                info!("connection request from {}", endpoint.id);
                if let Err(err) = engine
                    .handle_connection_request(endpoint.id.clone(), auto_accept)
                    .await
                {
                    warn!("answering {}: {err}", endpoint.id);
                }
            }
            EndpointEvent::ConnectionRequested { .. } => {}
            EndpointEvent::Connected(e) => info!("connected to {}", e.id),
            EndpointEvent::Disconnected(e) => info!("disconnected from {}", e.id),
            EndpointEvent::Rejected(e) => info!("connection with {} rejected", e.id),
            EndpointEvent::DiscoveryFailed(err) => warn!("discovery failed: {err}"),
        }
    }
}

async fn watch_sessions(engine: Engine) {
    let mut events = engine.subscribe_sessions();
    loop {
        match events.recv().await {
            Ok(SessionEvent::Started { peer_id }) => info!("ranging with {peer_id}"),
            Ok(SessionEvent::Stopped {
                peer_id,
                reason,
                detail,
            }) => match detail {
                Some(d) => info!("ranging with {peer_id} stopped ({reason:?}): {d}"),
                None => info!("ranging with {peer_id} stopped ({reason:?})"),
            },
            Ok(SessionEvent::Sample(s)) => debug!(
                "{}: distance {:?} m, azimuth {:?} rad, elevation {:?} rad",
                s.peer_id, s.distance_m, s.azimuth_rad, s.elevation_rad
            ),
            Err(RecvError::Lagged(n)) => warn!("session watcher dropped {n} samples"),
            Err(RecvError::Closed) => return,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
