//! Simulated UWB radio for hosts without UWB hardware. Each session streams a
//! random-walk position so the rest of the pipeline can be exercised end to end.

use std::collections::HashMap;
use std::f64::consts::FRAC_PI_2;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uwb_core::{
    PeerId, RadioCollaborator, RadioError, RadioEvent, RadioSink, RawMeasurement, StartOutcome,
    UwbSessionConfig, Vec3,
};

const REPORT_INTERVAL: Duration = Duration::from_millis(200);
/// BPRF preamble indices a controller may pick.
const PREAMBLE_RANGE: std::ops::RangeInclusive<u8> = 9..=12;

pub struct SimulatedRadio {
    address: Vec<u8>,
    sink: RadioSink,
    sessions: HashMap<PeerId, JoinHandle<()>>,
}

impl SimulatedRadio {
    pub fn new(sink: RadioSink) -> Self {
        let short: [u8; 2] = rand::thread_rng().gen();
        Self {
            address: short.to_vec(),
            sink,
            sessions: HashMap::new(),
        }
    }
}

impl RadioCollaborator for SimulatedRadio {
    fn local_address(&mut self) -> Result<Vec<u8>, RadioError> {
        Ok(self.address.clone())
    }

    fn controller_preamble(&mut self) -> Result<u8, RadioError> {
        Ok(rand::thread_rng().gen_range(PREAMBLE_RANGE))
    }

    fn start_ranging(
        &mut self,
        peer: &PeerId,
        config: &UwbSessionConfig,
    ) -> Result<StartOutcome, RadioError> {
        if config.preamble_index().is_none() {
            return Err(RadioError::Start("no preamble index".into()));
        }
        if let Some(old) = self.sessions.remove(peer) {
            old.abort();
        }
        info!(
            "simulated ranging with {peer}: {:?}, session {}, preamble {:?}, channel {}",
            config.role(),
            config.session_id(),
            config.preamble_index(),
            config.channel()
        );
        let handle = tokio::spawn(simulate(peer.clone(), self.sink.clone()));
        self.sessions.insert(peer.clone(), handle);
        Ok(StartOutcome::Pending)
    }

    fn stop_ranging(&mut self, peer: &PeerId) -> Result<(), RadioError> {
        match self.sessions.remove(peer) {
            Some(handle) => {
                handle.abort();
                debug!("simulated ranging with {peer} stopped");
            }
            None => debug!("stop for {peer}: no simulated session"),
        }
        Ok(())
    }
}

impl Drop for SimulatedRadio {
    fn drop(&mut self) {
        for (_, handle) in self.sessions.drain() {
            handle.abort();
        }
    }
}

async fn simulate(peer: PeerId, sink: RadioSink) {
    if sink.send(RadioEvent::Started(peer.clone())).await.is_err() {
        return;
    }
    let mut rng = StdRng::from_entropy();
    let mut distance: f64 = rng.gen_range(0.5..5.0);
    let mut azimuth: f64 = rng.gen_range(-1.0..1.0);
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        distance = (distance + rng.gen_range(-0.05..0.05)).clamp(0.1, 20.0);
        azimuth = (azimuth + rng.gen_range(-0.02..0.02)).clamp(-FRAC_PI_2, FRAC_PI_2);
        let measurement = RawMeasurement {
            distance: Some(distance),
            direction: Some(Vec3::new(azimuth.sin(), azimuth.cos(), 0.0)),
            ..Default::default()
        };
        if sink
            .send(RadioEvent::Position(peer.clone(), measurement))
            .await
            .is_err()
        {
            return;
        }
    }
}
