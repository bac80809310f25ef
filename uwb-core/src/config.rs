//! Engine tuning knobs. Deserializable so hosts can embed it in their own config file.

use serde::Deserialize;

/// Engine configuration. Tick-based limits count engine ticks (`tick_interval_ms` each).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Cap on simultaneously live sessions (0 = unlimited). Radio-dependent.
    #[serde(default)]
    pub max_active_sessions: usize,
    /// Engine tick period (default 1000 ms).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Sessions not yet ranging are closed after this many idle ticks (0 = never).
    #[serde(default = "default_handshake_timeout_ticks")]
    pub handshake_timeout_ticks: u64,
    /// Ranging sessions without samples are closed after this many ticks (0 = never).
    #[serde(default)]
    pub ranging_idle_timeout_ticks: u64,
    /// Attempts for an outgoing OOB connection request (default 3).
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Restart discovery after a session closes so the peer is found again.
    #[serde(default = "default_true")]
    pub restart_discovery_on_close: bool,
    /// Buffered events per subscriber before the slowest one starts lagging.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Pending commands/callbacks queued for the engine task.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_handshake_timeout_ticks() -> u64 {
    15
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_event_capacity() -> usize {
    256
}
fn default_command_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: 0,
            tick_interval_ms: default_tick_interval_ms(),
            handshake_timeout_ticks: default_handshake_timeout_ticks(),
            ranging_idle_timeout_ticks: 0,
            connect_attempts: default_connect_attempts(),
            restart_discovery_on_close: true,
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn session_limit(&self) -> Option<usize> {
        (self.max_active_sessions > 0).then_some(self.max_active_sessions)
    }
}
