//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use uwb_core::EngineConfig;

/// Daemon configuration. File: ~/.config/uwb-ranging/config.toml or /etc/uwb-ranging/config.toml.
/// Env overrides: UWB_LOCAL_NAME, UWB_SERVICE_ID, UWB_DISCOVERY_PORT, UWB_MAX_SESSIONS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name advertised to peers (default: hostname, else "uwb-node").
    #[serde(default = "default_local_name")]
    pub local_name: String,
    /// Only peers advertising the same service id are discovered.
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Discovery and control UDP port (default 45890).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Accept incoming connection requests; when false they are rejected.
    #[serde(default = "default_true")]
    pub auto_accept: bool,
    /// Start ranging with every endpoint as soon as it is found.
    #[serde(default)]
    pub auto_range: bool,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_local_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "uwb-node".to_string())
}
fn default_service_id() -> String {
    "uwb-ranging".to_string()
}
fn default_discovery_port() -> u16 {
    45890
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_name: default_local_name(),
            service_id: default_service_id(),
            discovery_port: default_discovery_port(),
            auto_accept: true,
            auto_range: false,
            engine: EngineConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("UWB_LOCAL_NAME").filter(|s| !s.is_empty()) {
        c.local_name = s;
    }
    if let Some(s) = var("UWB_SERVICE_ID").filter(|s| !s.is_empty()) {
        c.service_id = s;
    }
    if let Some(s) = var("UWB_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Some(s) = var("UWB_MAX_SESSIONS") {
        if let Ok(n) = s.parse::<usize>() {
            c.engine.max_active_sessions = n;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/uwb-ranging/config.toml"));
    }
    out.push(PathBuf::from("/etc/uwb-ranging/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!("ignoring {}: {e}", p.display()),
                },
                Err(e) => tracing::warn!("cannot read {}: {e}", p.display()),
            }
            break;
        }
    }
    None
}
