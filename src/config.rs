use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::backend::BackendKind;
use crate::capture::CaptureMode;
use crate::core::error::{Error, Result};
use crate::core::rule::{ImmutablePort, Protocol, Rule};

/// Daemon configuration, loaded once at startup
///
/// Rules and block-list entries come from the external rule store; the
/// manager only ever sees them as plain data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,
    /// Ports that always stay open. Entries marked `default` can never be removed.
    #[serde(default = "default_immutable_ports")]
    pub immutable_ports: Vec<ImmutablePort>,
    #[serde(default = "default_nflog_group")]
    pub nflog_group: u16,
    #[serde(default)]
    pub capture: CaptureMode,
    /// Interval between generated packets in synthetic capture mode
    #[serde(default = "default_synthetic_interval")]
    pub synthetic_interval_ms: u64,
    #[serde(default = "default_observer_addr")]
    pub observer_addr: SocketAddr,
    /// Outbound queue size per observer; a full queue drops events
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub blocklist: Vec<IpNetwork>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            immutable_ports: default_immutable_ports(),
            nflog_group: default_nflog_group(),
            capture: CaptureMode::default(),
            synthetic_interval_ms: default_synthetic_interval(),
            observer_addr: default_observer_addr(),
            client_buffer: default_client_buffer(),
            rules: Vec::new(),
            blocklist: Vec::new(),
        }
    }
}

fn default_immutable_ports() -> Vec<ImmutablePort> {
    vec![ImmutablePort::permanent(22, Protocol::Tcp)]
}

fn default_nflog_group() -> u16 {
    100
}

fn default_synthetic_interval() -> u64 {
    250
}

fn default_observer_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7878))
}

fn default_client_buffer() -> usize {
    crate::hub::CLIENT_BUFFER
}

impl Config {
    /// Checks cross-field consistency. Individual rules are validated again
    /// by the manager before they reach a backend.
    pub fn validate(&self) -> Result<()> {
        if self.client_buffer == 0 {
            return Err(Error::Config("client_buffer must be at least 1".to_string()));
        }
        if self.synthetic_interval_ms == 0 {
            return Err(Error::Config("synthetic_interval_ms must be at least 1".to_string()));
        }

        for port in &self.immutable_ports {
            if port.port == 0 || !port.protocol.has_ports() {
                return Err(Error::Config(format!("invalid immutable port {port}")));
            }
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.validate()
                .map_err(|e| Error::Config(format!("rule '{}': {e}", rule.id)))?;
            if !seen.insert(rule.id.as_str()) {
                return Err(Error::Config(format!("duplicate rule id '{}'", rule.id)));
            }
        }

        Ok(())
    }

    pub fn synthetic_interval(&self) -> Duration {
        Duration::from_millis(self.synthetic_interval_ms)
    }
}

/// Parses and validates a configuration document.
pub fn parse_config(json: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Loads the configuration at `path`, or the defaults when it does not exist.
pub async fn load_config(path: &Path) -> Result<Config> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => parse_config(&json).map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No configuration at {}, using defaults", path.display());
            Ok(Config::default())
        }
        Err(e) => Err(e.into()),
    }
}
