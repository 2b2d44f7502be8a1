use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use stx_send_core::domain::{DerivationPath, STX_DERIVATION_PATH};
use stx_send_core::{Network, PortError, SessionConfig};

use crate::crypto::KdfParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeProfile {
    Development,
    Production,
}

impl FromStr for RuntimeProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown runtime profile: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendFlowConfig {
    pub runtime_profile: RuntimeProfile,
    pub network: Network,
    /// Stacks node base URL. Without one, broadcasts are recorded in memory.
    pub node_url: Option<String>,
    pub node_timeout_ms: u64,
    /// µSTX per serialized byte.
    pub fee_rate: u64,
    pub poll_interval_ms: u64,
    pub disconnect_grace_ms: u64,
    pub derivation_path: String,
    pub kdf: KdfParams,
}

impl Default for SendFlowConfig {
    fn default() -> Self {
        Self {
            runtime_profile: RuntimeProfile::Development,
            network: Network::Testnet,
            node_url: None,
            node_timeout_ms: 15_000,
            fee_rate: 1,
            poll_interval_ms: 250,
            disconnect_grace_ms: 1_000,
            derivation_path: STX_DERIVATION_PATH.to_owned(),
            kdf: KdfParams::default(),
        }
    }
}

impl SendFlowConfig {
    /// Defaults overridden by `STX_SEND_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(profile) = parse_var(&lookup, "STX_SEND_PROFILE") {
            cfg.runtime_profile = profile;
        }
        if let Some(network) = parse_var(&lookup, "STX_SEND_NETWORK") {
            cfg.network = network;
        }
        if let Some(url) = lookup("STX_SEND_NODE_URL").filter(|v| !v.trim().is_empty()) {
            cfg.node_url = Some(url.trim().trim_end_matches('/').to_owned());
        }
        if let Some(ms) = parse_var(&lookup, "STX_SEND_NODE_TIMEOUT_MS") {
            cfg.node_timeout_ms = ms;
        }
        if let Some(rate) = parse_var(&lookup, "STX_SEND_FEE_RATE") {
            cfg.fee_rate = rate;
        }
        if let Some(ms) = parse_var(&lookup, "STX_SEND_POLL_INTERVAL_MS") {
            cfg.poll_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "STX_SEND_DISCONNECT_GRACE_MS") {
            cfg.disconnect_grace_ms = ms;
        }
        if let Some(path) = lookup("STX_SEND_DERIVATION_PATH") {
            cfg.derivation_path = path;
        }
        cfg
    }

    pub fn strict_runtime_required(&self) -> bool {
        self.runtime_profile == RuntimeProfile::Production
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn session_config(&self) -> Result<SessionConfig, PortError> {
        let derivation_path: DerivationPath = self.derivation_path.parse()?;
        derivation_path.serialize_for_device()?;
        Ok(SessionConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            disconnect_grace: Duration::from_millis(self.disconnect_grace_ms),
            derivation_path,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid config value");
            None
        }
    }
}
