//! Gateway configuration.
//!
//! All tunables live in a TOML file; every field has a serde default so a
//! missing file or a partial file both work. The config path comes from the
//! `COAP_GATEWAY_CONFIG` environment variable, falling back to
//! `coap-gateway.toml` in the working directory.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// UDP address the CoAP side listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Base URL of the upstream homeserver.
    #[serde(default = "default_homeserver")]
    pub homeserver: String,
    /// Map sync long-polls onto CoAP OBSERVE.
    #[serde(default)]
    pub observe_enabled: bool,
    /// Client-side notification queue length.
    #[serde(default = "default_observe_buffer_size")]
    pub observe_buffer_size: usize,
    /// Synthesize an empty sync response when an observed stream is idle
    /// for this long.
    #[serde(default = "default_observe_no_response_timeout")]
    pub observe_no_response_timeout_secs: u64,
    /// Server-side early-ACK timer for slow upstream round-trips.
    #[serde(default = "default_piggyback_ack_window")]
    pub piggyback_ack_window_secs: u64,
    /// Transport-level knobs.
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Knobs consumed by the CoAP session runtime and, where applicable, by a
/// DTLS-capable transport factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Skip DTLS peer verification.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// DTLS handshake retransmit interval.
    #[serde(default = "default_flight_interval")]
    pub flight_interval_secs: u64,
    /// CoAP empty-message keepalive period.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_keepalive_max_retries")]
    pub keepalive_max_retries: u32,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    /// Maximum concurrent outstanding requests per session.
    #[serde(default = "default_transmission_nstart")]
    pub transmission_nstart: usize,
    /// Wait-for-ACK before retransmitting a confirmable message.
    #[serde(default = "default_transmission_ack_timeout")]
    pub transmission_ack_timeout_secs: u64,
    #[serde(default = "default_transmission_max_retransmits")]
    pub transmission_max_retransmits: u32,
}

fn default_listen_address() -> String {
    "127.0.0.1:5683".to_string()
}

fn default_homeserver() -> String {
    "http://localhost:8008/".to_string()
}

fn default_observe_buffer_size() -> usize {
    50
}

fn default_observe_no_response_timeout() -> u64 {
    5
}

fn default_piggyback_ack_window() -> u64 {
    5
}

fn default_flight_interval() -> u64 {
    2
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_keepalive_max_retries() -> u32 {
    5
}

fn default_keepalive_timeout() -> u64 {
    30
}

fn default_transmission_nstart() -> usize {
    1
}

fn default_transmission_ack_timeout() -> u64 {
    8
}

fn default_transmission_max_retransmits() -> u32 {
    4
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            homeserver: default_homeserver(),
            observe_enabled: false,
            observe_buffer_size: default_observe_buffer_size(),
            observe_no_response_timeout_secs: default_observe_no_response_timeout(),
            piggyback_ack_window_secs: default_piggyback_ack_window(),
            transport: TransportConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            flight_interval_secs: default_flight_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            keepalive_max_retries: default_keepalive_max_retries(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            transmission_nstart: default_transmission_nstart(),
            transmission_ack_timeout_secs: default_transmission_ack_timeout(),
            transmission_max_retransmits: default_transmission_max_retransmits(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the default location, falling back to
    /// defaults if the file does not exist.
    pub fn load() -> crate::Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: PathBuf) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)
                .map_err(|e| crate::GatewayError::Config(format!("{}: {e}", path.display())))
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("COAP_GATEWAY_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from("coap-gateway.toml")
    }
}

impl TransportConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.transmission_ack_timeout_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn flight_interval(&self) -> Duration {
        Duration::from_secs(self.flight_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_address, "127.0.0.1:5683");
        assert!(!config.observe_enabled);
        assert_eq!(config.observe_buffer_size, 50);
        assert_eq!(config.piggyback_ack_window_secs, 5);
        assert_eq!(config.transport.transmission_nstart, 1);
        assert_eq!(config.transport.transmission_ack_timeout_secs, 8);
        assert_eq!(config.transport.transmission_max_retransmits, 4);
        assert_eq!(config.transport.heartbeat_timeout_secs, 60);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: GatewayConfig =
            toml::from_str("observe_enabled = true\n[transport]\ntransmission_nstart = 2\n")
                .expect("parse");
        assert!(config.observe_enabled);
        assert_eq!(config.transport.transmission_nstart, 2);
        assert_eq!(config.transport.keepalive_max_retries, 5);
        assert_eq!(config.homeserver, "http://localhost:8008/");
    }

    #[test]
    fn test_roundtrip() {
        let config = GatewayConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: GatewayConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.transport, config.transport);
    }
}
