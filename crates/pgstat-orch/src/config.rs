//! Configuration file support for pgstatd.
//!
//! Loads `pgstatd.yaml`; every field is optional. Default location:
//! /etc/pgstat/pgstatd.yaml

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::flow_stat::{FlowStatMode, FlowStatOrchConfig, RxStatsConfig, Stream, MAX_ALLOWED_PGID_LIST_LEN};
use crate::parser::build::{ipv4_packet, ipv6_packet};
use pgstat_common::{Capabilities, IdLayout, L3Proto, L4Proto, PacketGroupId, RuleKind, MAX_POOL_CAPACITY};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pgstat/pgstatd.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A stream the daemon generates on its software loopback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: u32,
    pub pg_id: u32,
    #[serde(default = "default_rule_kind")]
    pub rule_kind: RuleKind,
    #[serde(default = "default_l3")]
    pub l3: L3Proto,
    /// Protocol name or number.
    #[serde(default = "default_l4")]
    pub l4: String,
    #[serde(default = "default_packet_len")]
    pub packet_len: usize,
    #[serde(default = "default_packets")]
    pub packets: u32,
    #[serde(default)]
    pub port: u8,
}

/// Complete pgstatd configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_ports")]
    pub ports: u8,

    #[serde(default = "default_header_id_slots")]
    pub header_id_slots: u16,

    #[serde(default = "default_payload_slots")]
    pub payload_slots: u16,

    /// Defaults to the top of the 16-bit range.
    #[serde(default)]
    pub reserved_id_base: Option<u16>,

    #[serde(default = "default_rx_start_timeout_ms")]
    pub rx_start_timeout_ms: u64,

    #[serde(default = "default_rx_start_poll_ms")]
    pub rx_start_poll_ms: u64,

    #[serde(default = "default_max_pgid_list_len")]
    pub max_pgid_list_len: usize,

    #[serde(default)]
    pub mode: FlowStatMode,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<RuleKind>,

    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ports() -> u8 {
    2
}

fn default_header_id_slots() -> u16 {
    127
}

fn default_payload_slots() -> u16 {
    128
}

fn default_rx_start_timeout_ms() -> u64 {
    500
}

fn default_rx_start_poll_ms() -> u64 {
    1
}

fn default_max_pgid_list_len() -> usize {
    MAX_ALLOWED_PGID_LIST_LEN
}

fn default_capabilities() -> Vec<RuleKind> {
    RuleKind::ALL.to_vec()
}

fn default_rule_kind() -> RuleKind {
    RuleKind::HeaderId
}

fn default_l3() -> L3Proto {
    L3Proto::Ipv4
}

fn default_l4() -> String {
    "udp".to_string()
}

fn default_packet_len() -> usize {
    128
}

fn default_packets() -> u32 {
    100
}

impl Default for FlowStatConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ports: default_ports(),
            header_id_slots: default_header_id_slots(),
            payload_slots: default_payload_slots(),
            reserved_id_base: None,
            rx_start_timeout_ms: default_rx_start_timeout_ms(),
            rx_start_poll_ms: default_rx_start_poll_ms(),
            max_pgid_list_len: default_max_pgid_list_len(),
            mode: FlowStatMode::default(),
            capabilities: default_capabilities(),
            streams: Vec::new(),
        }
    }
}

impl FlowStatConfig {
    /// Loads configuration from `path`; a missing file yields defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_yaml(&content)?;
                audit_log!(AuditRecord::new(
                    AuditCategory::ConfigurationChange,
                    "FlowStatConfig",
                    "load_config"
                )
                .with_outcome(AuditOutcome::Success)
                .with_object_id(path.display().to_string())
                .with_details(serde_json::json!({
                    "streams": config.streams.len(),
                    "mode": config.mode,
                })));
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn reserved_base(&self) -> u16 {
        self.reserved_id_base
            .unwrap_or_else(|| 0xffff_u16.saturating_sub(self.header_id_slots))
    }

    pub fn layout(&self) -> Result<IdLayout, ConfigError> {
        IdLayout::new(self.reserved_base(), self.header_id_slots, self.payload_slots)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn capability_mask(&self) -> Capabilities {
        self.capabilities.iter().copied().collect()
    }

    pub fn rx_start_timeout(&self) -> Duration {
        Duration::from_millis(self.rx_start_timeout_ms)
    }

    pub fn orch_config(&self) -> FlowStatOrchConfig {
        FlowStatOrchConfig {
            rx_start_timeout: self.rx_start_timeout(),
            rx_start_poll: Duration::from_millis(self.rx_start_poll_ms),
            max_pgid_list_len: self.max_pgid_list_len,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.header_id_slots == 0 || self.payload_slots == 0 {
            return Err(ConfigError::Invalid("slot pools must not be empty".to_string()));
        }
        if self.header_id_slots > MAX_POOL_CAPACITY || self.payload_slots > MAX_POOL_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "slot pools are limited to {} slots",
                MAX_POOL_CAPACITY
            )));
        }
        self.layout()?;
        if self.ports == 0 {
            return Err(ConfigError::Invalid("ports must be > 0".to_string()));
        }
        if self.rx_start_timeout_ms == 0 {
            return Err(ConfigError::Invalid("rx_start_timeout_ms must be > 0".to_string()));
        }
        for stream in &self.streams {
            stream.l4_proto()?;
            if stream.port >= self.ports {
                return Err(ConfigError::Invalid(format!(
                    "stream {} uses port {} of {}",
                    stream.id, stream.port, self.ports
                )));
            }
        }
        Ok(())
    }
}

impl StreamConfig {
    pub fn l4_proto(&self) -> Result<L4Proto, ConfigError> {
        self.l4
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("stream {}: {}", self.id, e)))
    }

    /// Builds the stream with a generated packet.
    pub fn build(&self) -> Result<Stream, ConfigError> {
        let l4 = self.l4_proto()?;
        let packet = match self.l3 {
            L3Proto::Ipv4 => ipv4_packet(l4, 0, self.packet_len),
            L3Proto::Ipv6 => ipv6_packet(l4, 0, self.packet_len),
        };
        Ok(Stream::new(
            self.id,
            RxStatsConfig::new(PacketGroupId(self.pg_id), self.rule_kind),
            packet,
        ))
    }
}
