//! Relay configuration
//!
//! Defaults match what the relay has always booted with: a public server
//! advertising 1 GiB/s average and burst and 64 KiB/s observed bandwidth.
//! A torrc file, if given, is applied on top of them.

use crate::error::{RelayError, Result};
use crate::protocol::flow_control::FlowConfig;
use crate::protocol::DEFAULT_OR_PORT;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Bandwidth parameters, bytes per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthConfig {
    pub average: u64,
    pub burst: u64,
    pub observed: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            average: 1 << 30,
            burst: 1 << 30,
            observed: 1 << 16,
        }
    }
}

/// Configuration for the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay nickname (1-19 alphanumerics)
    pub nickname: String,

    /// Address advertised in descriptors and bound for the OR port
    pub address: IpAddr,

    /// OR port
    pub or_port: u16,

    /// Operator contact line
    pub contact: Option<String>,

    /// Platform string published in the descriptor
    pub platform: String,

    /// Whether the descriptor is published at all
    pub public_server: bool,

    pub bandwidth: BandwidthConfig,

    /// Circuits with no traffic for this long are destroyed (seconds)
    pub idle_circuit_timeout: u64,

    /// Time a new connection gets to finish link negotiation (seconds)
    pub handshake_timeout: u64,

    /// Time a single write may block before the connection is dropped (seconds)
    pub write_timeout: u64,

    /// Connect timeout when extending to a new relay (seconds)
    pub dial_timeout: u64,

    /// How long a rotated-out onion key keeps working (seconds)
    pub onion_key_overlap: u64,

    /// CREATE cells beyond this many live circuits on one connection are refused
    pub max_circuits_per_connection: usize,

    /// Cells one circuit direction may have waiting for the wire
    pub queued_cells_per_circuit: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            nickname: "Unnamed".to_string(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            or_port: DEFAULT_OR_PORT,
            contact: None,
            platform: "Tor 0.2.6.2-alpha on Rust".to_string(),
            public_server: true,
            bandwidth: BandwidthConfig::default(),
            idle_circuit_timeout: 600,
            handshake_timeout: 30,
            write_timeout: 30,
            dial_timeout: 10,
            onion_key_overlap: 7 * 24 * 3600,
            max_circuits_per_connection: 4096,
            queued_cells_per_circuit: 1000,
        }
    }
}

impl RelayConfig {
    /// Apply a torrc file on top of the current values
    pub fn read_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        self.apply_torrc(&text)
    }

    /// Apply torrc-format text: one `Keyword value` per line, `#` comments
    pub fn apply_torrc(&mut self, text: &str) -> Result<()> {
        for (number, raw) in text.lines().enumerate() {
            let line = match raw.split_once('#') {
                Some((before, _)) => before,
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let (keyword, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };

            self.apply_option(keyword, value)
                .map_err(|e| RelayError::Config(format!("line {}: {}", number + 1, e)))?;
        }
        Ok(())
    }

    fn apply_option(&mut self, keyword: &str, value: &str) -> std::result::Result<(), String> {
        match keyword.to_ascii_lowercase().as_str() {
            "nickname" => self.nickname = value.to_string(),
            "address" => {
                self.address = value
                    .parse()
                    .map_err(|_| format!("invalid Address {:?}", value))?
            }
            "orport" => self.or_port = parse_number(keyword, value)?,
            "contactinfo" => self.contact = Some(value.to_string()),
            "publishserverdescriptor" => self.public_server = parse_bool(keyword, value)?,
            "bandwidthrate" => self.bandwidth.average = parse_bandwidth(value)?,
            "bandwidthburst" => self.bandwidth.burst = parse_bandwidth(value)?,
            "circuitidletimeout" => self.idle_circuit_timeout = parse_interval(value)?,
            "handshaketimeout" => self.handshake_timeout = parse_interval(value)?,
            "writetimeout" => self.write_timeout = parse_interval(value)?,
            "dialtimeout" => self.dial_timeout = parse_interval(value)?,
            "onionkeyoverlap" => self.onion_key_overlap = parse_interval(value)?,
            "maxcircuitsperconnection" => {
                self.max_circuits_per_connection = parse_number(keyword, value)?
            }
            "queuedcellspercircuit" => {
                self.queued_cells_per_circuit = parse_number(keyword, value)?
            }
            _ => log::warn!("Ignoring unknown torrc option {}", keyword),
        }
        Ok(())
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.nickname.is_empty()
            || self.nickname.len() > 19
            || !self.nickname.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(RelayError::Config(format!(
                "nickname {:?} must be 1-19 alphanumeric characters",
                self.nickname
            )));
        }

        if self.bandwidth.burst < self.bandwidth.average {
            return Err(RelayError::Config(format!(
                "BandwidthBurst {} is below BandwidthRate {}",
                self.bandwidth.burst, self.bandwidth.average
            )));
        }

        let timeouts = [
            ("CircuitIdleTimeout", self.idle_circuit_timeout),
            ("HandshakeTimeout", self.handshake_timeout),
            ("WriteTimeout", self.write_timeout),
            ("DialTimeout", self.dial_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(RelayError::Config(format!("{} must be nonzero", name)));
        }

        if self.max_circuits_per_connection == 0 || self.queued_cells_per_circuit == 0 {
            return Err(RelayError::Config("queue depths must be nonzero".into()));
        }

        Ok(())
    }

    pub fn idle_circuit_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_circuit_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn onion_key_overlap(&self) -> Duration {
        Duration::from_secs(self.onion_key_overlap)
    }

    /// Flow-control sizing for this configuration
    pub fn flow_config(&self) -> FlowConfig {
        FlowConfig::from_bandwidth(&self.bandwidth, self.queued_cells_per_circuit)
    }
}

fn parse_number<T: std::str::FromStr>(keyword: &str, value: &str) -> std::result::Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid {} {:?}", keyword, value))
}

fn parse_bool(keyword: &str, value: &str) -> std::result::Result<bool, String> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(format!("{} takes 0 or 1, got {:?}", keyword, value)),
    }
}

/// `N unit`, where unit is a torrc bandwidth unit (bytes if omitted)
fn parse_bandwidth(value: &str) -> std::result::Result<u64, String> {
    let (amount, unit) = split_amount(value)?;
    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => 1,
        "kb" | "kbyte" | "kbytes" => 1 << 10,
        "mb" | "mbyte" | "mbytes" => 1 << 20,
        "gb" | "gbyte" | "gbytes" => 1 << 30,
        "tb" | "tbyte" | "tbytes" => 1 << 40,
        _ => return Err(format!("unknown bandwidth unit {:?}", unit)),
    };
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("bandwidth {:?} overflows", value))
}

/// `N unit`, where unit is a time unit (seconds if omitted)
fn parse_interval(value: &str) -> std::result::Result<u64, String> {
    let (amount, unit) = split_amount(value)?;
    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" | "second" | "seconds" => 1,
        "minute" | "minutes" => 60,
        "hour" | "hours" => 3600,
        "day" | "days" => 24 * 3600,
        "week" | "weeks" => 7 * 24 * 3600,
        _ => return Err(format!("unknown time unit {:?}", unit)),
    };
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("interval {:?} overflows", value))
}

fn split_amount(value: &str) -> std::result::Result<(u64, &str), String> {
    let digits = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let amount = value[..digits]
        .parse()
        .map_err(|_| format!("expected a number, got {:?}", value))?;
    Ok((amount, value[digits..].trim()))
}
