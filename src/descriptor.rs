//! Read-only relay snapshot for the descriptor publisher
//!
//! The publisher builds and uploads the signed descriptor itself; this is the
//! state it needs, captured at one instant.

use crate::config::{BandwidthConfig, RelayConfig};
use crate::error::Result;
use crate::keys::{KeyRotator, RelayIdentity};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity, bandwidth and key state at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySnapshot {
    pub nickname: String,
    pub address: IpAddr,
    pub or_port: u16,
    pub platform: String,
    pub contact: Option<String>,
    pub public_server: bool,
    pub bandwidth: BandwidthConfig,
    /// Identity fingerprint, uppercase hex
    pub fingerprint: String,
    /// ed25519 identity key, base64
    pub ed25519_identity: String,
    /// Current ntor onion key, base64
    pub ntor_onion_key: String,
    /// Unix seconds
    pub published: u64,
    pub circuits: usize,
    pub connections: usize,
}

impl RelaySnapshot {
    pub(crate) fn capture(
        config: &RelayConfig,
        identity: &RelayIdentity,
        keys: &KeyRotator,
        circuits: usize,
        connections: usize,
    ) -> Result<Self> {
        let onion_key = keys.current_public()?;
        let published = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            nickname: config.nickname.clone(),
            address: config.address,
            or_port: config.or_port,
            platform: config.platform.clone(),
            contact: config.contact.clone(),
            public_server: config.public_server,
            bandwidth: config.bandwidth,
            fingerprint: identity.fingerprint_hex(),
            ed25519_identity: identity.ed25519_base64(),
            ntor_onion_key: general_purpose::STANDARD_NO_PAD.encode(onion_key),
            published,
            circuits,
            connections,
        })
    }
}
