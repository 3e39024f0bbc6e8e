//! Answering circuit-creation handshakes
//!
//! | request     | answer                                 |
//! |-------------|----------------------------------------|
//! | CREATE_FAST | CREATED_FAST: Y (20) \| KH (20)         |
//! | CREATE2/ntor| CREATED2: HLEN (2) \| Y (32) \| AUTH (32) |
//! | CREATE (TAP)| refused                                |
//!
//! Any failure means the circuit is never created; the caller answers
//! DESTROY(PROTOCOL) on that circuit id.

use crate::error::{RelayError, Result};
use crate::keys::KeyRotator;
use crate::protocol::cell::{Cell, CellCommand};
use crate::protocol::crypto::{CircuitKeys, HASH_LEN};
use crate::protocol::extend::{HTYPE_NTOR, TAP_ONIONSKIN_LEN};
use crate::protocol::ntor::{self, NtorOnionSkin};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use zeroize::Zeroize;

/// A parsed CREATE_FAST / CREATE2 / CREATE request
#[derive(Clone, PartialEq, Eq)]
pub enum CreateRequest {
    Fast { x: [u8; HASH_LEN] },
    Create2 { htype: u16, hdata: Vec<u8> },
    Tap { onionskin: Vec<u8> },
}

impl CreateRequest {
    pub fn from_cell(cell: &Cell) -> Result<Self> {
        match cell.command {
            CellCommand::CreateFast => {
                let mut x = [0u8; HASH_LEN];
                x.copy_from_slice(&cell.payload[..HASH_LEN]);
                Ok(CreateRequest::Fast { x })
            }
            CellCommand::Create2 => {
                let htype = u16::from_be_bytes([cell.payload[0], cell.payload[1]]);
                let hlen = u16::from_be_bytes([cell.payload[2], cell.payload[3]]) as usize;
                if hlen > cell.payload.len() - 4 {
                    return Err(RelayError::HandshakeFailed(format!(
                        "CREATE2 HLEN {} exceeds the cell",
                        hlen
                    )));
                }
                Ok(CreateRequest::Create2 {
                    htype,
                    hdata: cell.payload[4..4 + hlen].to_vec(),
                })
            }
            CellCommand::Create => Ok(CreateRequest::Tap {
                onionskin: cell.payload[..TAP_ONIONSKIN_LEN].to_vec(),
            }),
            other => Err(RelayError::ProtocolViolation(format!(
                "{:?} is not a create request",
                other
            ))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CreateRequest::Fast { .. } => "CREATE_FAST",
            CreateRequest::Create2 { .. } => "CREATE2",
            CreateRequest::Tap { .. } => "CREATE",
        }
    }
}

impl std::fmt::Debug for CreateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Server side of every handshake this relay accepts
#[derive(Debug, Clone)]
pub struct HandshakeResponder {
    keys: Arc<KeyRotator>,
    identity: [u8; 20],
}

impl HandshakeResponder {
    pub fn new(keys: Arc<KeyRotator>, identity: [u8; 20]) -> Self {
        Self { keys, identity }
    }

    /// Complete a handshake, returning the reply cell and the circuit keys
    pub fn respond(&self, circuit_id: u32, request: &CreateRequest) -> Result<(Cell, CircuitKeys)> {
        match request {
            CreateRequest::Fast { x } => self.respond_fast(circuit_id, x),
            CreateRequest::Create2 { htype, hdata } if *htype == HTYPE_NTOR => {
                self.respond_ntor(circuit_id, hdata)
            }
            CreateRequest::Create2 { htype, .. } => Err(RelayError::HandshakeFailed(format!(
                "unsupported handshake type {:#06x}",
                htype
            ))),
            CreateRequest::Tap { .. } => Err(RelayError::HandshakeFailed(
                "TAP handshakes are not served".into(),
            )),
        }
    }

    fn respond_fast(&self, circuit_id: u32, x: &[u8; HASH_LEN]) -> Result<(Cell, CircuitKeys)> {
        let mut y = [0u8; HASH_LEN];
        OsRng
            .try_fill_bytes(&mut y)
            .map_err(|e| RelayError::Crypto(format!("OS randomness unavailable: {}", e)))?;

        let (keys, kh) = CircuitKeys::from_create_fast(x, &y)?;

        let mut payload = [0u8; 2 * HASH_LEN];
        payload[..HASH_LEN].copy_from_slice(&y);
        payload[HASH_LEN..].copy_from_slice(&kh);
        let reply = Cell::new(circuit_id, CellCommand::CreatedFast, &payload);
        y.zeroize();

        Ok((reply?, keys))
    }

    fn respond_ntor(&self, circuit_id: u32, hdata: &[u8]) -> Result<(Cell, CircuitKeys)> {
        let skin = NtorOnionSkin::parse(hdata)?;
        let secret = self.keys.secret_for(&skin.onion_key)?.ok_or_else(|| {
            RelayError::HandshakeFailed("onionskin names an unknown or expired onion key".into())
        })?;

        let (reply, keys) = ntor::server_handshake(&skin, &self.identity, &secret)?;

        let mut payload = Vec::with_capacity(2 + ntor::REPLY_LEN);
        payload.extend_from_slice(&(ntor::REPLY_LEN as u16).to_be_bytes());
        payload.extend_from_slice(&reply.to_bytes());
        Ok((Cell::new(circuit_id, CellCommand::Created2, &payload)?, keys))
    }
}
