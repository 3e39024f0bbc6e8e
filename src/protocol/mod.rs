//! Tor protocol implementation
//!
//! This module implements the relay's view of the Tor wire protocol:
//! - Cell framing (fixed and variable-length cells)
//! - Onion layer crypto (AES-128-CTR + running SHA-1 digest)
//! - ntor and CREATE_FAST handshakes, server side
//! - EXTEND / EXTEND2 bodies
//! - Link negotiation (VERSIONS, NETINFO)
//! - SENDME windows and queue credit

pub mod cell;
pub mod crypto;
pub mod extend;
pub mod flow_control;
pub mod handshake;
pub mod link;
pub mod ntor;

pub use cell::{
    Cell, CellCodec, CellCommand, Decoded, DestroyReason, EndReason, LinkVersion, RelayCell,
    RelayCommand, VarCell, PAYLOAD_SIZE,
};
pub use crypto::{CircuitCrypto, CircuitKeys, LayerCipher};
pub use extend::{extended_reply, CreateBody, ExtendRequest, ExtendTarget, LinkSpecifier};
pub use flow_control::{CircuitWindows, CreditToken, FlowConfig, QueueCredit, Window};
pub use handshake::{CreateRequest, HandshakeResponder};
pub use link::{LinkCell, Netinfo};

/// Default OR port
pub const DEFAULT_OR_PORT: u16 = 9001;
