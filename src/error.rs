//! Error types for the relay engine
//!
//! This module provides the relay's error taxonomy with:
//! - Detailed error variants for different failure modes
//! - Error codes for programmatic handling
//! - Containment scope (cell, circuit, connection, process)
//! - Mapping onto DESTROY reasons sent on the wire

use crate::protocol::cell::DestroyReason;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    ConnectionTimeout = 101,
    ConnectionClosed = 102,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    MalformedCell = 201,
    DigestMismatch = 202,
    HandshakeFailed = 203,
    UnknownCircuit = 204,

    // Circuit errors (3xx)
    CircuitDestroyed = 300,
    ExtendFailed = 301,

    // Cryptographic errors (4xx)
    CryptoError = 400,
    KeyDerivationFailed = 401,
    KeyRotationFailed = 402,

    // Configuration errors (5xx)
    ConfigError = 500,

    // Resource errors (6xx)
    ResourceExhausted = 600,

    // Internal errors (9xx)
    InternalError = 900,
    InvariantViolation = 901,
}

/// How far the damage of an error reaches.
///
/// Errors are recovered at the narrowest boundary that contains them. Anything
/// that corrupts shared state escalates to [`ErrorScope::Process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorScope {
    /// Drop the offending cell, keep everything else.
    Cell,
    /// Destroy the circuit the cell referenced.
    Circuit,
    /// Tear down the connection and every circuit keyed to it.
    Connection,
    /// The dispatch loop cannot continue.
    Process,
}

/// Main error type for the relay
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Network error: {0}")]
    Network(String),

    // ===== Protocol Errors =====
    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Cell for unknown circuit {circuit_id}")]
    UnknownCircuit { circuit_id: u32 },

    #[error("Unknown relay command {0}")]
    UnknownRelayCommand(u8),

    #[error("Digest mismatch in relay cell")]
    DigestMismatch,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Circuit Errors =====
    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    #[error("Extend failed: {0}")]
    ExtendFailed(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto: {0}")]
    Crypto(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Key rotation failed: {0}")]
    KeyRotation(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ===== Resource Errors =====
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // ===== Internal Errors =====
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            // Connection
            RelayError::ConnectionFailed(_) | RelayError::Network(_) => {
                ErrorCode::ConnectionFailed
            }
            RelayError::Timeout => ErrorCode::ConnectionTimeout,
            RelayError::ConnectionClosed(_) => ErrorCode::ConnectionClosed,

            // Protocol
            RelayError::MalformedCell(_) => ErrorCode::MalformedCell,
            RelayError::ProtocolViolation(_) | RelayError::UnknownRelayCommand(_) => {
                ErrorCode::ProtocolViolation
            }
            RelayError::UnknownCircuit { .. } => ErrorCode::UnknownCircuit,
            RelayError::DigestMismatch => ErrorCode::DigestMismatch,
            RelayError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,

            // Circuit
            RelayError::CircuitDestroyed { .. } | RelayError::CircuitClosed(_) => {
                ErrorCode::CircuitDestroyed
            }
            RelayError::ExtendFailed(_) => ErrorCode::ExtendFailed,

            // Crypto
            RelayError::Crypto(_) => ErrorCode::CryptoError,
            RelayError::KeyDerivationFailed(_) => ErrorCode::KeyDerivationFailed,
            RelayError::KeyRotation(_) => ErrorCode::KeyRotationFailed,

            // Config
            RelayError::Config(_) | RelayError::ParseError(_) => ErrorCode::ConfigError,

            // Resource
            RelayError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,

            // Internal
            RelayError::InvariantViolation(_) => ErrorCode::InvariantViolation,
            RelayError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Where this error has to be contained when it surfaces in the dispatch path.
    pub fn scope(&self) -> ErrorScope {
        match self {
            RelayError::UnknownRelayCommand(_) | RelayError::KeyRotation(_) => ErrorScope::Cell,

            RelayError::ProtocolViolation(_)
            | RelayError::DigestMismatch
            | RelayError::HandshakeFailed(_)
            | RelayError::CircuitDestroyed { .. }
            | RelayError::CircuitClosed(_)
            | RelayError::ExtendFailed(_)
            | RelayError::Crypto(_)
            | RelayError::KeyDerivationFailed(_)
            | RelayError::ResourceExhausted(_) => ErrorScope::Circuit,

            RelayError::ConnectionFailed(_)
            | RelayError::Timeout
            | RelayError::ConnectionClosed(_)
            | RelayError::Network(_)
            | RelayError::MalformedCell(_)
            | RelayError::UnknownCircuit { .. }
            | RelayError::Config(_)
            | RelayError::ParseError(_)
            | RelayError::Internal(_) => ErrorScope::Connection,

            RelayError::InvariantViolation(_) => ErrorScope::Process,
        }
    }

    /// Whether this error is fatal (the dispatch loop must stop)
    ///
    /// A corrupted circuit map risks mixing traffic between circuits, so the
    /// process has to go down rather than keep relaying.
    pub fn is_fatal(&self) -> bool {
        self.scope() == ErrorScope::Process
    }

    /// Whether the operation may succeed if attempted again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectionFailed(_)
                | RelayError::Timeout
                | RelayError::ConnectionClosed(_)
                | RelayError::Network(_)
                | RelayError::ExtendFailed(_)
                | RelayError::KeyRotation(_)
                | RelayError::ResourceExhausted(_)
        )
    }

    /// The DESTROY reason to put on the wire when this error kills a circuit.
    pub fn destroy_reason(&self) -> DestroyReason {
        match self {
            RelayError::ResourceExhausted(_) => DestroyReason::ResourceLimit,
            RelayError::ConnectionFailed(_) | RelayError::ExtendFailed(_) => {
                DestroyReason::ConnectFailed
            }
            RelayError::ConnectionClosed(_) | RelayError::Network(_) => {
                DestroyReason::ChannelClosed
            }
            RelayError::Timeout => DestroyReason::Timeout,
            RelayError::CircuitDestroyed { reason, .. } => {
                DestroyReason::from_u8(*reason).unwrap_or(DestroyReason::Destroyed)
            }
            RelayError::CircuitClosed(_) => DestroyReason::Destroyed,
            RelayError::InvariantViolation(_)
            | RelayError::Internal(_)
            | RelayError::Config(_)
            | RelayError::KeyRotation(_) => DestroyReason::Internal,
            RelayError::MalformedCell(_)
            | RelayError::ProtocolViolation(_)
            | RelayError::UnknownCircuit { .. }
            | RelayError::UnknownRelayCommand(_)
            | RelayError::DigestMismatch
            | RelayError::HandshakeFailed(_)
            | RelayError::Crypto(_)
            | RelayError::KeyDerivationFailed(_)
            | RelayError::ParseError(_) => DestroyReason::Protocol,
        }
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = DestroyReason::from_u8(reason)
            .map(DestroyReason::name)
            .unwrap_or("UNKNOWN")
            .to_string();

        RelayError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => RelayError::Timeout,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => RelayError::ConnectionClosed(err.to_string()),
            _ => RelayError::Network(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RelayError::Timeout
    }
}
