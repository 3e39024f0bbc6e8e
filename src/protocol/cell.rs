//! Tor cell protocol
//!
//! Implements the Tor cell format spoken between relays and clients.
//! Cells are the basic unit of communication in the Tor protocol: fixed-size,
//! command-tagged and scoped to one circuit on one connection.
//!
//! ## Framing per link version
//!
//! | version | circ id | cell size |
//! |---------|---------|-----------|
//! | 3       | 2 bytes | 512       |
//! | 4, 5    | 4 bytes | 514       |
//!
//! The payload is always 509 bytes. Variable-length cells (VERSIONS and
//! commands >= 128) only appear during link negotiation and are handled by
//! [`VarCell`]; the fixed-cell codec rejects them.

use crate::error::{RelayError, Result};
use std::fmt;
use std::ops::Range;

/// Fixed payload length shared by every link version.
pub const PAYLOAD_SIZE: usize = 509;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for padding
    Padding = 0,
    /// CREATE - create a circuit with the TAP handshake (deprecated)
    Create = 1,
    /// CREATED - TAP circuit created (deprecated)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - create a circuit without public-key crypto
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created
    CreatedFast = 6,
    /// VERSIONS - negotiate versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell allowed to carry EXTEND
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether cells with this command carry a length field instead of a fixed payload.
    pub fn is_variable_length(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }

    /// Whether the command addresses a circuit (and so needs a nonzero circuit id).
    pub fn is_circuit_bound(self) -> bool {
        matches!(
            self,
            CellCommand::Create
                | CellCommand::Created
                | CellCommand::Relay
                | CellCommand::Destroy
                | CellCommand::CreateFast
                | CellCommand::CreatedFast
                | CellCommand::RelayEarly
                | CellCommand::Create2
                | CellCommand::Created2
        )
    }
}

/// Negotiated link protocol version.
///
/// Only versions this relay can frame are constructible, so holding a
/// `LinkVersion` is proof the codec knows the wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkVersion(u16);

impl LinkVersion {
    pub const V3: LinkVersion = LinkVersion(3);
    pub const V4: LinkVersion = LinkVersion(4);
    pub const V5: LinkVersion = LinkVersion(5);

    /// Every version the codec can frame, lowest first
    pub const SUPPORTED: [LinkVersion; 3] = [Self::V3, Self::V4, Self::V5];

    /// Look up a supported version
    pub fn new(version: u16) -> Option<Self> {
        Self::SUPPORTED.into_iter().find(|v| v.0 == version)
    }

    /// Raw version number
    pub fn get(self) -> u16 {
        self.0
    }

    /// Width of the circuit id field on the wire
    pub fn circ_id_len(self) -> usize {
        if self.0 < 4 {
            2
        } else {
            4
        }
    }

    /// Total size of a fixed-length cell
    pub fn cell_size(self) -> usize {
        self.circ_id_len() + 1 + PAYLOAD_SIZE
    }

    /// Largest circuit id that fits the wire field
    pub fn max_circuit_id(self) -> u32 {
        if self.circ_id_len() == 2 {
            u16::MAX as u32
        } else {
            u32::MAX
        }
    }

    /// High bit reserved for ids allocated by the connection initiator
    pub fn initiator_bit(self) -> u32 {
        if self.circ_id_len() == 2 {
            0x8000
        } else {
            0x8000_0000
        }
    }
}

impl fmt::Display for LinkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// DESTROY reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DestroyReason {
    None = 0,
    Protocol = 1,
    Internal = 2,
    Requested = 3,
    Hibernating = 4,
    ResourceLimit = 5,
    ConnectFailed = 6,
    OrIdentity = 7,
    ChannelClosed = 8,
    Finished = 9,
    Timeout = 10,
    Destroyed = 11,
    NoSuchService = 12,
}

impl DestroyReason {
    /// Parse reason from byte
    pub fn from_u8(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(DestroyReason::None),
            1 => Some(DestroyReason::Protocol),
            2 => Some(DestroyReason::Internal),
            3 => Some(DestroyReason::Requested),
            4 => Some(DestroyReason::Hibernating),
            5 => Some(DestroyReason::ResourceLimit),
            6 => Some(DestroyReason::ConnectFailed),
            7 => Some(DestroyReason::OrIdentity),
            8 => Some(DestroyReason::ChannelClosed),
            9 => Some(DestroyReason::Finished),
            10 => Some(DestroyReason::Timeout),
            11 => Some(DestroyReason::Destroyed),
            12 => Some(DestroyReason::NoSuchService),
            _ => None,
        }
    }

    /// Name used in logs and diagnostics
    pub fn name(self) -> &'static str {
        match self {
            DestroyReason::None => "NONE",
            DestroyReason::Protocol => "PROTOCOL",
            DestroyReason::Internal => "INTERNAL",
            DestroyReason::Requested => "REQUESTED",
            DestroyReason::Hibernating => "HIBERNATING",
            DestroyReason::ResourceLimit => "RESOURCELIMIT",
            DestroyReason::ConnectFailed => "CONNECTFAILED",
            DestroyReason::OrIdentity => "OR_IDENTITY",
            DestroyReason::ChannelClosed => "CHANNEL_CLOSED",
            DestroyReason::Finished => "FINISHED",
            DestroyReason::Timeout => "TIMEOUT",
            DestroyReason::Destroyed => "DESTROYED",
            DestroyReason::NoSuchService => "NOSUCHSERVICE",
        }
    }
}

/// Stream END reasons this relay emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndReason {
    Misc = 1,
    ResolveFailed = 2,
    ConnectRefused = 3,
    ExitPolicy = 4,
    Destroy = 5,
    Done = 6,
    Timeout = 7,
    NoRoute = 8,
    Hibernating = 9,
    Internal = 10,
    ResourceLimit = 11,
    ConnReset = 12,
    TorProtocol = 13,
    NotDirectory = 14,
}

/// Tor cell
#[derive(Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (2 bytes on v3 links, 4 bytes on v4+)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload, always zero-padded to 509 bytes
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Cell {
    /// Cell size on v4+ links (4 circuit_id + 1 command + 509 payload)
    pub const SIZE: usize = 514;

    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = PAYLOAD_SIZE;

    /// Create a new cell, zero-padding `data` to the payload size
    pub fn new(circuit_id: u32, command: CellCommand, data: &[u8]) -> Result<Self> {
        if data.len() > PAYLOAD_SIZE {
            return Err(RelayError::ProtocolViolation(format!(
                "cell payload of {} bytes exceeds {}",
                data.len(),
                PAYLOAD_SIZE
            )));
        }
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload[..data.len()].copy_from_slice(data);
        Ok(Self::from_payload(circuit_id, command, payload))
    }

    /// Create a cell from a complete payload
    pub fn from_payload(circuit_id: u32, command: CellCommand, payload: [u8; PAYLOAD_SIZE]) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a RELAY cell
    pub fn relay(circuit_id: u32, payload: [u8; PAYLOAD_SIZE]) -> Self {
        Self::from_payload(circuit_id, CellCommand::Relay, payload)
    }

    /// Create a DESTROY cell
    pub fn destroy(circuit_id: u32, reason: DestroyReason) -> Self {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload[0] = reason as u8;
        Self::from_payload(circuit_id, CellCommand::Destroy, payload)
    }

    /// Reason byte of a DESTROY cell
    pub fn destroy_reason(&self) -> u8 {
        self.payload[0]
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("circuit_id", &self.circuit_id)
            .field("command", &self.command)
            .field("payload_head", &hex::encode(&self.payload[..16]))
            .finish()
    }
}

/// Result of examining the head of a byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A full cell was framed from the first `cell_size()` bytes
    Cell(Cell),
    /// The buffer is short by this many bytes
    NeedMoreData(usize),
    /// The bytes can never form a valid cell; the connection is unusable
    Malformed(String),
}

/// Fixed-length cell framing for one negotiated link version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellCodec {
    version: LinkVersion,
}

impl CellCodec {
    pub fn new(version: LinkVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> LinkVersion {
        self.version
    }

    pub fn cell_size(&self) -> usize {
        self.version.cell_size()
    }

    /// Serialize a cell to its fixed-size wire form
    pub fn encode(&self, cell: &Cell) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.cell_size());
        self.encode_into(cell, &mut buf)?;
        Ok(buf)
    }

    /// Append a cell's wire form to `out`
    pub fn encode_into(&self, cell: &Cell, out: &mut Vec<u8>) -> Result<()> {
        if cell.command.is_variable_length() {
            return Err(RelayError::Internal(format!(
                "{:?} is variable-length and cannot be framed as a fixed cell",
                cell.command
            )));
        }
        if cell.circuit_id > self.version.max_circuit_id() {
            return Err(RelayError::Internal(format!(
                "circuit id {} does not fit a {} link",
                cell.circuit_id, self.version
            )));
        }

        match self.version.circ_id_len() {
            2 => out.extend_from_slice(&(cell.circuit_id as u16).to_be_bytes()),
            _ => out.extend_from_slice(&cell.circuit_id.to_be_bytes()),
        }
        out.push(cell.command as u8);
        out.extend_from_slice(&cell.payload);
        Ok(())
    }

    /// Frame one cell from the head of `buf`
    ///
    /// Only the first `cell_size()` bytes are examined; the caller advances by
    /// that much after a [`Decoded::Cell`].
    pub fn decode(&self, buf: &[u8]) -> Decoded {
        let size = self.cell_size();
        if buf.len() < size {
            return Decoded::NeedMoreData(size - buf.len());
        }

        let id_len = self.version.circ_id_len();
        let circuit_id = match id_len {
            2 => u16::from_be_bytes([buf[0], buf[1]]) as u32,
            _ => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        };

        let command = match CellCommand::from_u8(buf[id_len]) {
            Some(cmd) if cmd.is_variable_length() => {
                return Decoded::Malformed(format!(
                    "variable-length {:?} after link negotiation",
                    cmd
                ))
            }
            Some(cmd) => cmd,
            None => return Decoded::Malformed(format!("unknown command byte {}", buf[id_len])),
        };

        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&buf[id_len + 1..size]);

        Decoded::Cell(Cell::from_payload(circuit_id, command, payload))
    }
}

/// Variable-length cell (link negotiation only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarCell {
    pub circuit_id: u32,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

impl VarCell {
    /// Header size for a given circuit id width: circ id + command + u16 length
    pub fn header_len(circ_id_len: usize) -> usize {
        circ_id_len + 3
    }

    /// Serialize with the given circuit id width
    pub fn encode(&self, circ_id_len: usize) -> Result<Vec<u8>> {
        if !self.command.is_variable_length() {
            return Err(RelayError::Internal(format!(
                "{:?} is not a variable-length command",
                self.command
            )));
        }
        let length = u16::try_from(self.payload.len())
            .map_err(|_| RelayError::Internal("variable cell payload too long".into()))?;

        let mut buf = Vec::with_capacity(Self::header_len(circ_id_len) + self.payload.len());
        match circ_id_len {
            2 => buf.extend_from_slice(&(self.circuit_id as u16).to_be_bytes()),
            _ => buf.extend_from_slice(&self.circuit_id.to_be_bytes()),
        }
        buf.push(self.command as u8);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a variable-length header, returning (circuit id, command, payload length)
    pub fn parse_header(header: &[u8], circ_id_len: usize) -> Result<(u32, CellCommand, usize)> {
        if header.len() < Self::header_len(circ_id_len) {
            return Err(RelayError::MalformedCell("variable cell header truncated".into()));
        }
        let circuit_id = match circ_id_len {
            2 => u16::from_be_bytes([header[0], header[1]]) as u32,
            _ => u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
        };
        let command = CellCommand::from_u8(header[circ_id_len])
            .filter(|cmd| cmd.is_variable_length())
            .ok_or_else(|| {
                RelayError::MalformedCell(format!(
                    "expected a variable-length command, got byte {}",
                    header[circ_id_len]
                ))
            })?;
        let length = u16::from_be_bytes([header[circ_id_len + 1], header[circ_id_len + 2]]);
        Ok((circuit_id, command, length as usize))
    }
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - drop cell
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// Relay cell (payload within a RELAY or RELAY_EARLY cell)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (always 0 for cells addressed to the reading hop)
    pub recognized: u16,

    /// Stream ID, 0 for circuit-level commands
    pub stream_id: u16,

    /// Digest (4 bytes)
    pub digest: [u8; 4],

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Header size: command, recognized, stream id, digest, length
    pub const HEADER_SIZE: usize = 11;

    /// Maximum data size in relay cell
    pub const MAX_DATA_SIZE: usize = PAYLOAD_SIZE - Self::HEADER_SIZE;

    /// Byte range of the `recognized` field inside a payload
    pub const RECOGNIZED_RANGE: Range<usize> = 1..3;

    /// Byte range of the `digest` field inside a payload
    pub const DIGEST_RANGE: Range<usize> = 5..9;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Result<Self> {
        if data.len() > Self::MAX_DATA_SIZE {
            return Err(RelayError::ProtocolViolation(format!(
                "relay data of {} bytes exceeds {}",
                data.len(),
                Self::MAX_DATA_SIZE
            )));
        }
        Ok(Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        })
    }

    /// Serialize into a zero-padded cell payload
    pub fn to_payload(&self) -> Result<[u8; PAYLOAD_SIZE]> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(RelayError::ProtocolViolation("relay data too long".into()));
        }

        let mut buf = [0u8; PAYLOAD_SIZE];
        buf[0] = self.command as u8;
        buf[Self::RECOGNIZED_RANGE].copy_from_slice(&self.recognized.to_be_bytes());
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[Self::DIGEST_RANGE].copy_from_slice(&self.digest);
        buf[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf[Self::HEADER_SIZE..Self::HEADER_SIZE + self.data.len()].copy_from_slice(&self.data);

        Ok(buf)
    }

    /// Parse a relay cell from a decrypted payload
    pub fn from_payload(payload: &[u8; PAYLOAD_SIZE]) -> Result<Self> {
        let command = RelayCommand::from_u8(payload[0])
            .ok_or(RelayError::UnknownRelayCommand(payload[0]))?;

        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;

        if length > Self::MAX_DATA_SIZE {
            return Err(RelayError::ProtocolViolation(format!(
                "relay length field {} exceeds {}",
                length,
                Self::MAX_DATA_SIZE
            )));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload[Self::HEADER_SIZE..Self::HEADER_SIZE + length].to_vec(),
        })
    }
}
