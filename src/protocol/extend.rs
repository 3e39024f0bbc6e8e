//! EXTEND / EXTEND2 parsing and the cells they turn into
//!
//! A client extends its circuit by sending this hop a RELAY_EXTEND2 cell:
//!
//! ```text
//! NSPEC (1) | NSPEC x [LSTYPE (1) | LSLEN (1) | LSPEC] | HTYPE (2) | HLEN (2) | HDATA
//! ```
//!
//! Link specifier types:
//! - 0x00: TLS-over-TCP, IPv4 address (4) + port (2)
//! - 0x01: TLS-over-TCP, IPv6 address (16) + port (2)
//! - 0x02: Legacy identity (RSA SHA-1 fingerprint, 20)
//! - 0x03: Ed25519 identity (32)
//!
//! The legacy RELAY_EXTEND body is fixed: addr (4) | port (2) | TAP onionskin
//! (186) | identity (20).
//!
//! This hop never interprets the handshake data; it copies it into a CREATE2
//! (or CREATE) toward the next relay and copies the answer back.

use crate::error::{RelayError, Result};
use crate::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand, PAYLOAD_SIZE};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// TAP handshake type
pub const HTYPE_TAP: u16 = 0x0000;

/// ntor handshake type
pub const HTYPE_NTOR: u16 = 0x0002;

/// TAP onionskin carried by CREATE / EXTEND
pub const TAP_ONIONSKIN_LEN: usize = 186;

/// TAP server reply carried by CREATED / EXTENDED
pub const TAP_REPLY_LEN: usize = 148;

const LEGACY_EXTEND_LEN: usize = 4 + 2 + TAP_ONIONSKIN_LEN + 20;

/// One EXTEND2 link specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecifier {
    Ipv4(SocketAddr),
    Ipv6(SocketAddr),
    LegacyIdentity([u8; 20]),
    Ed25519Identity([u8; 32]),
    /// Types this relay does not know are carried but ignored
    Unrecognized { kind: u8, body: Vec<u8> },
}

impl LinkSpecifier {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            LinkSpecifier::Ipv4(addr) | LinkSpecifier::Ipv6(addr) => match addr.ip() {
                IpAddr::V4(ip) => {
                    out.push(0x00);
                    out.push(6);
                    out.extend_from_slice(&ip.octets());
                    out.extend_from_slice(&addr.port().to_be_bytes());
                }
                IpAddr::V6(ip) => {
                    out.push(0x01);
                    out.push(18);
                    out.extend_from_slice(&ip.octets());
                    out.extend_from_slice(&addr.port().to_be_bytes());
                }
            },
            LinkSpecifier::LegacyIdentity(id) => {
                out.push(0x02);
                out.push(20);
                out.extend_from_slice(id);
            }
            LinkSpecifier::Ed25519Identity(id) => {
                out.push(0x03);
                out.push(32);
                out.extend_from_slice(id);
            }
            LinkSpecifier::Unrecognized { kind, body } => {
                out.push(*kind);
                out.push(body.len() as u8);
                out.extend_from_slice(body);
            }
        }
    }

    fn parse(kind: u8, body: &[u8]) -> Result<Self> {
        let wrong_len = || {
            RelayError::ProtocolViolation(format!(
                "link specifier type {} has bad length {}",
                kind,
                body.len()
            ))
        };

        match kind {
            0x00 => {
                let raw: [u8; 6] = body.try_into().map_err(|_| wrong_len())?;
                let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
                let port = u16::from_be_bytes([raw[4], raw[5]]);
                Ok(LinkSpecifier::Ipv4(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            0x01 => {
                if body.len() != 18 {
                    return Err(wrong_len());
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                Ok(LinkSpecifier::Ipv6(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            0x02 => Ok(LinkSpecifier::LegacyIdentity(
                body.try_into().map_err(|_| wrong_len())?,
            )),
            0x03 => Ok(LinkSpecifier::Ed25519Identity(
                body.try_into().map_err(|_| wrong_len())?,
            )),
            _ => Ok(LinkSpecifier::Unrecognized {
                kind,
                body: body.to_vec(),
            }),
        }
    }
}

/// Where the client wants the circuit to go next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendTarget {
    pub addrs: Vec<SocketAddr>,
    pub rsa_identity: Option<[u8; 20]>,
    pub ed_identity: Option<[u8; 32]>,
}

impl ExtendTarget {
    /// Link specifiers describing this target
    pub fn link_specifiers(&self) -> Vec<LinkSpecifier> {
        let mut specs: Vec<LinkSpecifier> = self
            .addrs
            .iter()
            .map(|addr| match addr {
                SocketAddr::V4(_) => LinkSpecifier::Ipv4(*addr),
                SocketAddr::V6(_) => LinkSpecifier::Ipv6(*addr),
            })
            .collect();
        if let Some(id) = self.rsa_identity {
            specs.push(LinkSpecifier::LegacyIdentity(id));
        }
        if let Some(id) = self.ed_identity {
            specs.push(LinkSpecifier::Ed25519Identity(id));
        }
        specs
    }

    /// Whether the target names a relay with these identities
    ///
    /// Either key alone is enough: an EXTEND2 may carry only the ed25519 one.
    pub fn names(&self, fingerprint: &[u8; 20], ed_identity: Option<&[u8; 32]>) -> bool {
        self.rsa_identity.as_ref() == Some(fingerprint)
            || (ed_identity.is_some() && self.ed_identity.as_ref() == ed_identity)
    }
}

/// Handshake the next hop has to answer
#[derive(Clone, PartialEq, Eq)]
pub enum CreateBody {
    Create2 { htype: u16, hdata: Vec<u8> },
    Tap { onionskin: Vec<u8> },
}

impl CreateBody {
    /// The CREATE2 / CREATE cell to send on the outgoing leg
    pub fn to_cell(&self, circuit_id: u32) -> Result<Cell> {
        match self {
            CreateBody::Create2 { htype, hdata } => {
                let mut payload = Vec::with_capacity(4 + hdata.len());
                payload.extend_from_slice(&htype.to_be_bytes());
                payload.extend_from_slice(&(hdata.len() as u16).to_be_bytes());
                payload.extend_from_slice(hdata);
                Cell::new(circuit_id, CellCommand::Create2, &payload)
            }
            CreateBody::Tap { onionskin } => Cell::new(circuit_id, CellCommand::Create, onionskin),
        }
    }
}

impl std::fmt::Debug for CreateBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateBody::Create2 { htype, hdata } => f
                .debug_struct("Create2")
                .field("htype", htype)
                .field("hlen", &hdata.len())
                .finish(),
            CreateBody::Tap { onionskin } => f
                .debug_struct("Tap")
                .field("len", &onionskin.len())
                .finish(),
        }
    }
}

/// A parsed EXTEND or EXTEND2 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendRequest {
    pub target: ExtendTarget,
    pub create: CreateBody,
}

impl ExtendRequest {
    /// Parse the data of a RELAY_EXTEND or RELAY_EXTEND2 cell
    pub fn parse(command: RelayCommand, data: &[u8]) -> Result<Self> {
        let request = match command {
            RelayCommand::Extend2 => Self::parse_extend2(data)?,
            RelayCommand::Extend => Self::parse_extend(data)?,
            other => {
                return Err(RelayError::ProtocolViolation(format!(
                    "{:?} is not an extend request",
                    other
                )))
            }
        };

        if request.target.addrs.is_empty() {
            return Err(RelayError::ProtocolViolation(
                "extend request names no address".into(),
            ));
        }
        Ok(request)
    }

    fn parse_extend2(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let nspec = reader.u8()?;

        let mut target = ExtendTarget::default();
        for _ in 0..nspec {
            let kind = reader.u8()?;
            let len = reader.u8()? as usize;
            match LinkSpecifier::parse(kind, reader.take(len)?)? {
                LinkSpecifier::Ipv4(addr) | LinkSpecifier::Ipv6(addr) => target.addrs.push(addr),
                LinkSpecifier::LegacyIdentity(id) => target.rsa_identity = Some(id),
                LinkSpecifier::Ed25519Identity(id) => target.ed_identity = Some(id),
                LinkSpecifier::Unrecognized { kind, .. } => {
                    log::debug!("Ignoring link specifier type {}", kind);
                }
            }
        }

        let htype = reader.u16()?;
        let hlen = reader.u16()? as usize;
        let hdata = reader.take(hlen)?.to_vec();

        // CREATE2 needs HTYPE and HLEN in front of the data
        if hdata.len() > PAYLOAD_SIZE - 4 {
            return Err(RelayError::ProtocolViolation(format!(
                "handshake data of {} bytes does not fit CREATE2",
                hdata.len()
            )));
        }

        Ok(Self {
            target,
            create: CreateBody::Create2 { htype, hdata },
        })
    }

    fn parse_extend(data: &[u8]) -> Result<Self> {
        if data.len() < LEGACY_EXTEND_LEN {
            return Err(RelayError::ProtocolViolation(format!(
                "EXTEND body of {} bytes, need {}",
                data.len(),
                LEGACY_EXTEND_LEN
            )));
        }

        let mut reader = Reader::new(data);
        let addr = LinkSpecifier::parse(0x00, reader.take(6)?)?;
        let onionskin = reader.take(TAP_ONIONSKIN_LEN)?.to_vec();
        let mut identity = [0u8; 20];
        identity.copy_from_slice(reader.take(20)?);

        let addrs = match addr {
            LinkSpecifier::Ipv4(addr) => vec![addr],
            _ => Vec::new(),
        };

        Ok(Self {
            target: ExtendTarget {
                addrs,
                rsa_identity: Some(identity),
                ed_identity: None,
            },
            create: CreateBody::Tap { onionskin },
        })
    }

    /// Encode as RELAY_EXTEND2 data
    pub fn to_extend2_data(&self) -> Result<Vec<u8>> {
        let (htype, hdata) = match &self.create {
            CreateBody::Create2 { htype, hdata } => (*htype, hdata.as_slice()),
            CreateBody::Tap { onionskin } => (HTYPE_TAP, onionskin.as_slice()),
        };

        let specs = self.target.link_specifiers();
        let mut payload = Vec::new();
        payload.push(specs.len() as u8);
        for spec in &specs {
            spec.encode(&mut payload);
        }
        payload.extend_from_slice(&htype.to_be_bytes());
        payload.extend_from_slice(&(hdata.len() as u16).to_be_bytes());
        payload.extend_from_slice(hdata);

        if payload.len() > RelayCell::MAX_DATA_SIZE {
            return Err(RelayError::ProtocolViolation(format!(
                "EXTEND2 body of {} bytes does not fit a relay cell",
                payload.len()
            )));
        }
        Ok(payload)
    }
}

/// Turn the next hop's CREATED / CREATED2 into the relay cell for the client
///
/// EXTENDED2 carries the CREATED2 body (HLEN | HDATA) unchanged; EXTENDED
/// carries the TAP reply.
pub fn extended_reply(created: &Cell) -> Result<RelayCell> {
    match created.command {
        CellCommand::Created2 => {
            let hlen = u16::from_be_bytes([created.payload[0], created.payload[1]]) as usize;
            let body_len = 2 + hlen;
            if body_len > RelayCell::MAX_DATA_SIZE {
                return Err(RelayError::ProtocolViolation(format!(
                    "CREATED2 HLEN {} does not fit EXTENDED2",
                    hlen
                )));
            }
            RelayCell::new(
                RelayCommand::Extended2,
                0,
                created.payload[..body_len].to_vec(),
            )
        }
        CellCommand::Created => RelayCell::new(
            RelayCommand::Extended,
            0,
            created.payload[..TAP_REPLY_LEN].to_vec(),
        ),
        other => Err(RelayError::ProtocolViolation(format!(
            "{:?} does not answer an extend",
            other
        ))),
    }
}

/// Bounds-checked cursor over a relay body
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(RelayError::ProtocolViolation(format!(
                "extend body truncated at byte {}",
                self.pos
            ))),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ExtendTarget {
        ExtendTarget {
            addrs: vec!["192.0.2.10:9001".parse().unwrap()],
            rsa_identity: Some([0xAB; 20]),
            ed_identity: Some([0xCD; 32]),
        }
    }

    #[test]
    fn test_extend2_layout() {
        let request = ExtendRequest {
            target: target(),
            create: CreateBody::Create2 {
                htype: HTYPE_NTOR,
                hdata: vec![0x11; 84],
            },
        };
        let data = request.to_extend2_data().unwrap();

        assert_eq!(data[0], 3, "NSPEC");
        assert_eq!(&data[1..3], &[0x00, 6]);
        assert_eq!(&data[3..7], &[192, 0, 2, 10]);
        assert_eq!(&data[7..9], &9001u16.to_be_bytes());
        assert_eq!(&data[9..11], &[0x02, 20]);
        assert_eq!(&data[31..33], &[0x03, 32]);
        assert_eq!(&data[65..67], &HTYPE_NTOR.to_be_bytes());
        assert_eq!(&data[67..69], &84u16.to_be_bytes());
        assert_eq!(data.len(), 69 + 84);

        let parsed = ExtendRequest::parse(RelayCommand::Extend2, &data).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_extend2_ipv6_and_unknown_specifier() {
        let mut data = vec![2u8];
        data.extend_from_slice(&[0x01, 18]);
        data.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        data.extend_from_slice(&443u16.to_be_bytes());
        data.extend_from_slice(&[0x7F, 3, 1, 2, 3]);
        data.extend_from_slice(&HTYPE_NTOR.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());

        let parsed = ExtendRequest::parse(RelayCommand::Extend2, &data).unwrap();
        assert_eq!(parsed.target.addrs, vec!["[::1]:443".parse().unwrap()]);
        assert_eq!(parsed.target.rsa_identity, None);
    }

    #[test]
    fn test_extend2_truncated_is_violation() {
        let request = ExtendRequest {
            target: target(),
            create: CreateBody::Create2 {
                htype: HTYPE_NTOR,
                hdata: vec![0x11; 84],
            },
        };
        let data = request.to_extend2_data().unwrap();

        for cut in [0, 1, 8, 66, data.len() - 1] {
            assert!(matches!(
                ExtendRequest::parse(RelayCommand::Extend2, &data[..cut]),
                Err(RelayError::ProtocolViolation(_))
            ));
        }
    }

    #[test]
    fn test_extend2_without_address_is_violation() {
        let mut data = vec![1u8, 0x02, 20];
        data.extend_from_slice(&[0xAB; 20]);
        data.extend_from_slice(&[0, 2, 0, 0]);
        assert!(ExtendRequest::parse(RelayCommand::Extend2, &data).is_err());
    }

    #[test]
    fn test_bad_specifier_length_is_violation() {
        let data = [1u8, 0x00, 5, 1, 2, 3, 4, 5, 0, 2, 0, 0];
        assert!(ExtendRequest::parse(RelayCommand::Extend2, &data).is_err());
    }

    #[test]
    fn test_names_matches_either_identity() {
        let ed_only = ExtendTarget {
            addrs: vec!["192.0.2.10:9001".parse().unwrap()],
            rsa_identity: None,
            ed_identity: Some([0xCD; 32]),
        };
        assert!(ed_only.names(&[0xAB; 20], Some(&[0xCD; 32])));
        assert!(!ed_only.names(&[0xAB; 20], Some(&[0xCE; 32])));
        assert!(!ed_only.names(&[0xAB; 20], None));

        assert!(target().names(&[0xAB; 20], None));
        assert!(target().names(&[0x00; 20], Some(&[0xCD; 32])));
        assert!(!target().names(&[0x00; 20], Some(&[0x00; 32])));

        let unnamed = ExtendTarget {
            addrs: vec!["192.0.2.10:9001".parse().unwrap()],
            rsa_identity: None,
            ed_identity: None,
        };
        assert!(!unnamed.names(&[0xAB; 20], None));
    }

    #[test]
    fn test_legacy_extend() {
        let mut data = Vec::new();
        data.extend_from_slice(&[10, 0, 0, 7]);
        data.extend_from_slice(&9001u16.to_be_bytes());
        data.extend_from_slice(&[0x55; TAP_ONIONSKIN_LEN]);
        data.extend_from_slice(&[0x66; 20]);

        let parsed = ExtendRequest::parse(RelayCommand::Extend, &data).unwrap();
        assert_eq!(parsed.target.addrs, vec!["10.0.0.7:9001".parse().unwrap()]);
        assert_eq!(parsed.target.rsa_identity, Some([0x66; 20]));
        assert!(parsed.target.names(&[0x66; 20], None));

        let cell = parsed.create.to_cell(3).unwrap();
        assert_eq!(cell.command, CellCommand::Create);
        assert_eq!(&cell.payload[..TAP_ONIONSKIN_LEN], &[0x55; TAP_ONIONSKIN_LEN][..]);

        assert!(ExtendRequest::parse(RelayCommand::Extend, &data[..100]).is_err());
    }

    #[test]
    fn test_create2_cell_from_extend() {
        let body = CreateBody::Create2 {
            htype: HTYPE_NTOR,
            hdata: vec![0x42; 84],
        };
        let cell = body.to_cell(0x8000_0003).unwrap();
        assert_eq!(cell.command, CellCommand::Create2);
        assert_eq!(cell.circuit_id, 0x8000_0003);
        assert_eq!(&cell.payload[..4], &[0, 2, 0, 84]);
        assert_eq!(&cell.payload[4..88], &[0x42; 84][..]);
        assert_eq!(cell.payload[88], 0);
    }

    #[test]
    fn test_created2_becomes_extended2() {
        let mut body = vec![0u8, 64];
        body.extend_from_slice(&[0x77; 64]);
        let created = Cell::new(3, CellCommand::Created2, &body).unwrap();

        let reply = extended_reply(&created).unwrap();
        assert_eq!(reply.command, RelayCommand::Extended2);
        assert_eq!(reply.data, body);

        let fast = Cell::new(3, CellCommand::CreatedFast, &[0u8; 40]).unwrap();
        assert!(extended_reply(&fast).is_err());
    }

    #[test]
    fn test_oversized_created2_is_violation() {
        let created = Cell::new(3, CellCommand::Created2, &[0x01, 0xF1]).unwrap();
        assert!(extended_reply(&created).is_err());
    }
}
