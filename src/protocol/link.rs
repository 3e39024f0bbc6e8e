//! Link negotiation
//!
//! Every connection starts with a VERSIONS exchange (always framed with
//! 2-byte circuit ids), optional certificate cells, and a NETINFO exchange.
//! Only after that does the fixed-cell [`CellCodec`] take over.
//!
//! SECURITY: negotiation refuses versions below 4 so a peer cannot force the
//! link down to 2-byte circuit ids and pre-ed25519 certificates.

use crate::error::{RelayError, Result};
use crate::protocol::cell::{
    Cell, CellCodec, CellCommand, Decoded, LinkVersion, VarCell, PAYLOAD_SIZE,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Lowest link version this relay will negotiate
pub const MINIMUM_SECURE_VERSION: u16 = 4;

/// Versions advertised in our VERSIONS cell
pub const OUR_VERSIONS: [u16; 2] = [4, 5];

/// VERSIONS cells always use 2-byte circuit ids
const VERSIONS_CIRC_ID_LEN: usize = 2;

/// Any cell seen during link negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCell {
    Fixed(Cell),
    Var(VarCell),
}

/// Build a VERSIONS cell advertising `versions`
pub fn versions_cell(versions: &[u16]) -> VarCell {
    VarCell {
        circuit_id: 0,
        command: CellCommand::Versions,
        payload: versions.iter().flat_map(|v| v.to_be_bytes()).collect(),
    }
}

/// Parse VERSIONS cell payload into list of supported versions
pub fn parse_versions(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() % 2 != 0 {
        return Err(RelayError::ProtocolViolation(
            "VERSIONS payload length must be even".into(),
        ));
    }

    let versions: Vec<u16> = payload
        .chunks(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect();

    log::debug!("Peer supports link versions: {:?}", versions);
    Ok(versions)
}

/// Negotiate the highest common version with downgrade protection
pub fn negotiate_version(our_versions: &[u16], peer_versions: &[u16]) -> Result<LinkVersion> {
    let best = our_versions
        .iter()
        .copied()
        .filter(|v| peer_versions.contains(v))
        .max();

    match best {
        Some(v) if v >= MINIMUM_SECURE_VERSION => LinkVersion::new(v).ok_or_else(|| {
            RelayError::ProtocolViolation(format!("negotiated unframeable version {}", v))
        }),
        Some(v) => Err(RelayError::ProtocolViolation(format!(
            "Protocol downgrade: peer wants version {} but minimum is {}",
            v, MINIMUM_SECURE_VERSION
        ))),
        None => Err(RelayError::ProtocolViolation(
            "No common link protocol version".into(),
        )),
    }
}

/// Send our VERSIONS cell
pub async fn write_versions<W>(stream: &mut W, versions: &[u16]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = versions_cell(versions).encode(VERSIONS_CIRC_ID_LEN)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the peer's VERSIONS cell and return the versions it lists
pub async fn read_versions<R>(stream: &mut R) -> Result<Vec<u16>>
where
    R: AsyncRead + Unpin,
{
    let cell = read_var_cell(stream, VERSIONS_CIRC_ID_LEN).await?;
    if cell.command != CellCommand::Versions {
        return Err(RelayError::ProtocolViolation(format!(
            "expected VERSIONS, got {:?}",
            cell.command
        )));
    }
    parse_versions(&cell.payload)
}

/// Read one variable-length cell
pub async fn read_var_cell<R>(stream: &mut R, circ_id_len: usize) -> Result<VarCell>
where
    R: AsyncRead + Unpin,
{
    let mut header = vec![0u8; VarCell::header_len(circ_id_len)];
    stream.read_exact(&mut header).await?;
    let (circuit_id, command, length) = VarCell::parse_header(&header, circ_id_len)?;

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;

    Ok(VarCell {
        circuit_id,
        command,
        payload,
    })
}

/// Read a cell of either kind after VERSIONS has fixed the link version
pub async fn read_link_cell<R>(stream: &mut R, version: LinkVersion) -> Result<LinkCell>
where
    R: AsyncRead + Unpin,
{
    let id_len = version.circ_id_len();
    let mut buf = vec![0u8; version.cell_size()];
    stream.read_exact(&mut buf[..id_len + 1]).await?;

    let command = CellCommand::from_u8(buf[id_len])
        .ok_or_else(|| RelayError::MalformedCell(format!("unknown command byte {}", buf[id_len])))?;

    if command.is_variable_length() {
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await?;
        let mut header = buf[..id_len + 1].to_vec();
        header.extend_from_slice(&len);
        let (circuit_id, command, length) = VarCell::parse_header(&header, id_len)?;

        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await?;
        return Ok(LinkCell::Var(VarCell {
            circuit_id,
            command,
            payload,
        }));
    }

    stream.read_exact(&mut buf[id_len + 1..]).await?;
    match CellCodec::new(version).decode(&buf) {
        Decoded::Cell(cell) => Ok(LinkCell::Fixed(cell)),
        Decoded::Malformed(reason) => Err(RelayError::MalformedCell(reason)),
        Decoded::NeedMoreData(_) => Err(RelayError::Internal("short link cell buffer".into())),
    }
}

/// NETINFO cell body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netinfo {
    /// Sender's clock, seconds since the epoch (0 from clients)
    pub timestamp: u32,
    /// Address the sender sees for the receiver
    pub other_addr: Option<IpAddr>,
    /// Addresses the sender claims for itself
    pub my_addrs: Vec<IpAddr>,
}

impl Netinfo {
    /// Build a NETINFO stamped with the current time
    pub fn new(other_addr: Option<IpAddr>, my_addrs: Vec<IpAddr>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self {
            timestamp,
            other_addr,
            my_addrs,
        }
    }

    pub fn to_cell(&self) -> Result<Cell> {
        let mut payload = Vec::with_capacity(PAYLOAD_SIZE);
        payload.extend_from_slice(&self.timestamp.to_be_bytes());
        match self.other_addr {
            Some(addr) => encode_addr(&mut payload, addr),
            None => payload.extend_from_slice(&[0x04, 4, 0, 0, 0, 0]),
        }

        let count = u8::try_from(self.my_addrs.len())
            .map_err(|_| RelayError::Internal("too many NETINFO addresses".into()))?;
        payload.push(count);
        for addr in &self.my_addrs {
            encode_addr(&mut payload, *addr);
        }

        Cell::new(0, CellCommand::Netinfo, &payload)
    }

    pub fn from_cell(cell: &Cell) -> Result<Self> {
        if cell.command != CellCommand::Netinfo {
            return Err(RelayError::ProtocolViolation(format!(
                "expected NETINFO, got {:?}",
                cell.command
            )));
        }

        let payload = &cell.payload;
        let timestamp = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let mut pos = 4;

        let other_addr = decode_addr(payload, &mut pos)?;
        let count = *payload
            .get(pos)
            .ok_or_else(|| RelayError::ProtocolViolation("NETINFO truncated".into()))?;
        pos += 1;

        let mut my_addrs = Vec::new();
        for _ in 0..count {
            if let Some(addr) = decode_addr(payload, &mut pos)? {
                my_addrs.push(addr);
            }
        }

        Ok(Self {
            timestamp,
            other_addr,
            my_addrs,
        })
    }
}

fn encode_addr(out: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            out.extend_from_slice(&[0x04, 4]);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.extend_from_slice(&[0x06, 16]);
            out.extend_from_slice(&v6.octets());
        }
    }
}

// Unknown address types are skipped by length.
fn decode_addr(payload: &[u8], pos: &mut usize) -> Result<Option<IpAddr>> {
    let truncated = || RelayError::ProtocolViolation("NETINFO address truncated".into());
    let atype = *payload.get(*pos).ok_or_else(truncated)?;
    let alen = *payload.get(*pos + 1).ok_or_else(truncated)? as usize;
    let value = payload.get(*pos + 2..*pos + 2 + alen).ok_or_else(truncated)?;
    *pos += 2 + alen;

    Ok(match (atype, alen) {
        (0x04, 4) => Some(IpAddr::V4(Ipv4Addr::new(value[0], value[1], value[2], value[3]))),
        (0x06, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(value);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_highest_common() {
        assert_eq!(negotiate_version(&[4, 5], &[3, 4, 5]).unwrap(), LinkVersion::V5);
        assert_eq!(negotiate_version(&[4, 5], &[1, 2, 4]).unwrap(), LinkVersion::V4);
    }

    #[test]
    fn test_negotiate_refuses_downgrade() {
        assert!(negotiate_version(&[3, 4], &[1, 2, 3]).is_err());
        assert!(negotiate_version(&[4, 5], &[1, 2]).is_err());
    }

    #[test]
    fn test_parse_versions() {
        assert_eq!(parse_versions(&[0, 3, 0, 4, 0, 5]).unwrap(), vec![3, 4, 5]);
        assert!(parse_versions(&[0, 3, 0]).is_err());
    }

    #[test]
    fn test_netinfo_encoding() {
        let netinfo = Netinfo {
            timestamp: 1_700_000_000,
            other_addr: Some("10.0.0.2".parse().unwrap()),
            my_addrs: vec!["192.0.2.1".parse().unwrap(), "2001:db8::1".parse().unwrap()],
        };
        let cell = netinfo.to_cell().unwrap();
        assert_eq!(cell.circuit_id, 0);
        assert_eq!(&cell.payload[4..10], &[0x04, 4, 10, 0, 0, 2]);
        assert_eq!(Netinfo::from_cell(&cell).unwrap(), netinfo);
    }

    #[test]
    fn test_netinfo_skips_unknown_address_types() {
        let mut payload = vec![0, 0, 0, 0];
        payload.extend_from_slice(&[0xF0, 2, 0xAA, 0xBB]); // unknown other address
        payload.push(1);
        payload.extend_from_slice(&[0x04, 4, 127, 0, 0, 1]);
        let cell = Cell::new(0, CellCommand::Netinfo, &payload).unwrap();

        let parsed = Netinfo::from_cell(&cell).unwrap();
        assert_eq!(parsed.other_addr, None);
        assert_eq!(parsed.my_addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_versions_exchange_over_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_versions(&mut a, &OUR_VERSIONS).await.unwrap();
        assert_eq!(read_versions(&mut b).await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_read_link_cell_mixes_fixed_and_variable() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let certs = VarCell {
            circuit_id: 0,
            command: CellCommand::Certs,
            payload: vec![0],
        };
        a.write_all(&certs.encode(4).unwrap()).await.unwrap();
        let netinfo = Netinfo::new(None, vec![]).to_cell().unwrap();
        a.write_all(&CellCodec::new(LinkVersion::V4).encode(&netinfo).unwrap())
            .await
            .unwrap();

        assert_eq!(
            read_link_cell(&mut b, LinkVersion::V4).await.unwrap(),
            LinkCell::Var(certs)
        );
        assert_eq!(
            read_link_cell(&mut b, LinkVersion::V4).await.unwrap(),
            LinkCell::Fixed(netinfo)
        );
    }
}
