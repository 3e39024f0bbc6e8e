//! Link handshakes
//!
//! TLS and certificate checking belong to whoever implements
//! [`LinkHandshaker`]. The relay only needs the resulting byte stream and the
//! negotiated [`LinkParams`].

use super::{BoxedLinkStream, LinkParams};
use crate::error::{RelayError, Result};
use crate::protocol::cell::{CellCommand, LinkVersion};
use crate::protocol::extend::ExtendTarget;
use crate::protocol::link::{self, LinkCell, Netinfo, OUR_VERSIONS};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Authenticates links in both directions
#[async_trait]
pub trait LinkHandshaker: Send + Sync {
    /// Complete the responder side of a link a peer opened
    async fn accept(&self, stream: TcpStream, peer: SocketAddr)
        -> Result<(BoxedLinkStream, LinkParams)>;

    /// Open a link to the target of an EXTEND
    async fn dial(&self, target: &ExtendTarget) -> Result<(BoxedLinkStream, LinkParams)>;
}

/// Plain-TCP handshaker: VERSIONS and NETINFO, no certificates
///
/// Peers are never authenticated, so every link reports no identity.
#[derive(Debug, Clone)]
pub struct UnauthenticatedHandshaker {
    our_addrs: Vec<IpAddr>,
    dial_timeout: Duration,
}

impl UnauthenticatedHandshaker {
    pub fn new(our_addrs: Vec<IpAddr>, dial_timeout: Duration) -> Self {
        Self {
            our_addrs,
            dial_timeout,
        }
    }
}

#[async_trait]
impl LinkHandshaker for UnauthenticatedHandshaker {
    async fn accept(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(BoxedLinkStream, LinkParams)> {
        stream.set_nodelay(true)?;
        let version = respond(&mut stream, Some(peer.ip()), &self.our_addrs).await?;
        log::debug!("Accepted {} link from {}", version, peer);

        Ok((
            Box::pin(stream),
            LinkParams {
                peer_identity: None,
                peer_addr: Some(peer),
                version,
                initiator: false,
            },
        ))
    }

    async fn dial(&self, target: &ExtendTarget) -> Result<(BoxedLinkStream, LinkParams)> {
        let mut last_error = RelayError::ConnectionFailed("extend target has no address".into());

        for addr in &target.addrs {
            let connected = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await;
            let mut stream = match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    log::debug!("Dial {} failed: {}", addr, e);
                    last_error = RelayError::ConnectionFailed(format!("{}: {}", addr, e));
                    continue;
                }
                Err(_) => {
                    log::debug!("Dial {} timed out", addr);
                    last_error = RelayError::Timeout;
                    continue;
                }
            };
            stream.set_nodelay(true)?;

            let version = initiate(&mut stream, Some(addr.ip()), &self.our_addrs).await?;
            log::debug!("Opened {} link to {}", version, addr);

            return Ok((
                Box::pin(stream),
                LinkParams {
                    peer_identity: None,
                    peer_addr: Some(*addr),
                    version,
                    initiator: true,
                },
            ));
        }

        Err(last_error)
    }
}

/// Responder side: read VERSIONS, answer VERSIONS and NETINFO, wait for NETINFO
pub(crate) async fn respond<S>(
    stream: &mut S,
    peer_ip: Option<IpAddr>,
    our_addrs: &[IpAddr],
) -> Result<LinkVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer_versions = link::read_versions(stream).await?;
    let version = link::negotiate_version(&OUR_VERSIONS, &peer_versions)?;
    link::write_versions(stream, &OUR_VERSIONS).await?;

    send_netinfo(stream, version, peer_ip, our_addrs).await?;
    await_netinfo(stream, version).await?;
    Ok(version)
}

/// Initiator side: send VERSIONS, read VERSIONS, wait for NETINFO, answer it
pub(crate) async fn initiate<S>(
    stream: &mut S,
    peer_ip: Option<IpAddr>,
    our_addrs: &[IpAddr],
) -> Result<LinkVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    link::write_versions(stream, &OUR_VERSIONS).await?;
    let peer_versions = link::read_versions(stream).await?;
    let version = link::negotiate_version(&OUR_VERSIONS, &peer_versions)?;

    await_netinfo(stream, version).await?;
    send_netinfo(stream, version, peer_ip, our_addrs).await?;
    Ok(version)
}

async fn send_netinfo<S>(
    stream: &mut S,
    version: LinkVersion,
    peer_ip: Option<IpAddr>,
    our_addrs: &[IpAddr],
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let cell = Netinfo::new(peer_ip, our_addrs.to_vec()).to_cell()?;
    let bytes = crate::protocol::cell::CellCodec::new(version).encode(&cell)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Skip certificate and padding cells until the peer's NETINFO
async fn await_netinfo<S>(stream: &mut S, version: LinkVersion) -> Result<Netinfo>
where
    S: AsyncRead + Unpin,
{
    loop {
        match link::read_link_cell(stream, version).await? {
            LinkCell::Fixed(cell) if cell.command == CellCommand::Netinfo => {
                let netinfo = Netinfo::from_cell(&cell)?;
                log::trace!("Peer NETINFO: {:?}", netinfo);
                return Ok(netinfo);
            }
            LinkCell::Fixed(cell) if cell.command == CellCommand::Padding => continue,
            LinkCell::Var(cell)
                if matches!(
                    cell.command,
                    CellCommand::Vpadding
                        | CellCommand::Certs
                        | CellCommand::AuthChallenge
                        | CellCommand::Authenticate
                        | CellCommand::Authorize
                ) =>
            {
                log::trace!("Skipping {:?} during link negotiation", cell.command);
            }
            other => {
                return Err(RelayError::ProtocolViolation(format!(
                    "unexpected cell during link negotiation: {:?}",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::{Cell, CellCodec};

    #[tokio::test]
    async fn test_initiator_and_responder_agree() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let our: IpAddr = "203.0.113.5".parse().unwrap();
        let our_addrs = [our];

        let (initiated, responded) = tokio::join!(
            initiate(&mut a, None, &our_addrs),
            respond(&mut b, None, &[])
        );
        assert_eq!(initiated.unwrap(), LinkVersion::V5);
        assert_eq!(responded.unwrap(), LinkVersion::V5);
    }

    #[tokio::test]
    async fn test_downgrade_refused() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let peer = async move {
            link::write_versions(&mut a, &[3]).await.unwrap();
            a
        };
        let (_a, responded) = tokio::join!(peer, respond(&mut b, None, &[]));
        assert!(matches!(responded, Err(RelayError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_certs_skipped_before_netinfo() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let relay = async move {
            let peer = link::read_versions(&mut a).await.unwrap();
            assert!(peer.contains(&4));
            link::write_versions(&mut a, &[4]).await.unwrap();

            let certs = crate::protocol::cell::VarCell {
                circuit_id: 0,
                command: CellCommand::Certs,
                payload: vec![0],
            };
            a.write_all(&certs.encode(4).unwrap()).await.unwrap();
            let netinfo = Netinfo::new(None, vec![]).to_cell().unwrap();
            let codec = CellCodec::new(LinkVersion::V4);
            a.write_all(&codec.encode(&netinfo).unwrap()).await.unwrap();
            a
        };

        let (_a, initiated) = tokio::join!(relay, initiate(&mut b, None, &[]));
        assert_eq!(initiated.unwrap(), LinkVersion::V4);
    }

    #[tokio::test]
    async fn test_circuit_cell_during_negotiation_rejected() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let peer = async move {
            link::write_versions(&mut a, &[4, 5]).await.unwrap();
            let _ = link::read_versions(&mut a).await.unwrap();
            let create = Cell::new(9, CellCommand::CreateFast, &[0; 20]).unwrap();
            let codec = CellCodec::new(LinkVersion::V5);
            a.write_all(&codec.encode(&create).unwrap()).await.unwrap();
            a
        };
        let (_a, responded) = tokio::join!(peer, respond(&mut b, None, &[]));
        assert!(responded.is_err());
    }
}
