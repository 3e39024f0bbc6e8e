//! Network layer
//!
//! Owns the relay's links to peers. A link is authenticated by a
//! [`LinkHandshaker`] and then split into a reader (driven by that
//! connection's dispatcher worker) and a writer task fed by a bounded queue.

mod connection_manager;
mod handshaker;

pub use connection_manager::{CellReader, Connection, ConnectionManager};
pub(crate) use connection_manager::wait_closed;
pub use handshaker::{LinkHandshaker, UnauthenticatedHandshaker};

use crate::protocol::cell::LinkVersion;
use rand::RngCore;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream a link runs over (TLS in production, anything in tests)
pub trait LinkStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> LinkStream for T {}

pub type BoxedLinkStream = Pin<Box<dyn LinkStream>>;

/// Process-unique connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// What link negotiation established about a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    /// Relay identity fingerprint, `None` for clients and unauthenticated links
    pub peer_identity: Option<[u8; 20]>,
    pub peer_addr: Option<SocketAddr>,
    pub version: LinkVersion,
    /// Whether this relay opened the link
    pub initiator: bool,
}

impl LinkParams {
    /// Circuit ids this side allocates on the link
    pub fn id_space(&self) -> CircuitIdSpace {
        CircuitIdSpace {
            version: self.version,
            initiator: self.initiator,
        }
    }

    /// Whether the peer may open a circuit with this id
    ///
    /// Only enforced against authenticated relays; clients do not follow the
    /// high-bit convention reliably.
    pub fn peer_may_use(&self, circuit_id: u32) -> bool {
        if circuit_id == 0 {
            return false;
        }
        if self.peer_identity.is_none() {
            return true;
        }
        let peer_space = CircuitIdSpace {
            version: self.version,
            initiator: !self.initiator,
        };
        peer_space.contains(circuit_id)
    }
}

/// Half of a link's circuit id space
///
/// The side that opened the link sets the high bit of the ids it allocates,
/// so both ends can create circuits without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitIdSpace {
    pub version: LinkVersion,
    pub initiator: bool,
}

impl CircuitIdSpace {
    /// A random nonzero id from this half of the space
    pub fn random_id<R: RngCore>(&self, rng: &mut R) -> u32 {
        let high = self.version.initiator_bit();
        let low_mask = high - 1;
        loop {
            let mut id = rng.next_u32() & low_mask;
            if self.initiator {
                id |= high;
            }
            if id != 0 {
                return id;
            }
        }
    }

    pub fn contains(&self, circuit_id: u32) -> bool {
        if circuit_id == 0 || circuit_id > self.version.max_circuit_id() {
            return false;
        }
        let high_set = circuit_id & self.version.initiator_bit() != 0;
        high_set == self.initiator
    }
}
