//! # tor-relay
//!
//! The cell-relay and circuit engine of an onion router.
//!
//! ## Architecture
//!
//! ```text
//! OnionRouter (accept loop, reaper, fatal channel)
//!   ↓
//! ConnectionManager ── one writer task + one dispatcher worker per link
//!   ↓
//! RelayDispatcher ── CircuitTable lookup, onion layer, queue credit
//!   ↓
//! CellCodec ── fixed-size cells on the wire
//! ```
//!
//! ## Features
//!
//! - **Circuit relay**: CREATE_FAST and ntor CREATE2 answered, EXTEND/EXTEND2
//!   followed to the next hop, relay cells peeled and forwarded
//! - **Onion layer**: AES-128-CTR with a running SHA-1 digest per direction
//! - **Bounded memory**: per-circuit queue credit and bounded per-link queues
//! - **Key rotation**: ntor onion keys rotate with an overlap window
//! - **Fatal surfacing**: anything that corrupts shared state stops the run
//!   loop with [`Termination::Fatal`]
//!
//! The library logs through `log` and never installs a logger.

pub mod circuit_table;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod keys;
pub mod network;
pub mod protocol;

pub use circuit_table::{CircuitKey, CircuitState, CircuitTable, Direction, Lookup, Teardown};
pub use config::{BandwidthConfig, RelayConfig};
pub use descriptor::RelaySnapshot;
pub use dispatcher::RelayDispatcher;
pub use error::{ErrorCode, ErrorScope, RelayError, Result};
pub use keys::{KeyRotator, NewKeyDescriptor, RelayIdentity};
pub use network::{
    BoxedLinkStream, ConnectionId, ConnectionManager, LinkHandshaker, LinkParams,
    UnauthenticatedHandshaker,
};

use network::wait_closed;
use protocol::handshake::HandshakeResponder;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Longest gap between idle-circuit sweeps
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Why the run loop stopped
#[derive(Debug)]
pub enum Termination {
    /// [`OnionRouter::shutdown`] was called
    Shutdown,
    /// The dispatch path hit an error it cannot contain
    Fatal(RelayError),
}

/// A relay: identity, keys, circuits and the loop that serves them
pub struct OnionRouter {
    config: RelayConfig,
    identity: Arc<RelayIdentity>,
    keys: Arc<KeyRotator>,
    dispatcher: Arc<RelayDispatcher>,
    fatal: Mutex<Option<mpsc::UnboundedReceiver<RelayError>>>,
    shutdown: watch::Sender<bool>,
}

impl OnionRouter {
    /// Build a relay with a fresh identity and the plain-TCP handshaker
    pub fn new(config: RelayConfig) -> Result<Self> {
        let our_addrs = if config.address.is_unspecified() {
            Vec::new()
        } else {
            vec![config.address]
        };
        let handshaker = Arc::new(UnauthenticatedHandshaker::new(
            our_addrs,
            config.dial_timeout(),
        ));
        Self::with_parts(config, RelayIdentity::generate(), handshaker)
    }

    /// Build a relay around an existing identity and link handshaker
    pub fn with_parts(
        config: RelayConfig,
        identity: RelayIdentity,
        handshaker: Arc<dyn LinkHandshaker>,
    ) -> Result<Self> {
        config.validate()?;

        let identity = Arc::new(identity);
        let keys = Arc::new(KeyRotator::new(config.onion_key_overlap())?);
        let flow = config.flow_config();

        let table = Arc::new(CircuitTable::new(flow));
        let connections = Arc::new(ConnectionManager::new(
            handshaker,
            flow.connection_queue,
            config.write_timeout(),
            config.dial_timeout(),
        ));
        let responder = HandshakeResponder::new(Arc::clone(&keys), *identity.fingerprint());

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(RelayDispatcher::new(
            table,
            connections,
            responder,
            *identity.fingerprint(),
            *identity.ed25519_public().as_bytes(),
            &config,
            fatal_tx,
        ));
        let (shutdown, _) = watch::channel(false);

        log::info!(
            "🧅 Relay {} ({}) initialized",
            config.nickname,
            identity.fingerprint_hex()
        );

        Ok(Self {
            config,
            identity,
            keys,
            dispatcher,
            fatal: Mutex::new(Some(fatal_rx)),
            shutdown,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn identity(&self) -> &RelayIdentity {
        &self.identity
    }

    pub fn circuit_table(&self) -> &Arc<CircuitTable> {
        self.dispatcher.table()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.dispatcher.connections()
    }

    /// Bind the configured OR port and serve until shutdown or a fatal error
    pub async fn run(&self) -> Result<Termination> {
        let listener = TcpListener::bind((self.config.address, self.config.or_port)).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// Returns only on [`OnionRouter::shutdown`] or a fatal error; the caller
    /// treats anything but [`Termination::Shutdown`] as the process failing.
    pub async fn serve(&self, listener: TcpListener) -> Result<Termination> {
        let mut fatal = self
            .fatal
            .lock()
            .map_err(|_| RelayError::Internal("fatal channel lock poisoned".into()))?
            .take()
            .ok_or_else(|| RelayError::Internal("relay is already serving".into()))?;
        let mut shutdown = self.shutdown.subscribe();

        let idle_timeout = self.config.idle_circuit_timeout();
        let mut reaper = tokio::time::interval(idle_timeout.min(MAX_REAP_INTERVAL));
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::info!("Listening for OR connections on {}", listener.local_addr()?);

        let termination = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_accept(stream, peer),
                    Err(e) => log::warn!("Accept failed: {}", e),
                },
                _ = reaper.tick() => {
                    if let Err(e) = self.dispatcher.reap_idle(idle_timeout).await {
                        if e.is_fatal() {
                            break Termination::Fatal(e);
                        }
                        log::warn!("Idle sweep failed: {}", e);
                    }
                    if let Err(e) = self.keys.purge_expired() {
                        log::warn!("Onion key purge failed: {}", e);
                    }
                }
                Some(e) = fatal.recv() => break Termination::Fatal(e),
                _ = wait_closed(&mut shutdown) => break Termination::Shutdown,
            }
        };

        match &termination {
            Termination::Shutdown => log::info!("Relay shutting down"),
            Termination::Fatal(e) => log::error!("Relay stopping on fatal error: {}", e),
        }
        self.connections().close_all();
        Ok(termination)
    }

    fn spawn_accept(&self, stream: TcpStream, peer: SocketAddr) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let timeout = self.config.handshake_timeout();
        tokio::spawn(async move {
            match dispatcher.connections().accept(stream, peer, timeout).await {
                Ok((conn, reader)) => dispatcher.spawn_connection(conn, reader),
                Err(e) => log::debug!("Link handshake with {} failed: {}", peer, e),
            }
        });
    }

    /// Add a link some other transport already authenticated
    pub fn attach(&self, stream: BoxedLinkStream, params: LinkParams) -> ConnectionId {
        let (conn, reader) = self.connections().attach(stream, params);
        let id = conn.id();
        self.dispatcher.spawn_connection(conn, reader);
        id
    }

    /// Rotate the onion key; a failure leaves the current key in service
    pub fn rotate_keys(&self) -> Result<NewKeyDescriptor> {
        self.keys.rotate()
    }

    /// Current state for the descriptor publisher
    pub fn snapshot(&self) -> Result<RelaySnapshot> {
        RelaySnapshot::capture(
            &self.config,
            &self.identity,
            &self.keys,
            self.circuit_table().len(),
            self.connections().len(),
        )
    }

    /// Public half of the onion key CREATE2 handshakes currently use
    pub fn onion_key(&self) -> Result<[u8; 32]> {
        self.keys.current_public()
    }

    /// Ask the run loop to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for OnionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionRouter")
            .field("nickname", &self.config.nickname)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
