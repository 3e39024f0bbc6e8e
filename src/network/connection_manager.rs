//! Connection manager
//!
//! Tracks every live link, indexes relay links by identity so EXTENDs reuse
//! them, and runs one writer task per link.
//!
//! Each connection has a bounded outbound queue. Circuit code only ever
//! enqueues, so no circuit lock is held across a socket write; the writer
//! task batches what is queued, writes it under a timeout, and then drops
//! the cells' queue credit.

use super::{BoxedLinkStream, CircuitIdSpace, ConnectionId, LinkHandshaker, LinkParams};
use crate::error::{RelayError, Result};
use crate::protocol::cell::{Cell, CellCodec, Decoded};
use crate::protocol::extend::ExtendTarget;
use crate::protocol::flow_control::CreditToken;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Cells written in one batch before the writer yields
const MAX_WRITE_BATCH: usize = 32;

/// A cell waiting for the wire, with the queue credit it holds
struct Outbound {
    cell: Cell,
    _credit: Option<CreditToken>,
}

/// One authenticated link
pub struct Connection {
    id: ConnectionId,
    params: LinkParams,
    outbound: mpsc::Sender<Outbound>,
    closed: watch::Sender<bool>,
    send_timeout: Duration,
    opened_at: Instant,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn params(&self) -> &LinkParams {
        &self.params
    }

    /// Ids this relay allocates when it creates circuits on the link
    pub fn id_space(&self) -> CircuitIdSpace {
        self.params.id_space()
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Queue a cell without waiting
    ///
    /// Relayed cells use this path: a full queue is backpressure, reported as
    /// [`RelayError::ResourceExhausted`].
    pub fn try_send(&self, cell: Cell, credit: Option<CreditToken>) -> Result<()> {
        self.outbound
            .try_send(Outbound {
                cell,
                _credit: credit,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    RelayError::ResourceExhausted(format!("{} outbound queue full", self.id))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    RelayError::ConnectionClosed(format!("{} is closed", self.id))
                }
            })
    }

    /// Queue a control cell, waiting a bounded time for space
    pub async fn send(&self, cell: Cell) -> Result<()> {
        let queued = tokio::time::timeout(
            self.send_timeout,
            self.outbound.send(Outbound {
                cell,
                _credit: None,
            }),
        )
        .await?;
        queued.map_err(|_| RelayError::ConnectionClosed(format!("{} is closed", self.id)))
    }

    /// Signal the reader and writer to stop
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            log::debug!("Closing {}", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.outbound.is_closed()
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        wait_closed(&mut self.closed.subscribe()).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Reading half of a link, owned by that link's dispatcher worker
pub struct CellReader {
    id: ConnectionId,
    reader: ReadHalf<BoxedLinkStream>,
    codec: CellCodec,
    buf: Vec<u8>,
    closed: watch::Receiver<bool>,
}

impl CellReader {
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Next cell, or `None` once the peer hung up or the link was closed
    pub async fn next_cell(&mut self) -> Result<Option<Cell>> {
        let size = self.codec.cell_size();
        let mut filled = 0;

        while filled < size {
            let read = tokio::select! {
                _ = wait_closed(&mut self.closed) => return Ok(None),
                read = self.reader.read(&mut self.buf[filled..size]) => read?,
            };
            if read == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(RelayError::ConnectionClosed(format!(
                    "{} ended inside a cell",
                    self.id
                )));
            }
            filled += read;
        }

        match self.codec.decode(&self.buf[..size]) {
            Decoded::Cell(cell) => Ok(Some(cell)),
            Decoded::Malformed(reason) => Err(RelayError::MalformedCell(reason)),
            Decoded::NeedMoreData(_) => Err(RelayError::Internal("short cell buffer".into())),
        }
    }
}

/// Every live link, by id and by peer identity
pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    by_identity: RwLock<HashMap<[u8; 20], ConnectionId>>,
    next_id: AtomicU64,
    handshaker: Arc<dyn LinkHandshaker>,
    queue_depth: usize,
    write_timeout: Duration,
    dial_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(
        handshaker: Arc<dyn LinkHandshaker>,
        queue_depth: usize,
        write_timeout: Duration,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            by_identity: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handshaker,
            queue_depth: queue_depth.max(1),
            write_timeout,
            dial_timeout,
        }
    }

    /// Register an authenticated link and start its writer
    pub fn attach(
        &self,
        stream: BoxedLinkStream,
        params: LinkParams,
    ) -> (Arc<Connection>, CellReader) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let codec = CellCodec::new(params.version);
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_depth);
        let (closed_tx, closed_rx) = watch::channel(false);

        let connection = Arc::new(Connection {
            id,
            params,
            outbound: outbound_tx,
            closed: closed_tx,
            send_timeout: self.write_timeout,
            opened_at: Instant::now(),
        });

        tokio::spawn(write_loop(
            Arc::clone(&connection),
            writer,
            codec,
            outbound_rx,
            closed_rx.clone(),
            self.write_timeout,
        ));

        write(&self.connections).insert(id, Arc::clone(&connection));
        if let Some(identity) = connection.params.peer_identity {
            write(&self.by_identity).insert(identity, id);
        }

        log::info!(
            "🔗 {} attached ({}, peer {}, {})",
            id,
            connection.params.version,
            connection
                .params
                .peer_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".into()),
            connection
                .params
                .peer_identity
                .map(hex::encode_upper)
                .unwrap_or_else(|| "unauthenticated".into())
        );

        let reader = CellReader {
            id,
            reader,
            codec,
            buf: vec![0u8; codec.cell_size()],
            closed: closed_rx,
        };
        (connection, reader)
    }

    /// Handshake an inbound TCP connection and register it
    pub async fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        handshake_timeout: Duration,
    ) -> Result<(Arc<Connection>, CellReader)> {
        let (stream, params) =
            tokio::time::timeout(handshake_timeout, self.handshaker.accept(stream, peer)).await??;
        Ok(self.attach(stream, params))
    }

    /// Link to an EXTEND target, reusing an existing link to the same identity
    ///
    /// Returns a reader only for a new link; the caller starts its worker.
    pub async fn connect(
        &self,
        target: &ExtendTarget,
    ) -> Result<(Arc<Connection>, Option<CellReader>)> {
        if let Some(existing) = target.rsa_identity.and_then(|id| self.by_identity(&id)) {
            log::debug!("Reusing {} for extend", existing.id());
            return Ok((existing, None));
        }

        let (stream, params) =
            tokio::time::timeout(self.dial_timeout, self.handshaker.dial(target)).await??;

        if let (Some(wanted), Some(got)) = (target.rsa_identity, params.peer_identity) {
            if wanted != got {
                return Err(RelayError::ExtendFailed(format!(
                    "dialed relay is {} not {}",
                    hex::encode_upper(got),
                    hex::encode_upper(wanted)
                )));
            }
        }

        let (connection, reader) = self.attach(stream, params);
        Ok((connection, Some(reader)))
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        read(&self.connections).get(&id).cloned()
    }

    /// Open link to a relay identity, if any
    pub fn by_identity(&self, identity: &[u8; 20]) -> Option<Arc<Connection>> {
        let id = *read(&self.by_identity).get(identity)?;
        self.get(id).filter(|conn| !conn.is_closed())
    }

    /// Close a connection and forget it
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = write(&self.connections).remove(&id)?;
        removed.close();
        if let Some(identity) = removed.params.peer_identity {
            let mut by_identity = write(&self.by_identity);
            if by_identity.get(&identity) == Some(&id) {
                by_identity.remove(&identity);
            }
        }
        Some(removed)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        read(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every connection
    pub fn close_all(&self) {
        let all: Vec<Arc<Connection>> = read(&self.connections).values().cloned().collect();
        for conn in all {
            conn.close();
        }
    }
}

async fn write_loop(
    connection: Arc<Connection>,
    mut writer: WriteHalf<BoxedLinkStream>,
    codec: CellCodec,
    mut outbound: mpsc::Receiver<Outbound>,
    mut closed: watch::Receiver<bool>,
    write_timeout: Duration,
) {
    let mut buf = Vec::with_capacity(codec.cell_size() * MAX_WRITE_BATCH);
    let mut batch: Vec<Outbound> = Vec::with_capacity(MAX_WRITE_BATCH);

    loop {
        let first = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            next = outbound.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        batch.push(first);
        while batch.len() < MAX_WRITE_BATCH {
            match outbound.try_recv() {
                Ok(next) => batch.push(next),
                Err(_) => break,
            }
        }

        buf.clear();
        for queued in &batch {
            if let Err(e) = codec.encode_into(&queued.cell, &mut buf) {
                log::error!("{} dropping unencodable cell: {}", connection.id, e);
            }
        }

        let written = tokio::time::timeout(write_timeout, async {
            writer.write_all(&buf).await?;
            writer.flush().await
        })
        .await;

        log::trace!("{} wrote {} cells", connection.id, batch.len());
        // Dropping the batch returns each cell's queue credit
        batch.clear();

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("{} write failed: {}", connection.id, e);
                break;
            }
            Err(_) => {
                log::warn!("{} write timed out", connection.id);
                break;
            }
        }
    }

    connection.close();
    outbound.close();
    // Queued cells are discarded; their credit goes back with them
    while outbound.try_recv().is_ok() {}
    let _ = writer.shutdown().await;
}

/// Resolve once the close flag is set (or its sender is gone)
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

// Connection maps hold no invariants a panic could break halfway.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
