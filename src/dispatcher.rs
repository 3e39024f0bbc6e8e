//! Relay dispatcher
//!
//! One worker task per connection reads cells in arrival order, looks each
//! one up in the [`CircuitTable`], applies the circuit's onion layer under the
//! circuit's lock, and queues the result on the connection the cell goes
//! out on. Outbound writes never happen under a circuit lock; they go through
//! each connection's bounded queue.
//!
//! Errors are contained at the narrowest scope that holds them:
//!
//! | scope      | effect                                        |
//! |------------|-----------------------------------------------|
//! | cell       | cell dropped and logged                        |
//! | circuit    | circuit destroyed with the error's reason      |
//! | connection | connection and every circuit on it torn down   |
//! | process    | reported on the fatal channel                  |

use crate::circuit_table::{
    Circuit, CircuitHandle, CircuitKey, CircuitTable, Direction, ExtendProgress, Lookup,
};
use crate::config::RelayConfig;
use crate::error::{ErrorScope, RelayError, Result};
use crate::network::{CellReader, Connection, ConnectionManager};
use crate::protocol::cell::{
    Cell, CellCommand, DestroyReason, EndReason, RelayCell, RelayCommand,
};
use crate::protocol::extend::{extended_reply, CreateBody, ExtendRequest};
use crate::protocol::flow_control::{CreditToken, QueueCredit};
use crate::protocol::handshake::{CreateRequest, HandshakeResponder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// RELAY_EARLY cells a circuit may receive from the client side
pub const MAX_RELAY_EARLY: u8 = 8;

/// RESOLVED answer: transient error, empty value, TTL 0
const RESOLVED_TRANSIENT_ERROR: [u8; 6] = [0xF0, 0, 0, 0, 0, 0];

/// Routes cells between connections and circuits
pub struct RelayDispatcher {
    table: Arc<CircuitTable>,
    connections: Arc<ConnectionManager>,
    responder: HandshakeResponder,
    identity: [u8; 20],
    ed_identity: [u8; 32],
    max_circuits_per_connection: usize,
    handshake_timeout: Duration,
    fatal: mpsc::UnboundedSender<RelayError>,
    next_attempt: AtomicU64,
}

impl RelayDispatcher {
    pub fn new(
        table: Arc<CircuitTable>,
        connections: Arc<ConnectionManager>,
        responder: HandshakeResponder,
        identity: [u8; 20],
        ed_identity: [u8; 32],
        config: &RelayConfig,
        fatal: mpsc::UnboundedSender<RelayError>,
    ) -> Self {
        Self {
            table,
            connections,
            responder,
            identity,
            ed_identity,
            max_circuits_per_connection: config.max_circuits_per_connection,
            handshake_timeout: config.handshake_timeout(),
            fatal,
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn table(&self) -> &Arc<CircuitTable> {
        &self.table
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Start the worker for a newly attached connection
    pub fn spawn_connection(self: &Arc<Self>, conn: Arc<Connection>, reader: CellReader) {
        let name = format!("{} worker", conn.id());
        let dispatcher = Arc::clone(self);
        let worker = tokio::spawn(async move { dispatcher.run_connection(conn, reader).await });
        self.supervise(worker, name);
    }

    /// Report a panicked task as fatal
    fn supervise(&self, task: JoinHandle<()>, name: String) {
        let fatal = self.fatal.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    log::error!("{} panicked", name);
                    let _ = fatal.send(RelayError::InvariantViolation(format!(
                        "{} panicked",
                        name
                    )));
                }
            }
        });
    }

    fn report_fatal(&self, error: RelayError) {
        log::error!("Dispatch failure: {}", error);
        let _ = self.fatal.send(error);
    }

    async fn run_connection(self: Arc<Self>, conn: Arc<Connection>, mut reader: CellReader) {
        let mut first = true;

        loop {
            let next = if first {
                first = false;
                tokio::time::timeout(self.handshake_timeout, reader.next_cell())
                    .await
                    .unwrap_or(Err(RelayError::Timeout))
            } else {
                reader.next_cell().await
            };

            let cell = match next {
                Ok(Some(cell)) => cell,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("{} dropped: {}", conn.id(), e);
                    break;
                }
            };
            log::trace!("{} <- {:?}", conn.id(), cell);

            if let Err(e) = self.handle_cell(&conn, cell).await {
                match e.scope() {
                    ErrorScope::Cell | ErrorScope::Circuit => {
                        log::warn!("{}: {}", conn.id(), e);
                    }
                    ErrorScope::Connection => {
                        log::warn!("{} closed on violation: {}", conn.id(), e);
                        break;
                    }
                    ErrorScope::Process => {
                        self.report_fatal(e);
                        break;
                    }
                }
            }
        }

        self.teardown_connection(&conn).await;
    }

    /// Remove a connection and destroy every circuit keyed to it
    async fn teardown_connection(&self, conn: &Connection) {
        self.connections.remove(conn.id());

        let circuits = match self.table.circuits_on(conn.id()) {
            Ok(circuits) => circuits,
            Err(e) => return self.report_fatal(e),
        };
        let count = circuits.len();

        for handle in circuits {
            let mut circuit = handle.lock().await;
            if let Err(e) = self.destroy_circuit(&mut circuit, DestroyReason::ChannelClosed, None) {
                return self.report_fatal(e);
            }
        }

        match self.table.forget_connection(conn.id()) {
            Ok(0) => {}
            Ok(late) => log::debug!("{} closed with {} late links", conn.id(), late),
            Err(e) => return self.report_fatal(e),
        }
        log::debug!("{} closed, {} circuits torn down", conn.id(), count);
    }

    async fn handle_cell(self: &Arc<Self>, conn: &Arc<Connection>, cell: Cell) -> Result<()> {
        if cell.command.is_circuit_bound() && cell.circuit_id == 0 {
            return Err(RelayError::UnknownCircuit { circuit_id: 0 });
        }

        match cell.command {
            CellCommand::Padding | CellCommand::PaddingNegotiate | CellCommand::Netinfo => Ok(()),
            CellCommand::Create | CellCommand::Create2 | CellCommand::CreateFast => {
                self.handle_create(conn, cell).await
            }
            CellCommand::Destroy => self.handle_destroy(conn, cell).await,
            CellCommand::Created
            | CellCommand::Created2
            | CellCommand::CreatedFast
            | CellCommand::Relay
            | CellCommand::RelayEarly => self.handle_circuit_cell(conn, cell).await,
            other => Err(RelayError::ProtocolViolation(format!(
                "{:?} after link negotiation",
                other
            ))),
        }
    }

    async fn handle_create(&self, conn: &Connection, cell: Cell) -> Result<()> {
        let key = CircuitKey::new(conn.id(), cell.circuit_id);

        if !conn.params().peer_may_use(cell.circuit_id) {
            log::warn!("{} uses an id from the wrong half of the space", key);
            return self.refuse(conn, cell.circuit_id, DestroyReason::Protocol).await;
        }
        if let Lookup::Found(..) = self.table.lookup(key)? {
            log::warn!("CREATE for existing circuit {} dropped", key);
            return Ok(());
        }
        if self.table.count_on(conn.id())? >= self.max_circuits_per_connection {
            log::warn!("{} is at its circuit limit", conn.id());
            return self
                .refuse(conn, cell.circuit_id, DestroyReason::ResourceLimit)
                .await;
        }

        let answered = CreateRequest::from_cell(&cell)
            .and_then(|request| self.responder.respond(cell.circuit_id, &request));
        let (reply, keys) = match answered {
            Ok(answered) => answered,
            Err(e) => {
                log::warn!("Handshake for {} failed: {}", key, e);
                return self.refuse(conn, cell.circuit_id, DestroyReason::Protocol).await;
            }
        };

        self.table.create(key, &keys)?;
        conn.send(reply).await
    }

    async fn refuse(&self, conn: &Connection, circuit_id: u32, reason: DestroyReason) -> Result<()> {
        conn.send(Cell::destroy(circuit_id, reason)).await
    }

    async fn handle_destroy(&self, conn: &Connection, cell: Cell) -> Result<()> {
        let key = CircuitKey::new(conn.id(), cell.circuit_id);
        let reason = cell.destroy_reason();

        match self.table.lookup(key)? {
            Lookup::Found(handle, direction) => {
                let mut circuit = handle.lock().await;
                if !holds_key(&circuit, key, direction) {
                    return Ok(());
                }
                log::debug!(
                    "DESTROY on {} ({})",
                    key,
                    DestroyReason::from_u8(reason).map_or("UNKNOWN", DestroyReason::name)
                );
                self.destroy_circuit(&mut circuit, DestroyReason::Destroyed, Some(key))
            }
            Lookup::RecentlyClosed => Ok(()),
            Lookup::NotFound => Err(RelayError::UnknownCircuit {
                circuit_id: cell.circuit_id,
            }),
        }
    }

    async fn handle_circuit_cell(self: &Arc<Self>, conn: &Connection, cell: Cell) -> Result<()> {
        let key = CircuitKey::new(conn.id(), cell.circuit_id);

        let (handle, direction) = match self.table.lookup(key)? {
            Lookup::Found(handle, direction) => (handle, direction),
            Lookup::RecentlyClosed => {
                log::trace!("Late {:?} for closed circuit {}", cell.command, key);
                return Ok(());
            }
            Lookup::NotFound => {
                return Err(RelayError::UnknownCircuit {
                    circuit_id: cell.circuit_id,
                })
            }
        };

        handle.touch();
        let mut circuit = handle.lock().await;
        if !holds_key(&circuit, key, direction) {
            return Ok(());
        }

        let result = self.circuit_cell(&handle, &mut circuit, direction, cell);
        self.settle(&mut circuit, result)
    }

    fn circuit_cell(
        self: &Arc<Self>,
        handle: &CircuitHandle,
        circuit: &mut Circuit,
        direction: Direction,
        cell: Cell,
    ) -> Result<()> {
        match (cell.command, direction) {
            (CellCommand::Created | CellCommand::Created2, Direction::Backward) => {
                self.handle_created(circuit, &cell)
            }
            (CellCommand::Relay | CellCommand::RelayEarly, Direction::Forward) => {
                self.relay_forward(handle, circuit, cell)
            }
            (CellCommand::Relay | CellCommand::RelayEarly, Direction::Backward) => {
                self.relay_backward(circuit, cell)
            }
            (command, _) => Err(RelayError::ProtocolViolation(format!(
                "{:?} on circuit {}",
                command, circuit.incoming
            ))),
        }
    }

    /// Apply the containment policy to a circuit-level result
    fn settle(&self, circuit: &mut Circuit, result: Result<()>) -> Result<()> {
        let Err(e) = result else {
            return Ok(());
        };

        match e.scope() {
            ErrorScope::Cell => {
                log::debug!("Dropped cell on {}: {}", circuit.incoming, e);
                Ok(())
            }
            ErrorScope::Circuit => {
                log::warn!("Destroying circuit {}: {}", circuit.incoming, e);
                self.destroy_circuit(circuit, e.destroy_reason(), None)
            }
            ErrorScope::Connection | ErrorScope::Process => Err(e),
        }
    }

    /// Destroy a circuit and send DESTROY on each leg except `skip`
    ///
    /// Only the caller that actually removed the circuit sends anything, so
    /// each leg sees at most one DESTROY.
    fn destroy_circuit(
        &self,
        circuit: &mut Circuit,
        reason: DestroyReason,
        skip: Option<CircuitKey>,
    ) -> Result<()> {
        let teardown = self.table.destroy(circuit)?;
        for (_, key) in teardown.legs() {
            if Some(key) != skip {
                self.deliver_destroy(key, reason);
            }
        }
        if !teardown.is_empty() {
            log::debug!("Circuit {} closed ({})", circuit.incoming, reason.name());
        }
        Ok(())
    }

    /// Queue a DESTROY without waiting, since callers hold the circuit lock
    ///
    /// On a full queue a separate task waits for room (bounded by the write
    /// timeout) after the lock is gone.
    fn deliver_destroy(&self, key: CircuitKey, reason: DestroyReason) {
        let Some(conn) = self.connections.get(key.conn) else {
            return;
        };
        match conn.try_send(Cell::destroy(key.id, reason), None) {
            Ok(()) => {}
            Err(RelayError::ResourceExhausted(_)) => {
                tokio::spawn(async move {
                    if let Err(e) = conn.send(Cell::destroy(key.id, reason)).await {
                        log::debug!("DESTROY for {} not delivered: {}", key, e);
                    }
                });
            }
            Err(e) => log::debug!("DESTROY for {} not delivered: {}", key, e),
        }
    }

    fn handle_created(&self, circuit: &mut Circuit, cell: &Cell) -> Result<()> {
        let ExtendProgress::AwaitingCreated { legacy } = circuit.extend else {
            return Err(RelayError::ProtocolViolation(format!(
                "{:?} on {} without a pending extend",
                cell.command, circuit.incoming
            )));
        };
        if legacy != (cell.command == CellCommand::Created) {
            return Err(RelayError::ProtocolViolation(format!(
                "{:?} does not answer the CREATE sent for {}",
                cell.command, circuit.incoming
            )));
        }

        let reply = extended_reply(cell)?;
        circuit.extend = ExtendProgress::Idle;
        log::debug!("Circuit {} extended", circuit.incoming);
        self.send_backward(circuit, reply)
    }

    fn relay_forward(
        self: &Arc<Self>,
        handle: &CircuitHandle,
        circuit: &mut Circuit,
        cell: Cell,
    ) -> Result<()> {
        let early = cell.command == CellCommand::RelayEarly;
        if early {
            circuit.relay_early_received = circuit.relay_early_received.saturating_add(1);
            if circuit.relay_early_received > MAX_RELAY_EARLY {
                return Err(RelayError::ProtocolViolation(format!(
                    "more than {} RELAY_EARLY cells",
                    MAX_RELAY_EARLY
                )));
            }
        }
        if circuit.extend != ExtendProgress::Idle {
            return Err(RelayError::ProtocolViolation(
                "relay cell while an extend is pending".into(),
            ));
        }

        let mut payload = cell.payload;
        if circuit.crypto.forward.peel(&mut payload) {
            let relay = RelayCell::from_payload(&payload)?;
            log::trace!("Recognized {:?} on {}", relay.command, circuit.incoming);
            return self.handle_recognized(handle, circuit, early, relay);
        }

        let Some(next) = circuit.outgoing else {
            return Err(RelayError::DigestMismatch);
        };
        let credit = take_credit(&circuit.forward_queue, next)?;
        self.forward(next, Cell::from_payload(next.id, cell.command, payload), credit)
    }

    fn relay_backward(&self, circuit: &mut Circuit, cell: Cell) -> Result<()> {
        if let ExtendProgress::AwaitingCreated { .. } = circuit.extend {
            return Err(RelayError::ProtocolViolation(format!(
                "{:?} from the next hop of {} before it answered CREATE",
                cell.command, circuit.incoming
            )));
        }
        if cell.command == CellCommand::RelayEarly {
            log::debug!("RELAY_EARLY from the next hop on {}", circuit.incoming);
        }
        let mut payload = cell.payload;
        circuit.crypto.backward.apply(&mut payload);

        let credit = take_credit(&circuit.backward_queue, circuit.incoming)?;
        self.forward(
            circuit.incoming,
            Cell::relay(circuit.incoming.id, payload),
            credit,
        )
    }

    /// Queue a relayed cell, holding the circuit's queue credit
    fn forward(&self, key: CircuitKey, cell: Cell, credit: CreditToken) -> Result<()> {
        let conn = self
            .connections
            .get(key.conn)
            .ok_or_else(|| RelayError::circuit_destroyed(DestroyReason::ChannelClosed as u8))?;
        conn.try_send(cell, Some(credit)).map_err(leg_error)
    }

    /// Seal a cell this hop originates and queue it toward the client
    ///
    /// Runs under the circuit lock, so it never waits for queue space: a full
    /// queue is a resource failure for this circuit.
    fn send_backward(&self, circuit: &mut Circuit, relay: RelayCell) -> Result<()> {
        let mut payload = relay.to_payload()?;
        circuit.crypto.backward.seal(&mut payload);

        let key = circuit.incoming;
        let conn = self
            .connections
            .get(key.conn)
            .ok_or_else(|| RelayError::circuit_destroyed(DestroyReason::ChannelClosed as u8))?;
        conn.try_send(Cell::relay(key.id, payload), None)
            .map_err(leg_error)
    }

    fn handle_recognized(
        self: &Arc<Self>,
        handle: &CircuitHandle,
        circuit: &mut Circuit,
        early: bool,
        relay: RelayCell,
    ) -> Result<()> {
        match relay.command {
            RelayCommand::Extend | RelayCommand::Extend2 => {
                if !early {
                    return Err(RelayError::ProtocolViolation(
                        "EXTEND outside RELAY_EARLY".into(),
                    ));
                }
                let request = ExtendRequest::parse(relay.command, &relay.data)?;
                self.begin_extend(handle, circuit, request)
            }
            RelayCommand::Begin => {
                circuit.mark_terminal();
                self.end_stream(circuit, relay.stream_id, EndReason::ExitPolicy)
            }
            RelayCommand::BeginDir => {
                circuit.mark_terminal();
                self.end_stream(circuit, relay.stream_id, EndReason::NotDirectory)
            }
            RelayCommand::Resolve => {
                circuit.mark_terminal();
                let answer = RelayCell::new(
                    RelayCommand::Resolved,
                    relay.stream_id,
                    RESOLVED_TRANSIENT_ERROR.to_vec(),
                )?;
                self.send_backward(circuit, answer)
            }
            RelayCommand::Data => {
                if relay.stream_id == 0 {
                    return Err(RelayError::ProtocolViolation("DATA on stream 0".into()));
                }
                circuit.mark_terminal();
                if circuit.windows.deliver.note_receive()? {
                    let sendme = RelayCell::new(RelayCommand::Sendme, 0, Vec::new())?;
                    self.send_backward(circuit, sendme)?;
                    circuit.windows.deliver.on_increment_signal();
                }
                Ok(())
            }
            RelayCommand::Sendme if relay.stream_id == 0 => {
                if !circuit.windows.package.on_increment_signal() {
                    return Err(RelayError::ProtocolViolation(
                        "circuit SENDME with a full package window".into(),
                    ));
                }
                Ok(())
            }
            RelayCommand::Sendme | RelayCommand::End | RelayCommand::Drop => Ok(()),
            RelayCommand::Truncate => self.truncate(circuit),
            RelayCommand::Extended
            | RelayCommand::Extended2
            | RelayCommand::Truncated
            | RelayCommand::Connected
            | RelayCommand::Resolved => Err(RelayError::ProtocolViolation(format!(
                "{:?} sent toward the exit",
                relay.command
            ))),
        }
    }

    fn end_stream(&self, circuit: &mut Circuit, stream_id: u16, reason: EndReason) -> Result<()> {
        let end = RelayCell::new(RelayCommand::End, stream_id, vec![reason as u8])?;
        self.send_backward(circuit, end)
    }

    fn truncate(&self, circuit: &mut Circuit) -> Result<()> {
        if let Some(next) = self.table.unlink_outgoing(circuit)? {
            self.deliver_destroy(next, DestroyReason::Requested);
        }
        let truncated = RelayCell::new(
            RelayCommand::Truncated,
            0,
            vec![DestroyReason::Requested as u8],
        )?;
        self.send_backward(circuit, truncated)
    }

    fn begin_extend(
        self: &Arc<Self>,
        handle: &CircuitHandle,
        circuit: &mut Circuit,
        request: ExtendRequest,
    ) -> Result<()> {
        if circuit.outgoing.is_some() || circuit.extend != ExtendProgress::Idle {
            return Err(RelayError::ProtocolViolation(format!(
                "circuit {} is already extended",
                circuit.incoming
            )));
        }
        if request.target.names(&self.identity, Some(&self.ed_identity)) {
            return Err(RelayError::ProtocolViolation(
                "extend back to this relay".into(),
            ));
        }
        let previous = self
            .connections
            .get(circuit.incoming.conn)
            .and_then(|conn| conn.params().peer_identity);
        if let Some(previous) = previous {
            if request.target.names(&previous, None) {
                return Err(RelayError::ProtocolViolation(
                    "extend back to the previous hop".into(),
                ));
            }
        }

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        circuit.extend = ExtendProgress::Dialing { attempt };
        log::debug!(
            "Extending {} toward {:?} ({:?})",
            circuit.incoming,
            request.target.addrs,
            request.create
        );

        let dispatcher = Arc::clone(self);
        let handle = handle.clone();
        let name = format!("extend of {}", circuit.incoming);
        let task = tokio::spawn(async move { dispatcher.finish_extend(handle, attempt, request).await });
        self.supervise(task, name);
        Ok(())
    }

    /// Dial without the circuit lock, then link the leg if the circuit is
    /// still waiting on this attempt
    async fn finish_extend(self: Arc<Self>, handle: CircuitHandle, attempt: u64, request: ExtendRequest) {
        let connected = match self.connections.connect(&request.target).await {
            Ok((conn, reader)) => {
                if let Some(reader) = reader {
                    self.spawn_connection(Arc::clone(&conn), reader);
                }
                Ok(conn)
            }
            Err(e) => Err(e),
        };

        let mut circuit = handle.lock().await;
        if circuit.extend != (ExtendProgress::Dialing { attempt }) || circuit.is_closed() {
            log::debug!("Extend of {} abandoned", circuit.incoming);
            return;
        }

        let linked = match connected {
            Ok(conn) => self.link_next_hop(&handle, &mut circuit, &conn, &request),
            Err(e) => Err(e),
        };
        let linked = linked.map_err(|e| {
            if e.is_fatal() {
                e
            } else {
                RelayError::ExtendFailed(e.to_string())
            }
        });

        if let Err(e) = self.settle(&mut circuit, linked) {
            self.report_fatal(e);
        }
    }

    fn link_next_hop(
        &self,
        handle: &CircuitHandle,
        circuit: &mut Circuit,
        conn: &Connection,
        request: &ExtendRequest,
    ) -> Result<()> {
        if conn.is_closed() {
            return Err(RelayError::ConnectionClosed(format!("{} is closed", conn.id())));
        }

        let id = self
            .table
            .extend_with_new_id(circuit, handle, conn.id(), conn.id_space())?;
        circuit.extend = ExtendProgress::AwaitingCreated {
            legacy: matches!(request.create, CreateBody::Tap { .. }),
        };
        conn.try_send(request.create.to_cell(id)?, None)
            .map_err(leg_error)
    }

    /// Destroy circuits idle for `timeout` and purge expired tombstones
    pub async fn reap_idle(&self, timeout: Duration) -> Result<usize> {
        let mut reaped = 0;
        for handle in self.table.idle_circuits(timeout)? {
            let mut circuit = handle.lock().await;
            if circuit.is_closed() || handle.idle_for() < timeout {
                continue;
            }
            self.destroy_circuit(&mut circuit, DestroyReason::Finished, None)?;
            reaped += 1;
        }

        let purged = self.table.purge_tombstones()?;
        if reaped > 0 || purged > 0 {
            log::debug!("Reaped {} idle circuits, purged {} tombstones", reaped, purged);
        }
        Ok(reaped)
    }
}

/// Whether `key` still names the leg the lookup found it under
fn holds_key(circuit: &Circuit, key: CircuitKey, direction: Direction) -> bool {
    if circuit.is_closed() {
        return false;
    }
    match direction {
        Direction::Forward => circuit.incoming == key,
        Direction::Backward => circuit.outgoing == Some(key),
    }
}

fn take_credit(
    queue: &QueueCredit,
    toward: CircuitKey,
) -> Result<CreditToken> {
    queue.try_acquire().ok_or_else(|| {
        RelayError::ResourceExhausted(format!("too many cells queued toward {}", toward))
    })
}

/// Send failures on a circuit's other leg are that circuit's problem
fn leg_error(e: RelayError) -> RelayError {
    match e {
        RelayError::ConnectionClosed(_) | RelayError::Timeout | RelayError::Network(_) => {
            RelayError::circuit_destroyed(DestroyReason::ChannelClosed as u8)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRotator;
    use crate::network::{BoxedLinkStream, LinkHandshaker, LinkParams};
    use crate::protocol::cell::{CellCodec, Decoded, LinkVersion};
    use crate::protocol::crypto::{CircuitKeys, LayerCipher};
    use crate::protocol::extend::ExtendTarget;
    use crate::protocol::flow_control::FlowConfig;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpStream;

    struct Unreachable;

    #[async_trait]
    impl LinkHandshaker for Unreachable {
        async fn accept(
            &self,
            _stream: TcpStream,
            _peer: SocketAddr,
        ) -> Result<(BoxedLinkStream, LinkParams)> {
            Err(RelayError::HandshakeFailed("unused".into()))
        }

        async fn dial(&self, _target: &ExtendTarget) -> Result<(BoxedLinkStream, LinkParams)> {
            Err(RelayError::ConnectionFailed("no route".into()))
        }
    }

    struct Harness {
        dispatcher: Arc<RelayDispatcher>,
        fatal: mpsc::UnboundedReceiver<RelayError>,
    }

    const OUR_ED25519: [u8; 32] = [0xBB; 32];

    fn harness(config: RelayConfig) -> Harness {
        harness_with_queue(config, 64)
    }

    fn harness_with_queue(config: RelayConfig, queue_depth: usize) -> Harness {
        let (fatal_tx, fatal) = mpsc::unbounded_channel();
        let keys = Arc::new(KeyRotator::new(Duration::from_secs(60)).unwrap());
        let table = Arc::new(CircuitTable::new(FlowConfig::default()));
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(Unreachable),
            queue_depth,
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let dispatcher = Arc::new(RelayDispatcher::new(
            table,
            connections,
            HandshakeResponder::new(keys, [0xAA; 20]),
            [0xAA; 20],
            OUR_ED25519,
            &config,
            fatal_tx,
        ));
        Harness { dispatcher, fatal }
    }

    struct Peer {
        stream: DuplexStream,
        codec: CellCodec,
    }

    impl Peer {
        async fn send(&mut self, cell: &Cell) {
            let bytes = self.codec.encode(cell).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn recv(&mut self) -> Cell {
            let mut buf = vec![0u8; self.codec.cell_size()];
            tokio::time::timeout(Duration::from_secs(5), self.stream.read_exact(&mut buf))
                .await
                .expect("no cell within 5s")
                .unwrap();
            match self.codec.decode(&buf) {
                Decoded::Cell(cell) => cell,
                other => panic!("relay sent garbage: {:?}", other),
            }
        }

        async fn closed(&mut self) -> bool {
            let mut buf = [0u8; 1];
            matches!(
                tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await,
                Ok(Ok(0)) | Ok(Err(_))
            )
        }
    }

    fn connect_client(h: &Harness) -> Peer {
        connect_peer(h, None, 256 * 1024)
    }

    /// Attach a link whose far end has `identity` and buffers `buffer` bytes
    fn connect_peer(h: &Harness, identity: Option<[u8; 20]>, buffer: usize) -> Peer {
        let (ours, theirs) = tokio::io::duplex(buffer);
        let params = LinkParams {
            peer_identity: identity,
            peer_addr: None,
            version: LinkVersion::V4,
            initiator: false,
        };
        let (conn, reader) = h.dispatcher.connections().attach(Box::pin(ours), params);
        h.dispatcher.spawn_connection(conn, reader);
        Peer {
            stream: theirs,
            codec: CellCodec::new(LinkVersion::V4),
        }
    }

    /// CREATE_FAST on `id`, returning the client's (forward, backward) layers
    async fn create_fast(peer: &mut Peer, id: u32) -> (LayerCipher, LayerCipher) {
        let x = [0x42u8; 20];
        peer.send(&Cell::new(id, CellCommand::CreateFast, &x).unwrap())
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply.command, CellCommand::CreatedFast);

        let mut y = [0u8; 20];
        y.copy_from_slice(&reply.payload[..20]);
        let (keys, kh) = CircuitKeys::from_create_fast(&x, &y).unwrap();
        assert_eq!(&reply.payload[20..40], &kh);
        (
            LayerCipher::new(&keys.forward_key, &keys.forward_digest),
            LayerCipher::new(&keys.backward_key, &keys.backward_digest),
        )
    }

    fn sealed(forward: &mut LayerCipher, id: u32, early: bool, relay: RelayCell) -> Cell {
        let mut payload = relay.to_payload().unwrap();
        forward.seal(&mut payload);
        let command = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        Cell::from_payload(id, command, payload)
    }

    fn opened(backward: &mut LayerCipher, cell: &Cell) -> RelayCell {
        let mut payload = cell.payload;
        assert!(backward.peel(&mut payload), "reply not recognized");
        RelayCell::from_payload(&payload).unwrap()
    }

    fn extend2_toward(target: ExtendTarget) -> RelayCell {
        let request = ExtendRequest {
            target,
            create: CreateBody::Create2 {
                htype: 2,
                hdata: vec![0; 84],
            },
        };
        RelayCell::new(RelayCommand::Extend2, 0, request.to_extend2_data().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_create_fast_then_begin_is_refused() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);
        let (mut forward, mut backward) = create_fast(&mut client, 7).await;

        let begin = RelayCell::new(RelayCommand::Begin, 3, b"example.com:80\0".to_vec()).unwrap();
        client.send(&sealed(&mut forward, 7, false, begin)).await;

        let reply = client.recv().await;
        assert_eq!(reply.circuit_id, 7);
        let end = opened(&mut backward, &reply);
        assert_eq!(end.command, RelayCommand::End);
        assert_eq!(end.stream_id, 3);
        assert_eq!(end.data, vec![EndReason::ExitPolicy as u8]);
    }

    #[tokio::test]
    async fn test_resolve_gets_transient_error() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);
        let (mut forward, mut backward) = create_fast(&mut client, 9).await;

        let resolve = RelayCell::new(RelayCommand::Resolve, 4, b"example.com\0".to_vec()).unwrap();
        client.send(&sealed(&mut forward, 9, false, resolve)).await;

        let answer = opened(&mut backward, &client.recv().await);
        assert_eq!(answer.command, RelayCommand::Resolved);
        assert_eq!(answer.data, RESOLVED_TRANSIENT_ERROR.to_vec());
    }

    #[tokio::test]
    async fn test_data_earns_sendme_every_hundred_cells() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);
        let (mut forward, mut backward) = create_fast(&mut client, 5).await;

        for _ in 0..100 {
            let data = RelayCell::new(RelayCommand::Data, 1, vec![0x55; 400]).unwrap();
            client.send(&sealed(&mut forward, 5, false, data)).await;
        }

        let sendme = opened(&mut backward, &client.recv().await);
        assert_eq!(sendme.command, RelayCommand::Sendme);
        assert_eq!(sendme.stream_id, 0);
    }

    #[tokio::test]
    async fn test_unrecognized_cell_on_last_hop_destroys_circuit() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);
        create_fast(&mut client, 7).await;

        let mut garbage = [0u8; crate::protocol::cell::PAYLOAD_SIZE];
        garbage[0] = 0x99;
        garbage[100] = 1;
        client.send(&Cell::relay(7, garbage)).await;

        let destroy = client.recv().await;
        assert_eq!(destroy.command, CellCommand::Destroy);
        assert_eq!(destroy.circuit_id, 7);
        assert_eq!(destroy.destroy_reason(), DestroyReason::Protocol as u8);
        assert!(h.dispatcher.table().is_empty());
    }

    #[tokio::test]
    async fn test_extend_needs_relay_early() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);
        let (mut forward, _) = create_fast(&mut client, 7).await;

        let extend2 = ExtendRequest {
            target: ExtendTarget {
                addrs: vec!["192.0.2.1:9001".parse().unwrap()],
                rsa_identity: Some([0x11; 20]),
                ed_identity: None,
            },
            create: CreateBody::Create2 {
                htype: 2,
                hdata: vec![0; 84],
            },
        };
        let relay = RelayCell::new(
            RelayCommand::Extend2,
            0,
            extend2.to_extend2_data().unwrap(),
        )
        .unwrap();
        client.send(&sealed(&mut forward, 7, false, relay)).await;

        let destroy = client.recv().await;
        assert_eq!(destroy.command, CellCommand::Destroy);
        assert_eq!(destroy.destroy_reason(), DestroyReason::Protocol as u8);
    }

    #[tokio::test]
    async fn test_failed_dial_destroys_with_connectfailed() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);
        let (mut forward, _) = create_fast(&mut client, 7).await;

        let extend2 = ExtendRequest {
            target: ExtendTarget {
                addrs: vec!["192.0.2.1:9001".parse().unwrap()],
                rsa_identity: Some([0x11; 20]),
                ed_identity: None,
            },
            create: CreateBody::Create2 {
                htype: 2,
                hdata: vec![0; 84],
            },
        };
        let relay = RelayCell::new(
            RelayCommand::Extend2,
            0,
            extend2.to_extend2_data().unwrap(),
        )
        .unwrap();
        client.send(&sealed(&mut forward, 7, true, relay)).await;

        let destroy = client.recv().await;
        assert_eq!(destroy.command, CellCommand::Destroy);
        assert_eq!(destroy.destroy_reason(), DestroyReason::ConnectFailed as u8);
    }

    #[tokio::test]
    async fn test_extend_to_own_ed25519_identity_is_refused() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);
        let (mut forward, _) = create_fast(&mut client, 7).await;

        let relay = extend2_toward(ExtendTarget {
            addrs: vec!["192.0.2.1:9001".parse().unwrap()],
            rsa_identity: None,
            ed_identity: Some(OUR_ED25519),
        });
        client.send(&sealed(&mut forward, 7, true, relay)).await;

        // Refused before any dial, so PROTOCOL rather than CONNECTFAILED
        let destroy = client.recv().await;
        assert_eq!(destroy.command, CellCommand::Destroy);
        assert_eq!(destroy.destroy_reason(), DestroyReason::Protocol as u8);
        assert!(h.dispatcher.table().is_empty());
    }

    #[tokio::test]
    async fn test_extend_back_to_previous_hop_is_refused() {
        let h = harness(RelayConfig::default());
        let previous = [0x22; 20];
        let mut relay_peer = connect_peer(&h, Some(previous), 256 * 1024);
        // An authenticated peer that initiated the link owns the high half
        let id = 0x8000_0007;
        let (mut forward, _) = create_fast(&mut relay_peer, id).await;

        let relay = extend2_toward(ExtendTarget {
            addrs: vec!["192.0.2.1:9001".parse().unwrap()],
            rsa_identity: Some(previous),
            ed_identity: None,
        });
        relay_peer.send(&sealed(&mut forward, id, true, relay)).await;

        let destroy = relay_peer.recv().await;
        assert_eq!(destroy.command, CellCommand::Destroy);
        assert_eq!(destroy.circuit_id, id);
        assert_eq!(destroy.destroy_reason(), DestroyReason::Protocol as u8);
        assert!(h.dispatcher.table().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_block_its_circuit() {
        let mut h = harness_with_queue(RelayConfig::default(), 1);
        // Room for about two cells in the pipe; the client stops reading
        let mut client = connect_peer(&h, None, 1024);
        let (mut forward, _) = create_fast(&mut client, 7).await;

        let flood = async {
            for stream_id in 1..=16 {
                let resolve =
                    RelayCell::new(RelayCommand::Resolve, stream_id, b"example.com\0".to_vec())
                        .unwrap();
                client.send(&sealed(&mut forward, 7, false, resolve)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), flood)
            .await
            .expect("relay stopped reading from a client it cannot write to");

        // The full queue costs the circuit, well inside the 5s write timeout
        let drained = async {
            while !h.dispatcher.table().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), drained)
            .await
            .expect("circuit still held behind a blocked write");
        assert!(h.fatal.try_recv().is_err());

        // Once the client reads again the DESTROY follows the queued answers
        let mut reason = None;
        for _ in 0..16 {
            let cell = client.recv().await;
            if cell.command == CellCommand::Destroy {
                reason = Some(cell.destroy_reason());
                break;
            }
            assert_eq!(cell.command, CellCommand::Relay);
        }
        assert_eq!(reason, Some(DestroyReason::ResourceLimit as u8));
    }

    #[tokio::test]
    async fn test_circuit_limit_answers_resourcelimit() {
        let config = RelayConfig {
            max_circuits_per_connection: 1,
            ..RelayConfig::default()
        };
        let h = harness(config);
        let mut client = connect_client(&h);
        create_fast(&mut client, 1).await;

        client
            .send(&Cell::new(2, CellCommand::CreateFast, &[1; 20]).unwrap())
            .await;
        let refused = client.recv().await;
        assert_eq!(refused.command, CellCommand::Destroy);
        assert_eq!(refused.circuit_id, 2);
        assert_eq!(refused.destroy_reason(), DestroyReason::ResourceLimit as u8);
        assert_eq!(h.dispatcher.table().len(), 1);
    }

    #[tokio::test]
    async fn test_tap_create_is_refused() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);

        client
            .send(&Cell::new(4, CellCommand::Create, &[7; 186]).unwrap())
            .await;
        let refused = client.recv().await;
        assert_eq!(refused.command, CellCommand::Destroy);
        assert_eq!(refused.destroy_reason(), DestroyReason::Protocol as u8);
        assert!(h.dispatcher.table().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_circuit_closes_connection() {
        let mut h = harness(RelayConfig::default());
        let mut client = connect_client(&h);

        let payload = [0u8; crate::protocol::cell::PAYLOAD_SIZE];
        client.send(&Cell::relay(77, payload)).await;

        assert!(client.closed().await);
        assert!(h.dispatcher.connections().is_empty());
        assert!(h.fatal.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_truncate_on_last_hop_answers_truncated() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);
        let (mut forward, mut backward) = create_fast(&mut client, 7).await;

        let truncate = RelayCell::new(RelayCommand::Truncate, 0, Vec::new()).unwrap();
        client.send(&sealed(&mut forward, 7, false, truncate)).await;

        let truncated = opened(&mut backward, &client.recv().await);
        assert_eq!(truncated.command, RelayCommand::Truncated);
        assert_eq!(truncated.data, vec![DestroyReason::Requested as u8]);
    }

    #[tokio::test]
    async fn test_reap_idle_sends_finished() {
        let h = harness(RelayConfig::default());
        let mut client = connect_client(&h);
        create_fast(&mut client, 7).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = h.dispatcher.reap_idle(Duration::from_millis(10)).await.unwrap();
        assert_eq!(reaped, 1);

        let destroy = client.recv().await;
        assert_eq!(destroy.command, CellCommand::Destroy);
        assert_eq!(destroy.destroy_reason(), DestroyReason::Finished as u8);
        assert!(h.dispatcher.table().is_empty());
    }
}
