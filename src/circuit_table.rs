//! Circuit table
//!
//! The authoritative map from (connection, circuit id) to circuit state.
//!
//! Every circuit has one slot, reachable under two keys: the incoming leg
//! (the connection it was created on) and, once extended, the outgoing leg.
//! Keys are sharded by connection, so a connection's whole index lives under
//! one shard lock and unrelated connections do not contend.
//!
//! Locking:
//! - A circuit's own mutex serializes create/extend/destroy and the crypto
//!   advance for that circuit.
//! - Shard locks are short, synchronous, and never held across an await.
//! - The order is always circuit lock, then shard lock.
//!
//! Closed keys stay behind as tombstones for a while so late cells for a
//! circuit that was just destroyed are told apart from cells for circuits
//! that never existed.

use crate::error::{RelayError, Result};
use crate::network::{CircuitIdSpace, ConnectionId};
use crate::protocol::crypto::{CircuitCrypto, CircuitKeys};
use crate::protocol::flow_control::{CircuitWindows, FlowConfig, QueueCredit};
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

const SHARDS: usize = 32;

/// How long a closed key keeps absorbing late cells
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// Attempts at a random outgoing id before giving up on a connection
const ID_ALLOCATION_ATTEMPTS: usize = 64;

/// A circuit id scoped to the connection it lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub conn: ConnectionId,
    pub id: u32,
}

impl CircuitKey {
    pub fn new(conn: ConnectionId, id: u32) -> Self {
        Self { conn, id }
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.conn, self.id)
    }
}

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Only the incoming leg is known
    HalfOpen,
    /// Linked to a next hop, or terminating here
    Open,
    /// Teardown in progress
    Closing,
    /// Gone from the table
    Closed,
}

/// Which leg a cell arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the client side (the incoming leg), heading away from the client
    Forward,
    /// From the next hop (the outgoing leg), heading back to the client
    Backward,
}

/// Where an EXTEND stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendProgress {
    Idle,
    /// Connecting to the next hop; `attempt` identifies the dial task
    Dialing { attempt: u64 },
    /// CREATE sent, waiting for CREATED (`legacy`) or CREATED2
    AwaitingCreated { legacy: bool },
}

/// This relay's hop of one circuit
pub struct Circuit {
    pub(crate) serial: u64,
    pub(crate) incoming: CircuitKey,
    pub(crate) outgoing: Option<CircuitKey>,
    pub(crate) state: CircuitState,
    pub(crate) crypto: CircuitCrypto,
    pub(crate) windows: CircuitWindows,
    /// Queue credit for cells heading to the next hop
    pub(crate) forward_queue: QueueCredit,
    /// Queue credit for cells heading back to the client
    pub(crate) backward_queue: QueueCredit,
    pub(crate) extend: ExtendProgress,
    pub(crate) relay_early_received: u8,
}

impl Circuit {
    fn new(serial: u64, incoming: CircuitKey, keys: &CircuitKeys, flow: &FlowConfig) -> Self {
        Self {
            serial,
            incoming,
            outgoing: None,
            state: CircuitState::HalfOpen,
            crypto: CircuitCrypto::new(keys),
            windows: CircuitWindows::new(flow),
            forward_queue: QueueCredit::new(flow.queued_cells_per_circuit),
            backward_queue: QueueCredit::new(flow.queued_cells_per_circuit),
            extend: ExtendProgress::Idle,
            relay_early_received: 0,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn incoming(&self) -> CircuitKey {
        self.incoming
    }

    pub fn outgoing(&self) -> Option<CircuitKey> {
        self.outgoing
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, CircuitState::Closing | CircuitState::Closed)
    }

    pub fn extend_progress(&self) -> ExtendProgress {
        self.extend
    }

    /// The leg on the other side of `direction`'s arrival leg
    pub fn far_leg(&self, arrived: Direction) -> Option<CircuitKey> {
        match arrived {
            Direction::Forward => self.outgoing,
            Direction::Backward => Some(self.incoming),
        }
    }

    /// Half-open circuit that turned out to end here
    pub(crate) fn mark_terminal(&mut self) {
        if self.state == CircuitState::HalfOpen {
            log::debug!("Circuit {} terminates at this hop", self.incoming);
            self.state = CircuitState::Open;
        }
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("serial", &self.serial)
            .field("incoming", &self.incoming)
            .field("outgoing", &self.outgoing)
            .field("state", &self.state)
            .field("extend", &self.extend)
            .finish_non_exhaustive()
    }
}

struct CircuitSlot {
    serial: u64,
    circuit: Mutex<Circuit>,
    created: Instant,
    /// Milliseconds after `created` of the last cell
    last_activity_ms: AtomicU64,
}

/// Shared reference to one circuit's slot
#[derive(Clone)]
pub struct CircuitHandle(Arc<CircuitSlot>);

impl CircuitHandle {
    /// Take the circuit's exclusive lock
    pub async fn lock(&self) -> MutexGuard<'_, Circuit> {
        self.0.circuit.lock().await
    }

    pub fn serial(&self) -> u64 {
        self.0.serial
    }

    /// Record traffic for idle reaping
    pub fn touch(&self) {
        let elapsed = self.0.created.elapsed().as_millis() as u64;
        self.0.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.0.last_activity_ms.load(Ordering::Relaxed));
        self.0.created.elapsed().saturating_sub(last)
    }
}

impl fmt::Debug for CircuitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CircuitHandle(#{})", self.0.serial)
    }
}

/// Result of looking up a key
#[derive(Debug, Clone)]
pub enum Lookup {
    Found(CircuitHandle, Direction),
    /// The key belonged to a circuit destroyed within the tombstone window
    RecentlyClosed,
    NotFound,
}

impl Lookup {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound)
    }
}

/// Keys a destroy removed; each one is owed a DESTROY
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub incoming: Option<CircuitKey>,
    pub outgoing: Option<CircuitKey>,
}

impl Teardown {
    pub fn legs(&self) -> impl Iterator<Item = (Direction, CircuitKey)> {
        let incoming = self.incoming.map(|k| (Direction::Forward, k));
        let outgoing = self.outgoing.map(|k| (Direction::Backward, k));
        incoming.into_iter().chain(outgoing)
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_none() && self.outgoing.is_none()
    }
}

enum Entry {
    /// `direction` is the one cells arriving under this key travel
    Live {
        handle: CircuitHandle,
        direction: Direction,
    },
    Tombstone { expires: Instant },
}

type Shard = HashMap<ConnectionId, HashMap<u32, Entry>>;

/// Every circuit this relay carries
pub struct CircuitTable {
    shards: Box<[RwLock<Shard>]>,
    flow: FlowConfig,
    tombstone_ttl: Duration,
    next_serial: AtomicU64,
    live: AtomicUsize,
}

impl CircuitTable {
    pub fn new(flow: FlowConfig) -> Self {
        Self::with_tombstone_ttl(flow, TOMBSTONE_TTL)
    }

    pub fn with_tombstone_ttl(flow: FlowConfig, tombstone_ttl: Duration) -> Self {
        let shards = (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            flow,
            tombstone_ttl,
            next_serial: AtomicU64::new(1),
            live: AtomicUsize::new(0),
        }
    }

    pub fn flow(&self) -> &FlowConfig {
        &self.flow
    }

    /// Find the circuit a cell on `key` belongs to
    pub fn lookup(&self, key: CircuitKey) -> Result<Lookup> {
        let shard = self.read(key.conn)?;
        let found = match shard.get(&key.conn).and_then(|ids| ids.get(&key.id)) {
            Some(Entry::Live { handle, direction }) => Lookup::Found(handle.clone(), *direction),
            Some(Entry::Tombstone { expires }) if *expires > Instant::now() => {
                Lookup::RecentlyClosed
            }
            _ => Lookup::NotFound,
        };
        Ok(found)
    }

    /// Register a half-open circuit under its incoming key
    pub fn create(&self, incoming: CircuitKey, keys: &CircuitKeys) -> Result<CircuitHandle> {
        if incoming.id == 0 {
            return Err(RelayError::ProtocolViolation(
                "circuit id 0 is reserved".into(),
            ));
        }

        let mut shard = self.write(incoming.conn)?;
        let ids = shard.entry(incoming.conn).or_default();
        if let Some(Entry::Live { .. }) = ids.get(&incoming.id) {
            return Err(RelayError::ProtocolViolation(format!(
                "circuit {} already exists",
                incoming
            )));
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let handle = CircuitHandle(Arc::new(CircuitSlot {
            serial,
            circuit: Mutex::new(Circuit::new(serial, incoming, keys, &self.flow)),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }));

        ids.insert(
            incoming.id,
            Entry::Live {
                handle: handle.clone(),
                direction: Direction::Forward,
            },
        );
        self.live.fetch_add(1, Ordering::Relaxed);

        log::debug!("Circuit {} created (#{})", incoming, serial);
        Ok(handle)
    }

    /// Link the outgoing leg under a key the caller chose
    ///
    /// `circuit` must be the locked circuit behind `handle`.
    pub fn extend(
        &self,
        circuit: &mut Circuit,
        handle: &CircuitHandle,
        outgoing: CircuitKey,
    ) -> Result<()> {
        self.check_extendable(circuit, handle)?;
        if outgoing == circuit.incoming {
            return Err(RelayError::InvariantViolation(format!(
                "circuit {} linked to itself",
                outgoing
            )));
        }

        let mut shard = self.write(outgoing.conn)?;
        let ids = shard.entry(outgoing.conn).or_default();
        if let Some(Entry::Live { .. }) = ids.get(&outgoing.id) {
            return Err(RelayError::InvariantViolation(format!(
                "outgoing key {} already belongs to a circuit",
                outgoing
            )));
        }
        ids.insert(
            outgoing.id,
            Entry::Live {
                handle: handle.clone(),
                direction: Direction::Backward,
            },
        );
        drop(shard);

        self.linked(circuit, outgoing);
        Ok(())
    }

    /// Link the outgoing leg under a fresh id from our half of `conn`'s space
    pub fn extend_with_new_id(
        &self,
        circuit: &mut Circuit,
        handle: &CircuitHandle,
        conn: ConnectionId,
        space: CircuitIdSpace,
    ) -> Result<u32> {
        self.check_extendable(circuit, handle)?;

        let mut shard = self.write(conn)?;
        let ids = shard.entry(conn).or_default();
        let mut rng = OsRng;
        let mut chosen = None;
        for _ in 0..ID_ALLOCATION_ATTEMPTS {
            let id = space.random_id(&mut rng);
            // Tombstoned ids are skipped too; the peer may still send on them
            if !ids.contains_key(&id) && CircuitKey::new(conn, id) != circuit.incoming {
                chosen = Some(id);
                break;
            }
        }
        let id = chosen.ok_or_else(|| {
            RelayError::ResourceExhausted(format!("no free circuit id on {}", conn))
        })?;

        ids.insert(
            id,
            Entry::Live {
                handle: handle.clone(),
                direction: Direction::Backward,
            },
        );
        drop(shard);

        self.linked(circuit, CircuitKey::new(conn, id));
        Ok(id)
    }

    fn check_extendable(&self, circuit: &Circuit, handle: &CircuitHandle) -> Result<()> {
        if handle.serial() != circuit.serial {
            return Err(RelayError::InvariantViolation(format!(
                "handle #{} does not own circuit #{}",
                handle.serial(),
                circuit.serial
            )));
        }
        if circuit.is_closed() {
            return Err(RelayError::CircuitClosed(format!(
                "circuit {} is closing",
                circuit.incoming
            )));
        }
        if let Some(existing) = circuit.outgoing {
            return Err(RelayError::ProtocolViolation(format!(
                "circuit {} already extended to {}",
                circuit.incoming, existing
            )));
        }
        Ok(())
    }

    fn linked(&self, circuit: &mut Circuit, outgoing: CircuitKey) {
        circuit.outgoing = Some(outgoing);
        circuit.state = CircuitState::Open;
        log::debug!("Circuit {} extended to {}", circuit.incoming, outgoing);
    }

    /// Drop the outgoing leg (TRUNCATE) and return to half-open
    pub fn unlink_outgoing(&self, circuit: &mut Circuit) -> Result<Option<CircuitKey>> {
        let Some(outgoing) = circuit.outgoing.take() else {
            return Ok(None);
        };
        circuit.extend = ExtendProgress::Idle;
        if circuit.state == CircuitState::Open {
            circuit.state = CircuitState::HalfOpen;
        }
        self.retire(outgoing, circuit.serial)?;
        log::debug!("Circuit {} truncated at {}", circuit.incoming, outgoing);
        Ok(Some(outgoing))
    }

    /// Remove both of the circuit's keys
    ///
    /// Idempotent: a circuit already closed yields an empty [`Teardown`], so
    /// racing destroyers agree on who propagates.
    pub fn destroy(&self, circuit: &mut Circuit) -> Result<Teardown> {
        if circuit.state == CircuitState::Closed {
            return Ok(Teardown::default());
        }
        circuit.state = CircuitState::Closing;
        circuit.extend = ExtendProgress::Idle;

        let outgoing = circuit.outgoing.take();
        let retired_in = self.retire(circuit.incoming, circuit.serial);
        let retired_out = outgoing.map(|key| self.retire(key, circuit.serial));

        circuit.state = CircuitState::Closed;
        self.live.fetch_sub(1, Ordering::Relaxed);

        retired_in?;
        if let Some(retired) = retired_out {
            retired?;
        }

        log::debug!("Circuit {} destroyed (#{})", circuit.incoming, circuit.serial);
        Ok(Teardown {
            incoming: Some(circuit.incoming),
            outgoing,
        })
    }

    /// Replace a live key with a tombstone
    fn retire(&self, key: CircuitKey, serial: u64) -> Result<()> {
        let lost = || {
            RelayError::InvariantViolation(format!("circuit #{} lost its key {}", serial, key))
        };

        let mut shard = self.write(key.conn)?;
        let entry = shard
            .get_mut(&key.conn)
            .and_then(|ids| ids.get_mut(&key.id))
            .ok_or_else(lost)?;
        let owner = match entry {
            Entry::Live { handle, .. } => handle.serial(),
            Entry::Tombstone { .. } => return Err(lost()),
        };
        if owner != serial {
            return Err(RelayError::InvariantViolation(format!(
                "key {} points at circuit #{}, expected #{}",
                key, owner, serial
            )));
        }

        *entry = Entry::Tombstone {
            expires: Instant::now() + self.tombstone_ttl,
        };
        Ok(())
    }

    /// Every live circuit with a leg on `conn`
    pub fn circuits_on(&self, conn: ConnectionId) -> Result<Vec<CircuitHandle>> {
        let shard = self.read(conn)?;
        let mut handles: Vec<CircuitHandle> = shard
            .get(&conn)
            .into_iter()
            .flat_map(|ids| ids.values())
            .filter_map(|entry| match entry {
                Entry::Live { handle, .. } => Some(handle.clone()),
                Entry::Tombstone { .. } => None,
            })
            .collect();
        handles.sort_by_key(CircuitHandle::serial);
        handles.dedup_by_key(|h| h.serial());
        Ok(handles)
    }

    /// Circuits the peer on `conn` created
    pub fn count_on(&self, conn: ConnectionId) -> Result<usize> {
        let shard = self.read(conn)?;
        Ok(shard
            .get(&conn)
            .map(|ids| {
                ids.values()
                    .filter(|entry| {
                        matches!(
                            entry,
                            Entry::Live {
                                direction: Direction::Forward,
                                ..
                            }
                        )
                    })
                    .count()
            })
            .unwrap_or(0))
    }

    /// Circuits with no traffic for at least `timeout`
    pub fn idle_circuits(&self, timeout: Duration) -> Result<Vec<CircuitHandle>> {
        let mut idle = Vec::new();
        for lock in self.shards.iter() {
            let shard = lock.read().map_err(|_| poisoned())?;
            for entry in shard.values().flat_map(|ids| ids.values()) {
                if let Entry::Live {
                    handle,
                    direction: Direction::Forward,
                } = entry
                {
                    if handle.idle_for() >= timeout {
                        idle.push(handle.clone());
                    }
                }
            }
        }
        Ok(idle)
    }

    /// Drop expired tombstones, returning how many went
    pub fn purge_tombstones(&self) -> Result<usize> {
        let now = Instant::now();
        let mut purged = 0;
        for lock in self.shards.iter() {
            let mut shard = lock.write().map_err(|_| poisoned())?;
            for ids in shard.values_mut() {
                let before = ids.len();
                ids.retain(|_, entry| match entry {
                    Entry::Tombstone { expires } => *expires > now,
                    Entry::Live { .. } => true,
                });
                purged += before - ids.len();
            }
            shard.retain(|_, ids| !ids.is_empty());
        }
        Ok(purged)
    }

    /// Forget a closed connection's tombstones
    ///
    /// Returns how many live keys still reference it; the caller destroys
    /// those circuits first, so anything nonzero is a circuit that linked to
    /// the connection while it was going down.
    pub fn forget_connection(&self, conn: ConnectionId) -> Result<usize> {
        let mut shard = self.write(conn)?;
        let Some(ids) = shard.get_mut(&conn) else {
            return Ok(0);
        };
        ids.retain(|_, entry| matches!(entry, Entry::Live { .. }));
        let remaining = ids.len();
        if remaining == 0 {
            shard.remove(&conn);
        }
        Ok(remaining)
    }

    /// Live circuits
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, conn: ConnectionId) -> &RwLock<Shard> {
        &self.shards[(conn.0 % SHARDS as u64) as usize]
    }

    // A poisoned shard may hold a half-applied mutation; nothing read from it
    // can be trusted.
    fn read(&self, conn: ConnectionId) -> Result<RwLockReadGuard<'_, Shard>> {
        self.shard(conn).read().map_err(|_| poisoned())
    }

    fn write(&self, conn: ConnectionId) -> Result<RwLockWriteGuard<'_, Shard>> {
        self.shard(conn).write().map_err(|_| poisoned())
    }
}

impl fmt::Debug for CircuitTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitTable")
            .field("live", &self.len())
            .finish_non_exhaustive()
    }
}

fn poisoned() -> RelayError {
    RelayError::InvariantViolation("circuit table shard poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::LinkVersion;

    const X: ConnectionId = ConnectionId(1);
    const Y: ConnectionId = ConnectionId(2);

    fn keys() -> CircuitKeys {
        CircuitKeys::derive_from_secret(&[3u8; 32]).unwrap()
    }

    fn table() -> CircuitTable {
        CircuitTable::new(FlowConfig::default())
    }

    fn found(lookup: Lookup) -> (CircuitHandle, Direction) {
        match lookup {
            Lookup::Found(handle, direction) => (handle, direction),
            other => panic!("expected a circuit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_then_lookup() {
        let table = table();
        let handle = table.create(CircuitKey::new(X, 7), &keys()).unwrap();

        let (found_handle, direction) = found(table.lookup(CircuitKey::new(X, 7)).unwrap());
        assert_eq!(found_handle.serial(), handle.serial());
        assert_eq!(direction, Direction::Forward);
        assert_eq!(handle.lock().await.state(), CircuitState::HalfOpen);

        // Ids are scoped per connection
        assert!(table.lookup(CircuitKey::new(Y, 7)).unwrap().is_not_found());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_zero_and_duplicates() {
        let table = table();
        assert!(matches!(
            table.create(CircuitKey::new(X, 0), &keys()),
            Err(RelayError::ProtocolViolation(_))
        ));

        table.create(CircuitKey::new(X, 7), &keys()).unwrap();
        assert!(matches!(
            table.create(CircuitKey::new(X, 7), &keys()),
            Err(RelayError::ProtocolViolation(_))
        ));
        table.create(CircuitKey::new(Y, 7), &keys()).unwrap();
    }

    #[tokio::test]
    async fn test_extend_links_both_keys() {
        let table = table();
        let handle = table.create(CircuitKey::new(X, 7), &keys()).unwrap();
        let mut circuit = handle.lock().await;

        table
            .extend(&mut circuit, &handle, CircuitKey::new(Y, 3))
            .unwrap();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.outgoing(), Some(CircuitKey::new(Y, 3)));

        let (back, direction) = found(table.lookup(CircuitKey::new(Y, 3)).unwrap());
        assert_eq!(back.serial(), handle.serial());
        assert_eq!(direction, Direction::Backward);

        // Linking twice fails
        assert!(matches!(
            table.extend(&mut circuit, &handle, CircuitKey::new(Y, 4)),
            Err(RelayError::ProtocolViolation(_))
        ));
        assert!(table.lookup(CircuitKey::new(Y, 4)).unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_extend_refuses_self_link_and_taken_keys() {
        let table = table();
        let a = table.create(CircuitKey::new(X, 7), &keys()).unwrap();
        let b = table.create(CircuitKey::new(Y, 9), &keys()).unwrap();

        let mut circuit = a.lock().await;
        assert!(matches!(
            table.extend(&mut circuit, &a, CircuitKey::new(X, 7)),
            Err(RelayError::InvariantViolation(_))
        ));
        assert!(matches!(
            table.extend(&mut circuit, &a, CircuitKey::new(Y, 9)),
            Err(RelayError::InvariantViolation(_))
        ));
        // The wrong handle is caught too
        assert!(matches!(
            table.extend(&mut circuit, &b, CircuitKey::new(Y, 10)),
            Err(RelayError::InvariantViolation(_))
        ));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_removes_both_keys() {
        let table = table();
        let handle = table.create(CircuitKey::new(X, 7), &keys()).unwrap();
        let mut circuit = handle.lock().await;
        table
            .extend(&mut circuit, &handle, CircuitKey::new(Y, 3))
            .unwrap();

        let first = table.destroy(&mut circuit).unwrap();
        assert_eq!(first.incoming, Some(CircuitKey::new(X, 7)));
        assert_eq!(first.outgoing, Some(CircuitKey::new(Y, 3)));
        assert_eq!(circuit.state(), CircuitState::Closed);

        let second = table.destroy(&mut circuit).unwrap();
        assert!(second.is_empty());
        assert!(table.is_empty());

        for key in [CircuitKey::new(X, 7), CircuitKey::new(Y, 3)] {
            assert!(matches!(table.lookup(key).unwrap(), Lookup::RecentlyClosed));
        }
    }

    #[tokio::test]
    async fn test_tombstones_expire() {
        let table = CircuitTable::with_tombstone_ttl(FlowConfig::default(), Duration::ZERO);
        let handle = table.create(CircuitKey::new(X, 7), &keys()).unwrap();
        table.destroy(&mut *handle.lock().await).unwrap();

        assert!(table.lookup(CircuitKey::new(X, 7)).unwrap().is_not_found());
        assert_eq!(table.purge_tombstones().unwrap(), 1);

        // The id is free again
        table.create(CircuitKey::new(X, 7), &keys()).unwrap();
    }

    #[tokio::test]
    async fn test_closed_circuit_cannot_extend() {
        let table = table();
        let handle = table.create(CircuitKey::new(X, 7), &keys()).unwrap();
        let mut circuit = handle.lock().await;
        table.destroy(&mut circuit).unwrap();

        assert!(matches!(
            table.extend(&mut circuit, &handle, CircuitKey::new(Y, 3)),
            Err(RelayError::CircuitClosed(_))
        ));
        assert!(table.lookup(CircuitKey::new(Y, 3)).unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_new_ids_come_from_our_half() {
        let table = table();
        let space = CircuitIdSpace {
            version: LinkVersion::V4,
            initiator: true,
        };

        for n in 1..=50u32 {
            let handle = table.create(CircuitKey::new(X, n), &keys()).unwrap();
            let mut circuit = handle.lock().await;
            let id = table
                .extend_with_new_id(&mut circuit, &handle, Y, space)
                .unwrap();
            assert!(space.contains(id));
            assert_eq!(circuit.outgoing(), Some(CircuitKey::new(Y, id)));
        }
        assert_eq!(table.circuits_on(Y).unwrap().len(), 50);
        assert_eq!(table.count_on(Y).unwrap(), 0);
        assert_eq!(table.count_on(X).unwrap(), 50);
    }

    #[tokio::test]
    async fn test_unlink_outgoing_returns_to_half_open() {
        let table = table();
        let handle = table.create(CircuitKey::new(X, 7), &keys()).unwrap();
        let mut circuit = handle.lock().await;
        table
            .extend(&mut circuit, &handle, CircuitKey::new(Y, 3))
            .unwrap();

        let dropped = table.unlink_outgoing(&mut circuit).unwrap();
        assert_eq!(dropped, Some(CircuitKey::new(Y, 3)));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert!(matches!(
            table.lookup(CircuitKey::new(Y, 3)).unwrap(),
            Lookup::RecentlyClosed
        ));

        // And it can be extended again
        table
            .extend(&mut circuit, &handle, CircuitKey::new(Y, 5))
            .unwrap();
    }

    #[tokio::test]
    async fn test_forget_connection_keeps_live_keys() {
        let table = table();
        let a = table.create(CircuitKey::new(X, 1), &keys()).unwrap();
        table.create(CircuitKey::new(X, 2), &keys()).unwrap();
        table.destroy(&mut *a.lock().await).unwrap();

        assert_eq!(table.forget_connection(X).unwrap(), 1);
        assert!(table.lookup(CircuitKey::new(X, 1)).unwrap().is_not_found());
        assert_eq!(table.circuits_on(X).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_circuits() {
        let table = table();
        let quiet = table.create(CircuitKey::new(X, 1), &keys()).unwrap();
        let busy = table.create(CircuitKey::new(X, 2), &keys()).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        busy.touch();

        let idle = table.idle_circuits(Duration::from_millis(20)).unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].serial(), quiet.serial());
    }
}
