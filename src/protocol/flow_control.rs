//! Tor SENDME Flow Control
//!
//! Implements the relay side of Tor's window-based flow control.
//!
//! ## How It Works:
//!
//! 1. **Windows:** Each circuit has credit counters per direction
//! 2. **Decrement:** A window decrements on each cell sent or received
//! 3. **SENDME:** After `increment` cells are received, a SENDME is sent
//! 4. **Increment:** Receiving SENDME restores credit, capped at the maximum
//!
//! ## Window Values (from Tor spec):
//!
//! - **Initial window:** 1000 cells (circuit)
//! - **Increment:** 100 cells per SENDME (circuit)
//!
//! A relay mostly forwards cells it cannot read, so on top of the SENDME
//! windows every circuit direction carries a [`QueueCredit`]: the number of
//! cells it may have sitting in an outbound connection queue. That bound is
//! what keeps one busy circuit from growing this relay's memory without limit.

use crate::config::BandwidthConfig;
use crate::error::{RelayError, Result};
use crate::protocol::cell::Cell;
use std::sync::{Arc, Mutex, MutexGuard};

/// Circuit window start (Tor spec: 1000 cells)
pub const CIRCWINDOW_START: u32 = 1000;

/// Window increment per SENDME (Tor spec: 100 cells)
pub const CIRCWINDOW_INCREMENT: u32 = 100;

/// Bounds for the per-connection outbound queue
pub const MIN_CONNECTION_QUEUE: usize = 64;
pub const MAX_CONNECTION_QUEUE: usize = 4096;

/// Integer credit bounded by a configured maximum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    credit: u32,
    max: u32,
    increment: u32,
}

impl Window {
    /// Create a window starting at its maximum
    pub fn new(max: u32, increment: u32) -> Self {
        Self {
            credit: max,
            max,
            increment,
        }
    }

    /// Remaining credit
    pub fn credit(&self) -> u32 {
        self.credit
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.credit == 0
    }

    /// Spend one credit if available
    pub fn admit_send(&mut self) -> bool {
        if self.credit == 0 {
            return false;
        }
        self.credit -= 1;
        true
    }

    /// Account for a cell received from a peer
    ///
    /// Returns `true` when enough cells have arrived that an increment signal
    /// (SENDME) is owed to the sender. The caller sends it and then calls
    /// [`Window::on_increment_signal`]. A peer that sends past zero credit has
    /// ignored our windows.
    pub fn note_receive(&mut self) -> Result<bool> {
        if self.credit == 0 {
            return Err(RelayError::ProtocolViolation(
                "peer sent past the flow-control window".into(),
            ));
        }
        self.credit -= 1;
        Ok(self.max - self.credit >= self.increment)
    }

    /// Restore one increment of credit, never above the maximum
    ///
    /// Returns `false` if the window was already full, which for a SENDME from
    /// a peer means it acknowledged cells that were never sent.
    pub fn on_increment_signal(&mut self) -> bool {
        let was_full = self.credit >= self.max;
        self.credit = self.credit.saturating_add(self.increment).min(self.max);
        !was_full
    }
}

/// Flow-control sizing, derived from the relay's bandwidth configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    /// SENDME window maximum
    pub circuit_window: u32,
    /// SENDME window increment
    pub circuit_increment: u32,
    /// Cells one circuit direction may have queued for the wire
    pub queued_cells_per_circuit: u32,
    /// Depth of each connection's outbound queue
    pub connection_queue: usize,
}

impl FlowConfig {
    /// Size the queues from the relay's bandwidth parameters
    ///
    /// The connection queue holds a tenth of a burst-second of cells, clamped
    /// so tiny configurations still make progress and large ones do not
    /// reserve unbounded memory per peer.
    pub fn from_bandwidth(bandwidth: &BandwidthConfig, queued_cells_per_circuit: u32) -> Self {
        let burst_cells = bandwidth.burst / Cell::SIZE as u64;
        let connection_queue = (burst_cells / 10)
            .clamp(MIN_CONNECTION_QUEUE as u64, MAX_CONNECTION_QUEUE as u64)
            as usize;

        Self {
            circuit_window: CIRCWINDOW_START,
            circuit_increment: CIRCWINDOW_INCREMENT,
            queued_cells_per_circuit,
            connection_queue,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            circuit_window: CIRCWINDOW_START,
            circuit_increment: CIRCWINDOW_INCREMENT,
            queued_cells_per_circuit: CIRCWINDOW_START,
            connection_queue: 1024,
        }
    }
}

/// Per-direction SENDME windows of a circuit terminating at this hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitWindows {
    /// Relay DATA cells this hop may still accept from the client
    pub deliver: Window,
    /// Relay DATA cells this hop may still originate toward the client
    pub package: Window,
}

impl CircuitWindows {
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            deliver: Window::new(config.circuit_window, config.circuit_increment),
            package: Window::new(config.circuit_window, config.circuit_increment),
        }
    }
}

/// Credit for cells a circuit direction has waiting in an outbound queue
///
/// Lives outside the circuit lock so the connection writer can return credit
/// without touching circuit state.
#[derive(Debug, Clone)]
pub struct QueueCredit {
    window: Arc<Mutex<Window>>,
}

impl QueueCredit {
    pub fn new(max: u32) -> Self {
        Self {
            window: Arc::new(Mutex::new(Window::new(max, 1))),
        }
    }

    /// Take one credit, or `None` if the direction has too much queued
    pub fn try_acquire(&self) -> Option<CreditToken> {
        if lock(&self.window).admit_send() {
            Some(CreditToken {
                window: Arc::clone(&self.window),
            })
        } else {
            None
        }
    }

    /// Credit currently available
    pub fn available(&self) -> u32 {
        lock(&self.window).credit()
    }
}

/// One queued cell's worth of credit; dropping it returns the credit
#[derive(Debug)]
pub struct CreditToken {
    window: Arc<Mutex<Window>>,
}

impl Drop for CreditToken {
    fn drop(&mut self) {
        lock(&self.window).on_increment_signal();
    }
}

// A poisoned window still holds a consistent credit count.
fn lock(window: &Mutex<Window>) -> MutexGuard<'_, Window> {
    window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
