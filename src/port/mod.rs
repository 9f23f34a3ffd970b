//! # Interface I/O
//!
//! Capability-driven port layer. A `PortPair` is one opened NIC (or the
//! in-process loopback simulator) split into independent TX and RX halves
//! so the sender and receiver threads never share a socket. The contract:
//!
//! - `send_batch` may send fewer frames than offered; the sender treats a
//!   short count as backpressure and retries the tail within the same
//!   pacing slot.
//! - `recv_batch` is non-blocking up to an absolute monotonic deadline and
//!   stamps each received frame with its RX timestamp (hardware when the
//!   port runs in hardware mode, `monotonic_ns` otherwise).
//! - Link speed is queried once at open. A driver reporting zero speed
//!   must be overridden with an explicit `line_rate_bps` or the open fails
//!   with `UnknownLineRate`.
//!
//! Two variants exist: the `AF_PACKET` raw socket (universal fallback,
//! needs CAP_NET_RAW) and the loopback DUT simulator used by self-test
//! mode and the integration suite. Interface names starting with
//! `loopback` select the simulator; everything else opens a raw socket.

use crate::clock::{TimestampCaps, TimestampMode};
use crate::error::{EngineError, Result};

pub mod loopback;
pub mod raw_socket;

pub use loopback::LoopbackProfile;

/// Largest frame the receive path must accommodate (9000-byte jumbo plus
/// header slack).
pub const MAX_FRAME_LEN: usize = 9216;

/// How a port should be opened.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub interface: String,
    /// Explicit line rate override; 0 means trust the driver.
    pub line_rate_bps: u64,
    /// Request hardware timestamping (falls back to software with a
    /// warning when unsupported).
    pub hw_timestamp: bool,
}

/// Link facts discovered at open time.
#[derive(Debug, Clone, Copy)]
pub struct LinkInfo {
    pub line_rate_bps: u64,
    pub mtu: usize,
    pub timestamping: TimestampCaps,
    /// Sticky timestamp mode for every trial run on this port.
    pub mode: TimestampMode,
}

/// One received frame slot; buffers are allocated once per trial and
/// reused for every `recv_batch` call.
pub struct RecvSlot {
    pub buf: Vec<u8>,
    pub len: usize,
    pub rx_ns: u64,
}

/// Reusable batch of receive slots.
pub struct RecvBatch {
    pub slots: Vec<RecvSlot>,
}

impl RecvBatch {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| RecvSlot {
                buf: vec![0u8; MAX_FRAME_LEN],
                len: 0,
                rx_ns: 0,
            })
            .collect();
        RecvBatch { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Transmit half of a port. Owned by the sender thread.
pub trait TxQueue: Send {
    /// Submit up to `frames.len()` frames; returns how many were accepted.
    /// A short count signals backpressure, not an error.
    fn send_batch(&mut self, frames: &[&[u8]]) -> Result<usize>;

    /// Harvest hardware TX timestamps from the completion path as
    /// `(seq, tx_ns)` pairs. No-op in software mode.
    fn poll_tx_timestamps(&mut self, _out: &mut Vec<(u32, u64)>) -> Result<()> {
        Ok(())
    }
}

/// Receive half of a port. Owned by the receiver thread.
pub trait RxQueue: Send {
    /// Fill up to `max` slots, waiting no later than the absolute
    /// monotonic `deadline_ns`. Returns the number of slots filled.
    fn recv_batch(&mut self, batch: &mut RecvBatch, max: usize, deadline_ns: u64) -> Result<usize>;
}

/// An opened port split into its two halves.
pub struct PortPair {
    pub tx: Box<dyn TxQueue>,
    pub rx: Box<dyn RxQueue>,
    pub link: LinkInfo,
}

/// Open the port named by the configuration.
///
/// Fails with `NicUnavailable`, `PermissionDenied`, `LinkDown` or
/// `UnknownLineRate` per the interface contract.
pub fn open(config: &PortConfig) -> Result<PortPair> {
    let pair = if config.interface.starts_with("loopback") {
        loopback::open(config)?
    } else {
        raw_socket::open(config)?
    };

    if pair.link.line_rate_bps == 0 {
        return Err(EngineError::UnknownLineRate(config.interface.clone()));
    }
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_opens_and_reports_a_line_rate() {
        let pair = open(&PortConfig {
            interface: "loopback".to_string(),
            line_rate_bps: 0,
            hw_timestamp: false,
        })
        .unwrap();
        assert!(pair.link.line_rate_bps > 0);
        assert_eq!(pair.link.mode, TimestampMode::Software);
    }

    #[test]
    fn explicit_line_rate_overrides_discovery() {
        let pair = open(&PortConfig {
            interface: "loopback".to_string(),
            line_rate_bps: 25_000_000,
            hw_timestamp: false,
        })
        .unwrap();
        assert_eq!(pair.link.line_rate_bps, 25_000_000);
    }
}
