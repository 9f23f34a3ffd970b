//! # Clock and Timestamping
//!
//! Monotonic nanosecond time source plus the hardware-timestamping
//! capability probe. Every latency figure the engine produces is a
//! difference of two values from this module, so the rules are strict:
//!
//! - `monotonic_ns` is the single software time source. It reads
//!   `CLOCK_MONOTONIC` directly rather than going through `Instant` so the
//!   same raw value can be written into probe frames and compared against
//!   kernel- or NIC-provided timestamps.
//! - Hardware and software timestamps are never mixed inside one trial.
//!   The mode is selected once when the port opens and stays sticky for the
//!   trial lifetime.
//! - Latency is `max(0, rx_ns - tx_ns)`; samples where `rx_ns < tx_ns`
//!   (clock skew between NIC and host, or PHC steps) are dropped by the
//!   receiver, never negated.

use std::mem;

use nix::time::{clock_gettime, ClockId};

/// Current monotonic time in nanoseconds.
///
/// Reads `CLOCK_MONOTONIC`; the epoch is arbitrary (boot-relative on
/// Linux) but consistent for the process lifetime, which is all the
/// engine needs: every timestamp it compares comes from the same source.
#[inline]
pub fn monotonic_ns() -> u64 {
    // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid clock id.
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// Where frame timestamps come from for one trial.
///
/// Selection is sticky: the port picks a mode at open time and both the TX
/// and RX paths of the trial use it exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    /// TX timestamps from the NIC completion path, RX timestamps from the
    /// RX descriptor. Requires both capability bits.
    Hardware,
    /// Both timestamps from `monotonic_ns`, taken as close to the syscall
    /// as possible.
    Software,
}

impl std::fmt::Display for TimestampMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimestampMode::Hardware => write!(f, "hardware"),
            TimestampMode::Software => write!(f, "software"),
        }
    }
}

/// NIC timestamping capabilities as reported by ethtool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampCaps {
    pub tx_hw_ts_supported: bool,
    pub rx_hw_ts_supported: bool,
}

impl TimestampCaps {
    /// Hardware mode needs both directions; a half-capable NIC would force
    /// mixing HW and SW stamps inside one trial.
    pub fn hardware_usable(&self) -> bool {
        self.tx_hw_ts_supported && self.rx_hw_ts_supported
    }

    /// Pick the effective mode for a trial given the operator request.
    pub fn select_mode(&self, hw_requested: bool) -> TimestampMode {
        if hw_requested && self.hardware_usable() {
            TimestampMode::Hardware
        } else {
            TimestampMode::Software
        }
    }
}

// ethtool plumbing for ETHTOOL_GET_TS_INFO. The values are ABI constants
// from <linux/ethtool.h> / <linux/net_tstamp.h>.
const ETHTOOL_GET_TS_INFO: u32 = 0x0000_0041;
const SIOCETHTOOL: libc::c_ulong = 0x8946;
const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;

#[repr(C)]
#[allow(dead_code)]
struct EthtoolTsInfo {
    cmd: u32,
    so_timestamping: u32,
    phc_index: i32,
    tx_types: u32,
    tx_reserved: [u32; 3],
    rx_filters: u32,
    rx_reserved: [u32; 3],
}

/// Probe the NIC's hardware-timestamping capabilities.
///
/// Returns all-false (software only) when the interface does not answer the
/// ethtool query; the probe is best-effort and never fails a run on its own.
pub fn probe_timestamp_caps(interface: &str) -> TimestampCaps {
    // Any datagram socket works as an ioctl conduit.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return TimestampCaps::default();
    }

    let mut info: EthtoolTsInfo = unsafe { mem::zeroed() };
    info.cmd = ETHTOOL_GET_TS_INFO;

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(interface.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_data = &mut info as *mut EthtoolTsInfo as *mut libc::c_char;

    let rc = unsafe { libc::ioctl(fd, SIOCETHTOOL, &mut ifr) };
    unsafe { libc::close(fd) };

    if rc < 0 {
        return TimestampCaps::default();
    }

    TimestampCaps {
        tx_hw_ts_supported: info.so_timestamping & SOF_TIMESTAMPING_TX_HARDWARE != 0,
        rx_hw_ts_supported: info.so_timestamping & SOF_TIMESTAMPING_RX_HARDWARE != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_goes_backwards() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn mode_selection_is_conservative() {
        let none = TimestampCaps::default();
        assert_eq!(none.select_mode(true), TimestampMode::Software);

        let rx_only = TimestampCaps {
            tx_hw_ts_supported: false,
            rx_hw_ts_supported: true,
        };
        // Half-capable NICs would mix HW and SW stamps; refuse.
        assert_eq!(rx_only.select_mode(true), TimestampMode::Software);

        let both = TimestampCaps {
            tx_hw_ts_supported: true,
            rx_hw_ts_supported: true,
        };
        assert_eq!(both.select_mode(true), TimestampMode::Hardware);
        assert_eq!(both.select_mode(false), TimestampMode::Software);
    }

    #[test]
    fn probe_on_missing_interface_falls_back() {
        let caps = probe_timestamp_caps("definitely-not-a-nic0");
        assert!(!caps.hardware_usable());
    }
}
