//! # AF_PACKET Port
//!
//! The universal fallback port: one raw packet socket per direction bound
//! to the same interface, non-blocking, with large kernel buffers. The TX
//! socket is created with protocol 0 so it never receives, the RX socket
//! binds `ETH_P_ALL` and sees every frame on the interface (the signature
//! check in the receiver discards non-probe traffic).
//!
//! Hardware timestamping, when requested and supported, is enabled with
//! `SIOCSHWTSTAMP` plus `SO_TIMESTAMPING` on both sockets: RX timestamps
//! arrive as `SCM_TIMESTAMPING` control messages, TX timestamps are
//! harvested from the socket error queue where the kernel loops the sent
//! frame back together with its NIC completion timestamp (the sequence
//! number is recovered from the looped frame itself). In software mode
//! both stamps come from `monotonic_ns` taken beside the syscall.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use super::{LinkInfo, PortConfig, PortPair, RecvBatch, RxQueue, TxQueue};
use crate::clock::{monotonic_ns, probe_timestamp_caps, TimestampMode};
use crate::error::{EngineError, Result};
use crate::frame;

const SIOCGIFMTU: libc::c_ulong = 0x8921;
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
const SIOCETHTOOL: libc::c_ulong = 0x8946;
const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;

const ETHTOOL_GSET: u32 = 0x0000_0001;
const SPEED_UNKNOWN16: u32 = 0xffff;
const SPEED_UNKNOWN32: u32 = 0xffff_ffff;

const HWTSTAMP_TX_ON: libc::c_int = 1;
const HWTSTAMP_FILTER_ALL: libc::c_int = 1;

const SOF_TIMESTAMPING_TX_HARDWARE: libc::c_uint = 1 << 0;
const SOF_TIMESTAMPING_RX_HARDWARE: libc::c_uint = 1 << 2;
const SOF_TIMESTAMPING_RAW_HARDWARE: libc::c_uint = 1 << 6;

/// Kernel socket buffer target; large enough to ride out scheduler gaps
/// at 10 Gb/s line rates.
const SOCKET_BUF_BYTES: usize = 4 * 1024 * 1024;

#[repr(C)]
#[allow(dead_code)]
struct EthtoolCmd {
    cmd: u32,
    supported: u32,
    advertising: u32,
    speed: u16,
    duplex: u8,
    port: u8,
    phy_address: u8,
    transceiver: u8,
    autoneg: u8,
    mdio_support: u8,
    maxtxpkt: u32,
    maxrxpkt: u32,
    speed_hi: u16,
    eth_tp_mdix: u8,
    eth_tp_mdix_ctrl: u8,
    lp_advertising: u32,
    reserved: [u32; 2],
}

#[repr(C)]
#[allow(dead_code)]
struct HwtstampConfig {
    flags: libc::c_int,
    tx_type: libc::c_int,
    rx_filter: libc::c_int,
}

/// Open the interface as a raw-socket port pair.
pub fn open(config: &PortConfig) -> Result<PortPair> {
    let iface = &config.interface;
    let ifindex = interface_index(iface)?;

    let flags = interface_flags(iface)?;
    if (flags & libc::IFF_RUNNING as i16) == 0 {
        return Err(EngineError::LinkDown(iface.clone()));
    }

    let caps = probe_timestamp_caps(iface);
    let mode = caps.select_mode(config.hw_timestamp);
    if config.hw_timestamp && mode == TimestampMode::Software {
        warn!(
            "hardware timestamping requested but {} supports tx={} rx={}; using software clock",
            iface, caps.tx_hw_ts_supported, caps.rx_hw_ts_supported
        );
    }

    // Protocol 0 keeps the TX socket deaf; the RX socket hears everything.
    let tx_sock = packet_socket(iface, ifindex, 0)?;
    let rx_sock = packet_socket(iface, ifindex, (libc::ETH_P_ALL as u16).to_be())?;

    if mode == TimestampMode::Hardware {
        enable_hw_timestamping(iface, &tx_sock, &rx_sock)?;
        debug!("hardware timestamping enabled on {iface}");
    }

    let discovered = link_speed_bps(iface);
    let line_rate_bps = if config.line_rate_bps != 0 {
        config.line_rate_bps
    } else {
        discovered
    };

    let link = LinkInfo {
        line_rate_bps,
        mtu: interface_mtu(iface).unwrap_or(1500),
        timestamping: caps,
        mode,
    };
    debug!(
        "opened {iface}: line_rate={}bps mtu={} timestamps={}",
        link.line_rate_bps, link.mtu, link.mode
    );

    Ok(PortPair {
        tx: Box::new(RawTx {
            socket: tx_sock,
            hardware: mode == TimestampMode::Hardware,
            err_buf: vec![0u8; super::MAX_FRAME_LEN],
            cmsg_buf: vec![0u8; 512],
        }),
        rx: Box::new(RawRx {
            socket: rx_sock,
            hardware: mode == TimestampMode::Hardware,
            cmsg_buf: vec![0u8; 512],
        }),
        link,
    })
}

/// Transmit half over a dedicated AF_PACKET socket.
struct RawTx {
    socket: Socket,
    hardware: bool,
    err_buf: Vec<u8>,
    cmsg_buf: Vec<u8>,
}

impl TxQueue for RawTx {
    fn send_batch(&mut self, frames: &[&[u8]]) -> Result<usize> {
        let mut sent = 0;
        for frame in frames {
            match self.socket.send(frame) {
                Ok(_) => sent += 1,
                Err(e) if is_backpressure(&e) => break,
                Err(e) => return Err(map_io("send", &e)),
            }
        }
        Ok(sent)
    }

    fn poll_tx_timestamps(&mut self, out: &mut Vec<(u32, u64)>) -> Result<()> {
        if !self.hardware {
            return Ok(());
        }
        loop {
            let mut iov = libc::iovec {
                iov_base: self.err_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: self.err_buf.len(),
            };
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = self.cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = self.cmsg_buf.len();

            let n = unsafe {
                libc::recvmsg(
                    self.socket.as_raw_fd(),
                    &mut msg,
                    libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if is_backpressure(&err) {
                    return Ok(());
                }
                return Err(map_io("tx timestamp harvest", &err));
            }

            // The error queue loops the original frame back; the sequence
            // number identifies which probe the timestamp belongs to.
            let looped = &self.err_buf[..n as usize];
            if let Some(ts_ns) = timestamping_cmsg(&msg) {
                if frame::is_valid_response(looped) {
                    out.push((frame::seq_of(looped), ts_ns));
                }
            }
        }
    }
}

/// Receive half over a dedicated AF_PACKET socket.
struct RawRx {
    socket: Socket,
    hardware: bool,
    cmsg_buf: Vec<u8>,
}

impl RxQueue for RawRx {
    fn recv_batch(&mut self, batch: &mut RecvBatch, max: usize, deadline_ns: u64) -> Result<usize> {
        let max = max.min(batch.capacity());
        loop {
            let mut filled = 0;
            while filled < max {
                match self.recv_one(&mut batch.slots[filled]) {
                    Ok(true) => filled += 1,
                    Ok(false) => break,
                    Err(e) => return Err(e),
                }
            }
            if filled > 0 {
                return Ok(filled);
            }

            let now = monotonic_ns();
            if now >= deadline_ns {
                return Ok(0);
            }
            let wait_ms = ((deadline_ns - now) / 1_000_000).max(1) as i32;
            let mut pfd = libc::pollfd {
                fd: self.socket.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, wait_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(map_io("poll", &err));
            }
            if rc == 0 {
                return Ok(0);
            }
        }
    }
}

impl RawRx {
    /// Pull one frame if immediately available. Outgoing frames looped to
    /// the packet socket are dropped here: counting our own TX as RX would
    /// fabricate a zero-loss DUT. In hardware mode the RX timestamp comes
    /// from the descriptor's control message; a frame the NIC failed to
    /// stamp gets `rx_ns = 0` and the receiver counts it without producing
    /// a latency sample (modes are never mixed).
    fn recv_one(&mut self, slot: &mut super::RecvSlot) -> Result<bool> {
        loop {
            let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
            let mut iov = libc::iovec {
                iov_base: slot.buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: slot.buf.len(),
            };
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_name = &mut addr as *mut libc::sockaddr_ll as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            if self.hardware {
                msg.msg_control = self.cmsg_buf.as_mut_ptr() as *mut libc::c_void;
                msg.msg_controllen = self.cmsg_buf.len();
            }

            let n =
                unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, libc::MSG_DONTWAIT) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if is_backpressure(&err) {
                    return Ok(false);
                }
                return Err(map_io("recv", &err));
            }
            if addr.sll_pkttype == libc::PACKET_OUTGOING as u8 {
                continue;
            }
            slot.len = n as usize;
            slot.rx_ns = if self.hardware {
                timestamping_cmsg(&msg).unwrap_or(0)
            } else {
                monotonic_ns()
            };
            return Ok(true);
        }
    }
}

/// Create and bind a non-blocking AF_PACKET socket.
fn packet_socket(iface: &str, ifindex: i32, protocol_be: u16) -> Result<Socket> {
    let socket = Socket::new(
        Domain::PACKET,
        Type::RAW,
        Some(Protocol::from(protocol_be as i32)),
    )
    .map_err(|e| map_io(&format!("socket({iface})"), &e))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| map_io("set_nonblocking", &e))?;
    let _ = socket.set_send_buffer_size(SOCKET_BUF_BYTES);
    let _ = socket.set_recv_buffer_size(SOCKET_BUF_BYTES);

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    {
        let sll = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll;
        unsafe {
            (*sll).sll_family = libc::AF_PACKET as libc::sa_family_t;
            (*sll).sll_protocol = protocol_be;
            (*sll).sll_ifindex = ifindex;
        }
    }
    let addr = unsafe {
        SockAddr::new(
            storage,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    socket
        .bind(&addr)
        .map_err(|e| map_io(&format!("bind({iface})"), &e))?;
    Ok(socket)
}

/// Switch the NIC into hardware-timestamping mode and subscribe both
/// sockets to the timestamp streams.
fn enable_hw_timestamping(iface: &str, tx: &Socket, rx: &Socket) -> Result<()> {
    let mut cfg = HwtstampConfig {
        flags: 0,
        tx_type: HWTSTAMP_TX_ON,
        rx_filter: HWTSTAMP_FILTER_ALL,
    };
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(iface.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_data = &mut cfg as *mut HwtstampConfig as *mut libc::c_char;
    let rc = unsafe { libc::ioctl(rx.as_raw_fd(), SIOCSHWTSTAMP, &mut ifr) };
    if rc < 0 {
        return Err(map_io("SIOCSHWTSTAMP", &io::Error::last_os_error()));
    }

    let flags: libc::c_uint = SOF_TIMESTAMPING_TX_HARDWARE
        | SOF_TIMESTAMPING_RX_HARDWARE
        | SOF_TIMESTAMPING_RAW_HARDWARE;
    for sock in [tx, rx] {
        let rc = unsafe {
            libc::setsockopt(
                sock.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_TIMESTAMPING,
                &flags as *const libc::c_uint as *const libc::c_void,
                mem::size_of::<libc::c_uint>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(map_io("SO_TIMESTAMPING", &io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Extract the raw-hardware timestamp from an `SCM_TIMESTAMPING` control
/// message, if present and nonzero.
fn timestamping_cmsg(msg: &libc::msghdr) -> Option<u64> {
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMPING {
            // scm_timestamping: [software, deprecated, raw hardware].
            let data = unsafe { libc::CMSG_DATA(cmsg) } as *const libc::timespec;
            let raw_hw = unsafe { *data.add(2) };
            let ns = raw_hw.tv_sec as u64 * 1_000_000_000 + raw_hw.tv_nsec as u64;
            if ns != 0 {
                return Some(ns);
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    None
}

fn interface_index(iface: &str) -> Result<i32> {
    let name = CString::new(iface.as_bytes())
        .map_err(|_| EngineError::BadConfig(format!("invalid interface name {iface:?}")))?;
    let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if idx == 0 {
        return Err(EngineError::NicUnavailable(format!(
            "no such interface: {iface}"
        )));
    }
    Ok(idx as i32)
}

fn interface_flags(iface: &str) -> Result<i16> {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(iface.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(map_io("socket", &io::Error::last_os_error()));
    }
    let rc = unsafe { libc::ioctl(fd, SIOCGIFFLAGS, &mut ifr) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if rc < 0 {
        return Err(EngineError::NicUnavailable(format!("{iface}: {err}")));
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_flags })
}

fn interface_mtu(iface: &str) -> Option<usize> {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(iface.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return None;
    }
    let rc = unsafe { libc::ioctl(fd, SIOCGIFMTU, &mut ifr) };
    unsafe { libc::close(fd) };
    if rc < 0 {
        return None;
    }
    Some(unsafe { ifr.ifr_ifru.ifru_mtu } as usize)
}

/// Link speed in bits per second via the legacy ethtool query; 0 when the
/// driver does not report one (virtual devices, admin-down links).
fn link_speed_bps(iface: &str) -> u64 {
    let mut cmd: EthtoolCmd = unsafe { mem::zeroed() };
    cmd.cmd = ETHTOOL_GSET;

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(iface.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_data = &mut cmd as *mut EthtoolCmd as *mut libc::c_char;

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return 0;
    }
    let rc = unsafe { libc::ioctl(fd, SIOCETHTOOL, &mut ifr) };
    unsafe { libc::close(fd) };
    if rc < 0 {
        return 0;
    }

    let speed_mbps = (cmd.speed_hi as u32) << 16 | cmd.speed as u32;
    if speed_mbps == 0 || speed_mbps == SPEED_UNKNOWN16 || speed_mbps == SPEED_UNKNOWN32 {
        return 0;
    }
    speed_mbps as u64 * 1_000_000
}

fn is_backpressure(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::ENOBUFS)
}

fn map_io(what: &str, err: &io::Error) -> EngineError {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => EngineError::PermissionDenied(what.to_string()),
        Some(libc::ENODEV) | Some(libc::ENXIO) => {
            EngineError::NicUnavailable(format!("{what}: {err}"))
        }
        Some(libc::ENETDOWN) => EngineError::LinkDown(what.to_string()),
        _ => EngineError::Internal(format!("{what}: {err}")),
    }
}
