//! NFLOG capture over a raw netlink socket
//!
//! Binds to one NFLOG group, asks the kernel to copy whole packets and reads
//! `NFULNL_MSG_PACKET` messages until cancelled. Reads time out every 500ms
//! so the blocking loop can observe cancellation.
//!
//! # Wire format
//!
//! Every netlink message is a native-endian `nlmsghdr` (16 bytes) followed
//! by a `nfgenmsg` (family, version, big-endian resource id) and a list of
//! 4-byte aligned `nlattr` TLVs. NFLOG attribute payloads are big-endian.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, sockopt,
};
use nix::sys::time::TimeVal;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Callbacks, ErrorCallback, TrafficCallback, TrafficEvent, TrafficMonitor};
use crate::core::error::{Error, Result};

const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NLA_HDRLEN: usize = 4;

const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;

const NFNL_SUBSYS_ULOG: u16 = 4;
const NFULNL_MSG_PACKET: u16 = NFNL_SUBSYS_ULOG << 8;
const NFULNL_MSG_CONFIG: u16 = (NFNL_SUBSYS_ULOG << 8) | 1;

const NFULA_CFG_CMD: u16 = 1;
const NFULA_CFG_MODE: u16 = 2;

const NFULNL_CFG_CMD_BIND: u8 = 1;
const NFULNL_CFG_CMD_UNBIND: u8 = 2;
const NFULNL_CFG_CMD_PF_BIND: u8 = 3;
const NFULNL_CFG_CMD_PF_UNBIND: u8 = 4;

const NFULNL_COPY_PACKET: u8 = 2;
const COPY_RANGE: u32 = 0xFFFF;

const NFULA_TIMESTAMP: u16 = 3;
const NFULA_IFINDEX_INDEV: u16 = 4;
const NFULA_IFINDEX_OUTDEV: u16 = 5;
const NFULA_PAYLOAD: u16 = 9;
const NFULA_PREFIX: u16 = 10;

/// Clears NLA_F_NESTED and NLA_F_NET_BYTEORDER
const NLA_TYPE_MASK: u16 = !(0x8000 | 0x4000);

const AF_UNSPEC: u8 = 0;
const AF_INET: u8 = 2;
const AF_INET6: u8 = 10;

const RECV_BUFFER: usize = 128 * 1024;
const SOCKET_RCVBUF: usize = 1024 * 1024;

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Encodes one NFLOG config request.
pub fn config_message(seq: u32, family: u8, group: u16, attr_type: u16, attr: &[u8]) -> Vec<u8> {
    let attr_len = NLA_HDRLEN + attr.len();
    let total = NLMSG_HDRLEN + NFGENMSG_LEN + align4(attr_len);
    let mut msg = Vec::with_capacity(total);

    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&NFULNL_MSG_CONFIG.to_ne_bytes());
    msg.extend_from_slice(&(NLM_F_REQUEST | NLM_F_ACK).to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());

    msg.push(family);
    msg.push(0);
    msg.extend_from_slice(&group.to_be_bytes());

    msg.extend_from_slice(&(attr_len as u16).to_ne_bytes());
    msg.extend_from_slice(&attr_type.to_ne_bytes());
    msg.extend_from_slice(attr);
    msg.resize(total, 0);
    msg
}

fn command_message(seq: u32, family: u8, group: u16, command: u8) -> Vec<u8> {
    config_message(seq, family, group, NFULA_CFG_CMD, &[command])
}

fn mode_message(seq: u32, group: u16) -> Vec<u8> {
    let mut mode = Vec::with_capacity(6);
    mode.extend_from_slice(&COPY_RANGE.to_be_bytes());
    mode.push(NFULNL_COPY_PACKET);
    mode.push(0);
    config_message(seq, AF_UNSPEC, group, NFULA_CFG_MODE, &mode)
}

/// Iterates the `(type, payload)` attributes of a message body.
fn attributes(mut data: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    std::iter::from_fn(move || {
        if data.len() < NLA_HDRLEN {
            return None;
        }
        let len = usize::from(u16::from_ne_bytes([data[0], data[1]]));
        let kind = u16::from_ne_bytes([data[2], data[3]]) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > data.len() {
            return None;
        }
        let value = &data[NLA_HDRLEN..len];
        data = data.get(align4(len)..).unwrap_or(&[]);
        Some((kind, value))
    })
}

fn be32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?))
}

fn be64(bytes: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.get(at..at + 8)?.try_into().ok()?))
}

fn ne_u32(bytes: &[u8], at: usize) -> u32 {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map_or(0, u32::from_ne_bytes)
}

fn ne_u16(bytes: &[u8], at: usize) -> u16 {
    bytes
        .get(at..at + 2)
        .and_then(|b| b.try_into().ok())
        .map_or(0, u16::from_ne_bytes)
}

/// Turns raw NFLOG datagrams into traffic events.
///
/// Interface names are looked up once per ifindex and cached.
#[derive(Debug, Default)]
pub struct Decoder {
    interfaces: HashMap<u32, String>,
}

impl Decoder {
    fn interface(&mut self, index: u32) -> String {
        self.interfaces
            .entry(index)
            .or_insert_with(|| crate::utils::interface_name(index).unwrap_or_else(|| format!("if{index}")))
            .clone()
    }

    fn packet(&mut self, body: &[u8]) -> TrafficEvent {
        let mut prefix = String::new();
        let mut payload: &[u8] = &[];
        let mut timestamp = None;
        let mut indev = None;
        let mut outdev = None;

        for (kind, value) in attributes(body) {
            match kind {
                NFULA_PREFIX => {
                    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
                    prefix = String::from_utf8_lossy(&value[..end]).into_owned();
                }
                NFULA_PAYLOAD => payload = value,
                NFULA_TIMESTAMP => {
                    timestamp = be64(value, 0).zip(be64(value, 8)).and_then(|(sec, usec)| {
                        DateTime::from_timestamp(i64::try_from(sec).ok()?, u32::try_from(usec.checked_mul(1000)?).ok()?)
                    });
                }
                NFULA_IFINDEX_INDEV => indev = be32(value),
                NFULA_IFINDEX_OUTDEV => outdev = be32(value),
                _ => {}
            }
        }

        let interface = indev.or(outdev).map(|i| self.interface(i)).unwrap_or_default();
        TrafficEvent::from_packet(payload, &prefix, interface, timestamp.unwrap_or_else(Utc::now))
    }

    /// Decodes every message in one datagram.
    ///
    /// Netlink error messages become `Err` entries; the rest of the datagram
    /// is still decoded.
    pub fn parse_datagram(&mut self, buf: &[u8]) -> Vec<Result<TrafficEvent>> {
        let mut out = Vec::new();
        let mut offset = 0;

        while offset + NLMSG_HDRLEN <= buf.len() {
            let len = ne_u32(buf, offset) as usize;
            let kind = ne_u16(buf, offset + 4);
            if len < NLMSG_HDRLEN || offset + len > buf.len() {
                out.push(Err(Error::Capture(format!("truncated netlink message ({len} bytes)"))));
                break;
            }
            let message = &buf[offset..offset + len];

            match kind {
                NFULNL_MSG_PACKET if len >= NLMSG_HDRLEN + NFGENMSG_LEN => {
                    out.push(Ok(self.packet(&message[NLMSG_HDRLEN + NFGENMSG_LEN..])));
                }
                NLMSG_ERROR => {
                    let code = ne_u32(message, NLMSG_HDRLEN).cast_signed();
                    if code != 0 {
                        out.push(Err(Error::Capture(format!(
                            "netlink error: {}",
                            Errno::from_raw(-code)
                        ))));
                    }
                }
                NLMSG_NOOP | NLMSG_DONE => {}
                other => debug!("Ignoring netlink message type {other:#06x}"),
            }

            offset += align4(len);
        }

        out
    }
}

struct NflogSocket {
    fd: OwnedFd,
    group: u16,
    seq: u32,
}

fn capture_err(what: &str, e: Errno) -> Error {
    Error::Capture(format!("{what}: {e}"))
}

impl NflogSocket {
    fn open(group: u16) -> Result<Self> {
        let fd = socket::socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkNetFilter,
        )
        .map_err(|e| capture_err("netlink socket", e))?;
        socket::bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0)).map_err(|e| capture_err("netlink bind", e))?;
        socket::setsockopt(&fd, sockopt::ReceiveTimeout, &TimeVal::new(0, 500_000))
            .map_err(|e| capture_err("SO_RCVTIMEO", e))?;
        if let Err(e) = socket::setsockopt(&fd, sockopt::RcvBuf, &SOCKET_RCVBUF) {
            debug!("Could not raise netlink receive buffer: {e}");
        }

        let mut sock = Self { fd, group, seq: 0 };

        // Per-family binding is a no-op on modern kernels but still required on old ones
        for family in [AF_INET, AF_INET6] {
            let seq = sock.next_seq();
            if let Err(e) = sock.request(&command_message(seq, family, 0, NFULNL_CFG_CMD_PF_UNBIND)) {
                debug!("PF_UNBIND family {family}: {e}");
            }
            let seq = sock.next_seq();
            if let Err(e) = sock.request(&command_message(seq, family, 0, NFULNL_CFG_CMD_PF_BIND)) {
                debug!("PF_BIND family {family}: {e}");
            }
        }

        let seq = sock.next_seq();
        sock.request(&command_message(seq, AF_UNSPEC, group, NFULNL_CFG_CMD_BIND))
            .map_err(|e| Error::Capture(format!("bind NFLOG group {group}: {e}")))?;
        let seq = sock.next_seq();
        sock.request(&mode_message(seq, group))
            .map_err(|e| Error::Capture(format!("set copy mode for group {group}: {e}")))?;

        Ok(sock)
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Sends a request and waits for its acknowledgement.
    fn request(&self, msg: &[u8]) -> std::result::Result<(), Errno> {
        let seq = ne_u32(msg, 8);
        socket::send(self.fd.as_raw_fd(), msg, MsgFlags::empty())?;

        let mut buf = vec![0u8; 8192];
        loop {
            let n = self.recv(&mut buf)?;
            let mut offset = 0;
            while offset + NLMSG_HDRLEN <= n {
                let len = ne_u32(&buf, offset) as usize;
                if len < NLMSG_HDRLEN || offset + len > n {
                    break;
                }
                if ne_u16(&buf, offset + 4) == NLMSG_ERROR && ne_u32(&buf, offset + 8) == seq {
                    let code = ne_u32(&buf, offset + NLMSG_HDRLEN).cast_signed();
                    return if code == 0 { Ok(()) } else { Err(Errno::from_raw(-code)) };
                }
                offset += align4(len);
            }
        }
    }

    fn recv(&self, buf: &mut [u8]) -> std::result::Result<usize, Errno> {
        socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty())
    }
}

impl Drop for NflogSocket {
    fn drop(&mut self) {
        let seq = self.next_seq();
        if let Err(e) = self.request(&command_message(seq, AF_UNSPEC, self.group, NFULNL_CFG_CMD_UNBIND)) {
            debug!("Unbinding NFLOG group {}: {e}", self.group);
        }
    }
}

fn capture_loop(group: u16, callbacks: &Callbacks, cancel: &CancellationToken) -> Result<()> {
    let socket = NflogSocket::open(group)?;
    info!("Capturing NFLOG group {group}");

    let mut decoder = Decoder::default();
    let mut buf = vec![0u8; RECV_BUFFER];

    while !cancel.is_cancelled() {
        match socket.recv(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for item in decoder.parse_datagram(&buf[..n]) {
                    match item {
                        Ok(event) => callbacks.deliver(event),
                        Err(e) => callbacks.report(&e),
                    }
                }
            }
            // Read timeout: loop around to check cancellation
            Err(Errno::EAGAIN | Errno::EINTR) => {}
            Err(Errno::ENOBUFS) => {
                warn!("NFLOG receive buffer overrun, packets were lost");
                callbacks.report(&Error::Capture("receive buffer overrun".to_string()));
            }
            Err(e) if cancel.is_cancelled() => {
                debug!("Read error during shutdown: {e}");
            }
            Err(e) => {
                callbacks.report(&capture_err("netlink recv", e));
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }
    }

    info!("NFLOG capture stopped");
    Ok(())
}

/// Traffic monitor reading an NFLOG group
pub struct NflogMonitor {
    group: u16,
    callbacks: Callbacks,
}

impl NflogMonitor {
    pub fn new(group: u16) -> Self {
        Self {
            group,
            callbacks: Callbacks::default(),
        }
    }
}

#[async_trait]
impl TrafficMonitor for NflogMonitor {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let group = self.group;
        let callbacks = self.callbacks.clone();
        tokio::task::spawn_blocking(move || capture_loop(group, &callbacks, &cancel))
            .await
            .map_err(|e| Error::Internal(format!("capture task failed: {e}")))?
    }

    fn set_callback(&self, callback: TrafficCallback) {
        self.callbacks.set_traffic(callback);
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        self.callbacks.set_error(callback);
    }
}
