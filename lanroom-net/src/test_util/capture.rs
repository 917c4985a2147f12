//! In-memory packet capture driver.
//!
//! Inbound packets are queued with [`MemoryCapture::inject`]; reinjected
//! packets are collected and can be drained with [`MemoryCapture::recv_sent`].
//! A blocked `recv` polls the queue with a short timeout and reports
//! [`RecvError::Timeout`], so closing a handle is observed within one poll.

use crate::driver::{
    CaptureAddress, CaptureDriver, CaptureFlags, CaptureHandle, CaptureLayer, NativeCode,
    RecvError,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use smoltcp::wire::{IpProtocol, Ipv4Packet, UdpPacket};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How long one `recv` waits before reporting a timeout.
const RECV_POLL: Duration = Duration::from_millis(20);

enum Inbound {
    Packet(Vec<u8>, CaptureAddress),
    Error(RecvError),
}

/// Parameters a handle was opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub filter: String,
    pub layer: CaptureLayer,
    pub priority: i16,
    pub flags: CaptureFlags,
}

#[derive(Debug, Default)]
struct CaptureState {
    next_handle: u64,
    open: HashSet<CaptureHandle>,
    opened: Vec<OpenRecord>,
    fail_next_open: Option<NativeCode>,
    /// Destinations whose reinjection is refused.
    refuse: HashSet<Ipv4Addr>,
}

pub struct MemoryCapture {
    state: Mutex<CaptureState>,
    inbound_tx: Sender<Inbound>,
    inbound_rx: Receiver<Inbound>,
    sent_tx: Sender<Vec<u8>>,
    sent_rx: Receiver<Vec<u8>>,
}

impl Default for MemoryCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCapture {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        let (sent_tx, sent_rx) = unbounded();
        Self {
            state: Mutex::new(CaptureState {
                next_handle: 1,
                ..Default::default()
            }),
            inbound_tx,
            inbound_rx,
            sent_tx,
            sent_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a captured packet for the next `recv`.
    pub fn inject(&self, packet: Vec<u8>) {
        let _ = self
            .inbound_tx
            .send(Inbound::Packet(packet, CaptureAddress::default()));
    }

    /// Queue a receive error for the next `recv`.
    pub fn inject_error(&self, error: RecvError) {
        let _ = self.inbound_tx.send(Inbound::Error(error));
    }

    pub fn fail_next_open(&self, code: NativeCode) {
        self.lock().fail_next_open = Some(code);
    }

    /// Make `send` fail for packets addressed to `dst`.
    pub fn refuse_destination(&self, dst: Ipv4Addr) {
        self.lock().refuse.insert(dst);
    }

    pub fn opened(&self) -> Vec<OpenRecord> {
        self.lock().opened.clone()
    }

    pub fn is_open(&self, handle: CaptureHandle) -> bool {
        self.lock().open.contains(&handle)
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    /// Wait for the next reinjected packet.
    pub fn recv_sent(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.sent_rx.recv_timeout(timeout).ok()
    }

    /// Drain every reinjected packet sent so far.
    pub fn drain_sent(&self) -> Vec<Vec<u8>> {
        self.sent_rx.try_iter().collect()
    }
}

impl CaptureDriver for MemoryCapture {
    fn open(
        &self,
        filter: &str,
        layer: CaptureLayer,
        priority: i16,
        flags: CaptureFlags,
    ) -> Result<CaptureHandle, NativeCode> {
        let mut state = self.lock();
        if let Some(code) = state.fail_next_open.take() {
            return Err(code);
        }
        let handle = CaptureHandle(state.next_handle);
        state.next_handle += 1;
        state.open.insert(handle);
        state.opened.push(OpenRecord {
            filter: filter.to_string(),
            layer,
            priority,
            flags,
        });
        Ok(handle)
    }

    fn recv(
        &self,
        handle: CaptureHandle,
        buf: &mut [u8],
    ) -> Result<(usize, CaptureAddress), RecvError> {
        if !self.is_open(handle) {
            return Err(RecvError::InvalidHandle);
        }
        match self.inbound_rx.recv_timeout(RECV_POLL) {
            Ok(Inbound::Packet(packet, addr)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok((len, addr))
            }
            Ok(Inbound::Error(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Err(RecvError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(RecvError::Aborted),
        }
    }

    fn calc_checksums(&self, packet: &mut [u8], _addr: &mut CaptureAddress) -> bool {
        let Ok(mut ip) = Ipv4Packet::new_checked(packet) else {
            return false;
        };
        ip.fill_checksum();
        if ip.next_header() != IpProtocol::Udp {
            return true;
        }
        let (src, dst) = (ip.src_addr(), ip.dst_addr());
        match UdpPacket::new_checked(ip.payload_mut()) {
            Ok(mut udp) => {
                udp.fill_checksum(&src.into(), &dst.into());
                true
            }
            Err(_) => false,
        }
    }

    fn send(&self, handle: CaptureHandle, packet: &[u8], _addr: &CaptureAddress) -> bool {
        {
            let state = self.lock();
            if !state.open.contains(&handle) {
                return false;
            }
            let refused = Ipv4Packet::new_checked(packet)
                .map(|p| state.refuse.contains(&p.dst_addr()))
                .unwrap_or(true);
            if refused {
                return false;
            }
        }
        self.sent_tx.send(packet.to_vec()).is_ok()
    }

    fn close(&self, handle: CaptureHandle) -> bool {
        self.lock().open.remove(&handle)
    }
}
