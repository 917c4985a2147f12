//! Layer-3 broadcast relay.
//!
//! Tunnel adapters are point-to-multipoint: a packet sent to the limited
//! broadcast address reaches nobody. The relay sniffs those packets on a
//! dedicated thread and reinjects one unicast copy per known peer address.
//!
//! The address set is shared between the capture thread (one read per
//! packet) and the registry (writes as peers come and go). Each fan-out
//! works on a snapshot taken under the read lock, so a concurrent removal is
//! either fully visible to a packet or not at all.

use crate::config::RelayConfig;
use crate::driver::{CaptureDriver, CaptureFlags, CaptureHandle, CaptureLayer, RecvAction};
use crate::error::{NetError, Result};
use ipnet::Ipv4Net;
use smoltcp::wire::Ipv4Packet;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Largest packet the capture loop accepts.
pub const MAX_PACKET_SIZE: usize = 0xFFFF;

/// Whether `addr` is the network or gateway address of `subnet`.
///
/// Only the host bits below the subnet's prefix are considered.
pub fn is_reserved(addr: Ipv4Addr, subnet: &Ipv4Net) -> bool {
    let host = u32::from(addr) & u32::from(subnet.hostmask());
    host <= 1
}

type AddressSet = Arc<RwLock<HashSet<Ipv4Addr>>>;

/// Running capture thread.
struct RelayWorker {
    capture: CaptureHandle,
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Broadcast relay service. Construct once, [`run`](Self::run) once,
/// [`shutdown`](Self::shutdown) once.
pub struct BroadcastRelay {
    config: RelayConfig,
    driver: Arc<dyn CaptureDriver>,
    addresses: AddressSet,
    worker: Mutex<Option<RelayWorker>>,
}

impl BroadcastRelay {
    pub fn new(driver: Arc<dyn CaptureDriver>, config: RelayConfig) -> Self {
        Self {
            config,
            driver,
            addresses: Arc::new(RwLock::new(HashSet::new())),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashSet<Ipv4Addr>> {
        self.addresses.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<Ipv4Addr>> {
        self.addresses.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add one address. Reserved addresses are skipped; returns whether the
    /// address is new.
    pub fn add_peer(&self, addr: Ipv4Addr) -> bool {
        if is_reserved(addr, &self.config.subnet) {
            debug!(addr = %addr, "Skipping reserved address");
            return false;
        }
        self.write().insert(addr)
    }

    /// Add several addresses under one write lock. Returns how many were new.
    pub fn add_peers(&self, addrs: &[Ipv4Addr]) -> usize {
        let subnet = self.config.subnet;
        let mut set = self.write();
        addrs
            .iter()
            .filter(|a| !is_reserved(**a, &subnet))
            .filter(|a| set.insert(**a))
            .count()
    }

    pub fn del_peer(&self, addr: Ipv4Addr) -> bool {
        self.write().remove(&addr)
    }

    /// Remove several addresses under one write lock. Returns how many were present.
    pub fn del_peers(&self, addrs: &[Ipv4Addr]) -> usize {
        let mut set = self.write();
        addrs.iter().filter(|a| set.remove(*a)).count()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.read().contains(&addr)
    }

    /// Sorted copy of the address set.
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        let mut addrs: Vec<Ipv4Addr> = self.read().iter().copied().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Open the capture handle and start the relay thread.
    ///
    /// A second call while running is a no-op.
    pub fn run(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            debug!("Broadcast relay already running");
            return Ok(());
        }

        let capture = self
            .driver
            .open(
                &self.config.filter,
                CaptureLayer::Network,
                self.config.priority,
                CaptureFlags::SNIFF,
            )
            .map_err(|code| NetError::Capture { code })?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let driver = Arc::clone(&self.driver);
            let addresses = Arc::clone(&self.addresses);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("broadcast-relay".to_string())
                .spawn(move || capture_loop(driver.as_ref(), capture, &addresses, &shutdown))
        };
        let thread = match thread {
            Ok(t) => t,
            Err(e) => {
                self.driver.close(capture);
                return Err(NetError::Io(e));
            }
        };

        info!(filter = %self.config.filter, "Broadcast relay started");
        *worker = Some(RelayWorker {
            capture,
            shutdown,
            thread,
        });
        Ok(())
    }

    /// Stop the relay thread and wait for it. No packet is relayed after
    /// this returns.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };

        worker.shutdown.store(true, Ordering::SeqCst);
        // Unblocks a pending receive
        self.driver.close(worker.capture);
        if worker.thread.join().is_err() {
            error!("Broadcast relay thread panicked");
        }
        info!("Broadcast relay stopped");
    }

    /// Stop the relay and forget every address.
    pub fn shutdown(&self) {
        self.stop();
        self.clear();
    }
}

impl Drop for BroadcastRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whether `packet` carries a well-formed IPv4 header.
fn is_ipv4(packet: &[u8]) -> bool {
    Ipv4Packet::new_checked(packet).is_ok_and(|p| p.version() == 4)
}

fn capture_loop(
    driver: &dyn CaptureDriver,
    capture: CaptureHandle,
    addresses: &RwLock<HashSet<Ipv4Addr>>,
    shutdown: &AtomicBool,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut out = Vec::with_capacity(MAX_PACKET_SIZE);

    while !shutdown.load(Ordering::SeqCst) {
        let (len, meta) = match driver.recv(capture, &mut buf) {
            Ok(received) => received,
            Err(e) => match e.action() {
                RecvAction::Retry => continue,
                RecvAction::Stop => {
                    debug!(error = ?e, "Capture handle closed");
                    break;
                }
                RecvAction::Fatal => {
                    error!(error = ?e, "Capture receive failed, relay loop exiting");
                    break;
                }
            },
        };

        let packet = &buf[..len];
        if !is_ipv4(packet) {
            debug!(len, "Skipping non-IPv4 packet");
            continue;
        }

        let targets: Vec<Ipv4Addr> = addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();

        let mut sent = 0;
        for target in &targets {
            out.clear();
            out.extend_from_slice(packet);
            Ipv4Packet::new_unchecked(&mut out[..]).set_dst_addr(*target);

            let mut meta = meta;
            if !driver.calc_checksums(&mut out, &mut meta) {
                warn!(target = %target, "Checksum calculation failed");
                continue;
            }
            if !driver.send(capture, &out, &meta) {
                warn!(target = %target, "Failed to reinject broadcast copy");
                continue;
            }
            sent += 1;
        }
        debug!(len, targets = targets.len(), sent, "Broadcast relayed");
    }
}
