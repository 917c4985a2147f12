//! Rooms: one tunnel adapter, its interface settings and its peer table.
//!
//! The peer table always mirrors the last configuration the driver accepted.
//! Every mutation regenerates the full configuration blob and pushes it to
//! the driver; if the driver rejects it, the mutation is undone before the
//! error is returned. Removal is the exception: it is always applied locally.

use crate::driver::{AdapterHandle, AdapterLuid, AdapterState, GetConfigError, TunnelDriver};
use crate::error::{NetError, Result};
use crate::keys::{Key, KeyPair};
use crate::wire::{self, InterfaceFlags, InterfaceRecord, PeerFlags, PeerRecord};
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tunnel type requested from the driver for every room adapter.
pub const TUNNEL_TYPE: &str = "WireGuard";

/// Per-apply intent for a single peer record.
///
/// Only lives for the duration of one apply call; it is never stored on the
/// peer, so a later apply cannot replay it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerOp {
    #[default]
    Normal,
    /// Update the peer only if the driver already knows it.
    UpdateOnly,
    Remove,
}

/// Interface half of a room's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub listen_port: u16,
    pub keys: KeyPair,
    pub flags: InterfaceFlags,
}

impl InterfaceConfig {
    pub fn new(keys: KeyPair, listen_port: u16) -> Self {
        Self {
            listen_port,
            keys,
            flags: InterfaceFlags::HAS_LISTEN_PORT
                | InterfaceFlags::HAS_PRIVATE_KEY
                | InterfaceFlags::HAS_PUBLIC_KEY,
        }
    }

    /// Ask the driver to wipe its peer list on the next apply.
    pub fn with_replace_peers(mut self) -> Self {
        self.flags.insert(InterfaceFlags::REPLACE_PEERS);
        self
    }

    pub fn replace_peers(&self) -> bool {
        self.flags.contains(InterfaceFlags::REPLACE_PEERS)
    }

    fn record(&self, peers_count: u32) -> InterfaceRecord {
        InterfaceRecord {
            flags: self.flags,
            listen_port: self.listen_port,
            private_key: self.keys.private_key,
            public_key: self.keys.public_key,
            peers_count,
        }
    }
}

/// An authorized remote member of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub endpoint: SocketAddr,
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    /// Persistent keepalive interval in seconds.
    pub keepalive: Option<u16>,
    allowed: Vec<IpNet>,
    /// Transporters relay traffic for others and never receive broadcast copies.
    pub transporter: bool,
}

impl Peer {
    pub fn new(name: impl Into<String>, endpoint: SocketAddr, public_key: Key) -> Self {
        Self {
            name: name.into(),
            endpoint,
            public_key,
            preshared_key: None,
            keepalive: None,
            allowed: Vec::new(),
            transporter: false,
        }
    }

    /// Set the allowed addresses. Duplicates are dropped, order is kept.
    pub fn with_allowed(mut self, allowed: impl IntoIterator<Item = IpNet>) -> Self {
        self.allowed.clear();
        for net in allowed {
            self.push_allowed(net);
        }
        self
    }

    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.keepalive = Some(seconds);
        self
    }

    pub fn with_preshared_key(mut self, key: Key) -> Self {
        self.preshared_key = Some(key);
        self
    }

    pub fn with_transporter(mut self, transporter: bool) -> Self {
        self.transporter = transporter;
        self
    }

    pub fn allowed(&self) -> &[IpNet] {
        &self.allowed
    }

    /// IPv4 addresses that should receive broadcast copies for this peer.
    pub fn broadcast_targets(&self) -> Vec<Ipv4Addr> {
        if self.transporter {
            return Vec::new();
        }
        self.allowed
            .iter()
            .filter_map(|net| match net {
                IpNet::V4(v4) => Some(v4.addr()),
                IpNet::V6(_) => None,
            })
            .collect()
    }

    fn push_allowed(&mut self, net: IpNet) -> bool {
        if self.allowed.contains(&net) {
            return false;
        }
        self.allowed.push(net);
        true
    }

    /// Driver record for this peer under the given intent.
    pub fn record(&self, op: PeerOp) -> PeerRecord {
        let mut flags = PeerFlags::HAS_PUBLIC_KEY;
        match op {
            PeerOp::Remove => flags.insert(PeerFlags::REMOVE),
            PeerOp::UpdateOnly => flags.insert(PeerFlags::HAS_ENDPOINT | PeerFlags::UPDATE),
            PeerOp::Normal => {
                flags.insert(PeerFlags::HAS_ENDPOINT | PeerFlags::REPLACE_ALLOWED_IPS)
            }
        }
        if op != PeerOp::Remove {
            if self.preshared_key.is_some() {
                flags.insert(PeerFlags::HAS_PRESHARED_KEY);
            }
            if self.keepalive.is_some() {
                flags.insert(PeerFlags::HAS_PERSISTENT_KEEPALIVE);
            }
        }

        PeerRecord {
            flags,
            public_key: self.public_key,
            preshared_key: self.preshared_key.unwrap_or_default(),
            persistent_keepalive: self.keepalive.unwrap_or(0),
            endpoint: Some(self.endpoint),
            allowed_ips_count: self.allowed.len() as u32,
            allowed_ips: self.allowed.clone(),
            ..Default::default()
        }
    }
}

/// One virtual LAN segment backed by one tunnel adapter.
///
/// Rooms are not internally synchronized; the registry serializes access.
pub struct Room {
    name: String,
    interface: InterfaceConfig,
    peers: BTreeMap<String, Peer>,
    handle: AdapterHandle,
    driver: Arc<dyn TunnelDriver>,
    /// Last generated blob, reused between applies.
    blob: Vec<u8>,
}

impl Room {
    /// Take ownership of an adapter handle. The adapter is closed when the
    /// room is dropped.
    pub fn new(
        name: impl Into<String>,
        handle: AdapterHandle,
        driver: Arc<dyn TunnelDriver>,
        interface: InterfaceConfig,
    ) -> Self {
        Self {
            name: name.into(),
            interface,
            peers: BTreeMap::new(),
            handle,
            driver,
            blob: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> AdapterHandle {
        self.handle
    }

    pub fn luid(&self) -> AdapterLuid {
        self.driver.adapter_luid(self.handle)
    }

    pub fn interface(&self) -> &InterfaceConfig {
        &self.interface
    }

    pub fn peers_count(&self) -> u32 {
        self.peers.len() as u32
    }

    pub fn peer(&self, name: &str) -> Option<&Peer> {
        self.peers.get(name)
    }

    /// Peers in blob order.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// The last blob handed to the driver.
    pub fn last_blob(&self) -> &[u8] {
        &self.blob
    }

    /// Stop wiping the driver's peer list on apply.
    pub fn clear_replace_peers(&mut self) {
        self.interface.flags.remove(InterfaceFlags::REPLACE_PEERS);
    }

    /// Serialize the current state and push it to the driver.
    pub fn apply(&mut self) -> Result<()> {
        self.apply_with(None)
    }

    fn apply_with(&mut self, pending: Option<(&str, PeerOp)>) -> Result<()> {
        let records: Vec<PeerRecord> = self
            .peers
            .values()
            .map(|peer| {
                let op = match pending {
                    Some((name, op)) if name == peer.name => op,
                    _ => PeerOp::Normal,
                };
                peer.record(op)
            })
            .collect();
        let interface = self.interface.record(records.len() as u32);

        wire::serialize_into(&mut self.blob, &interface, &records)?;
        self.driver
            .set_configuration(self.handle, &self.blob)
            .map_err(|code| NetError::ApplyFailed { code })?;

        debug!(
            room = %self.name,
            peers = records.len(),
            bytes = self.blob.len(),
            "Configuration applied"
        );
        Ok(())
    }

    /// Add a peer and apply. On failure the peer is not kept.
    pub fn add_peer(&mut self, peer: Peer) -> Result<()> {
        if self.peers.contains_key(&peer.name) {
            return Err(NetError::DuplicateName(peer.name));
        }
        let name = peer.name.clone();
        self.peers.insert(name.clone(), peer);

        if let Err(e) = self.apply() {
            self.peers.remove(&name);
            warn!(room = %self.name, peer = %name, error = %e, "Add peer rolled back");
            return Err(e);
        }
        info!(room = %self.name, peer = %name, "Peer added");
        Ok(())
    }

    /// Remove a peer. The local table is updated even if the driver rejects
    /// the removal. Returns the removed peer.
    pub fn remove_peer(&mut self, name: &str) -> Option<Peer> {
        if !self.peers.contains_key(name) {
            return None;
        }
        if let Err(e) = self.apply_with(Some((name, PeerOp::Remove))) {
            warn!(room = %self.name, peer = %name, error = %e, "Driver rejected peer removal");
        }
        let removed = self.peers.remove(name);
        info!(room = %self.name, peer = %name, "Peer removed");
        removed
    }

    /// Move a peer to a new endpoint. On failure the old endpoint is kept.
    pub fn update_peer_endpoint(&mut self, name: &str, endpoint: SocketAddr) -> Result<()> {
        let peer = self
            .peers
            .get_mut(name)
            .ok_or_else(|| NetError::NotFound(name.to_string()))?;
        let old = std::mem::replace(&mut peer.endpoint, endpoint);

        if let Err(e) = self.apply_with(Some((name, PeerOp::UpdateOnly))) {
            if let Some(peer) = self.peers.get_mut(name) {
                peer.endpoint = old;
            }
            return Err(e);
        }
        info!(room = %self.name, peer = %name, endpoint = %endpoint, "Peer endpoint updated");
        Ok(())
    }

    /// Route one more prefix through a peer. Returns false if it was already there.
    pub fn add_allowed_address(&mut self, name: &str, net: IpNet) -> Result<bool> {
        let peer = self
            .peers
            .get_mut(name)
            .ok_or_else(|| NetError::NotFound(name.to_string()))?;
        if !peer.push_allowed(net) {
            return Ok(false);
        }

        if let Err(e) = self.apply() {
            if let Some(peer) = self.peers.get_mut(name) {
                peer.allowed.retain(|a| *a != net);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Stop routing a prefix through a peer. Returns false if it was not there.
    pub fn remove_allowed_address(&mut self, name: &str, net: IpNet) -> Result<bool> {
        let peer = self
            .peers
            .get_mut(name)
            .ok_or_else(|| NetError::NotFound(name.to_string()))?;
        let Some(index) = peer.allowed.iter().position(|a| *a == net) else {
            return Ok(false);
        };
        peer.allowed.remove(index);

        if let Err(e) = self.apply() {
            if let Some(peer) = self.peers.get_mut(name) {
                peer.allowed.insert(index, net);
            }
            return Err(e);
        }
        Ok(true)
    }

    pub fn set_state(&self, state: AdapterState) -> Result<()> {
        self.driver
            .set_adapter_state(self.handle, state)
            .map_err(|code| NetError::AdapterState { code })?;
        info!(room = %self.name, state = ?state, "Adapter state changed");
        Ok(())
    }

    /// Take the adapter down. The handle stays owned until drop.
    pub fn close(&self) -> Result<()> {
        self.set_state(AdapterState::Down)
    }

    /// Read the live configuration back from the driver.
    pub fn read_configuration(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        loop {
            match self.driver.get_configuration(self.handle, &mut buf) {
                Ok(len) => {
                    buf.truncate(len);
                    return Ok(buf);
                }
                Err(GetConfigError::MoreData { needed }) if needed > buf.len() => {
                    buf.resize(needed, 0);
                }
                Err(GetConfigError::MoreData { needed }) => {
                    return Err(NetError::Layout(format!(
                        "driver asked for {needed} bytes but {} were offered",
                        buf.len()
                    )));
                }
                Err(GetConfigError::Failed(code)) => {
                    return Err(NetError::ApplyFailed { code });
                }
            }
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.driver.close_adapter(self.handle);
        debug!(room = %self.name, "Adapter closed");
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}
