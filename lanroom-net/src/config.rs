//! Declarative room and relay configuration.
//!
//! A room file is JSON:
//!
//! ```json
//! {
//!   "relay": { "subnet": "10.0.0.0/16" },
//!   "rooms": [{
//!     "name": "test",
//!     "private_key": "<base64>",
//!     "public_key": "<base64>",
//!     "listen_port": 8080,
//!     "adapter_address": "10.0.0.1",
//!     "routed_subnet": "10.0.0.0/16",
//!     "peers": [{
//!       "name": "peer1",
//!       "endpoint_host": "192.168.0.100",
//!       "endpoint_port": 8767,
//!       "public_key": "<base64>",
//!       "allowed": ["10.0.0.2/32"]
//!     }]
//!   }]
//! }
//! ```

use crate::addr::{parse_allowed_addresses, parse_endpoint};
use crate::error::{NetError, Result};
use crate::keys::{Key, KeyPair};
use crate::registry::RoomSettings;
use crate::room::Peer;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

/// Capture filter selecting outbound limited-broadcast packets.
pub const DEFAULT_CAPTURE_FILTER: &str = "outbound and ip.DstAddr == 255.255.255.255";

/// Broadcast relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Capture driver filter expression.
    pub filter: String,
    pub priority: i16,
    /// Virtual subnet; its network and gateway host addresses never get copies.
    pub subnet: Ipv4Net,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_CAPTURE_FILTER.to_string(),
            priority: 0,
            subnet: Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 16).unwrap_or_default(),
        }
    }
}

/// One peer entry in a room file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub name: String,
    pub endpoint_host: String,
    pub endpoint_port: u16,
    pub public_key: Key,
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub keepalive: Option<u16>,
    #[serde(default)]
    pub preshared_key: Option<Key>,
    #[serde(default)]
    pub transporter: bool,
}

impl PeerSpec {
    /// Parse endpoint and allowed addresses into a [`Peer`].
    pub fn to_peer(&self) -> Result<Peer> {
        let endpoint = parse_endpoint(&self.endpoint_host, self.endpoint_port)?;
        let allowed = parse_allowed_addresses(&self.allowed)?;
        let mut peer = Peer::new(&self.name, endpoint, self.public_key)
            .with_allowed(allowed)
            .with_transporter(self.transporter);
        if let Some(seconds) = self.keepalive {
            peer = peer.with_keepalive(seconds);
        }
        if let Some(psk) = self.preshared_key {
            peer = peer.with_preshared_key(psk);
        }
        Ok(peer)
    }
}

/// One room entry in a room file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSpec {
    pub name: String,
    pub private_key: Key,
    pub public_key: Key,
    pub listen_port: u16,
    pub adapter_address: Ipv4Addr,
    pub routed_subnet: Ipv4Net,
    #[serde(default)]
    pub peers: Vec<PeerSpec>,
}

impl RoomSpec {
    pub fn settings(&self) -> RoomSettings {
        RoomSettings {
            name: self.name.clone(),
            keys: KeyPair::new(self.private_key, self.public_key),
            listen_port: self.listen_port,
            adapter_address: self.adapter_address,
            routed_subnet: self.routed_subnet,
        }
    }
}

/// A complete room file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomFile {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub rooms: Vec<RoomSpec>,
}

impl RoomFile {
    /// Read, parse and validate a room file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: RoomFile =
            serde_json::from_str(text).map_err(|e| NetError::Config(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    /// Check names are present and unique, and every peer parses.
    pub fn validate(&self) -> Result<()> {
        let mut rooms = HashSet::new();
        for room in &self.rooms {
            if room.name.is_empty() {
                return Err(NetError::Config("room name must not be empty".to_string()));
            }
            if !rooms.insert(room.name.as_str()) {
                return Err(NetError::Config(format!("duplicate room {}", room.name)));
            }

            let mut peers = HashSet::new();
            for peer in &room.peers {
                if peer.name.is_empty() {
                    return Err(NetError::Config(format!(
                        "room {}: peer name must not be empty",
                        room.name
                    )));
                }
                if !peers.insert(peer.name.as_str()) {
                    return Err(NetError::Config(format!(
                        "room {}: duplicate peer {}",
                        room.name, peer.name
                    )));
                }
                peer.to_peer().map_err(|e| {
                    NetError::Config(format!("room {} peer {}: {e}", room.name, peer.name))
                })?;
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| NetError::Config(e.to_string()))
    }
}
