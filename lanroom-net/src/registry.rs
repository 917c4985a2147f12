//! Process-wide catalog of rooms.
//!
//! The registry is the only place rooms are created or destroyed. It also
//! keeps the broadcast relay's address set in step with the peers of every
//! room. All operations take the registry lock for their whole duration, so
//! callers on different threads are serialized.

use crate::driver::{AdapterState, NetConfigurator, TunnelDriver};
use crate::dump;
use crate::error::{NetError, Result};
use crate::keys::KeyPair;
use crate::relay::BroadcastRelay;
use crate::room::{InterfaceConfig, Peer, Room, TUNNEL_TYPE};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, info, warn};

/// On-link prefix length assigned with the adapter address.
pub const ADAPTER_PREFIX_LEN: u8 = 16;

/// Parameters for a new room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSettings {
    pub name: String,
    pub keys: KeyPair,
    pub listen_port: u16,
    /// Local address of the adapter inside the virtual subnet.
    pub adapter_address: Ipv4Addr,
    /// Subnet routed through the adapter.
    pub routed_subnet: Ipv4Net,
}

pub struct RoomRegistry {
    tunnel: Arc<dyn TunnelDriver>,
    net: Arc<dyn NetConfigurator>,
    relay: Arc<BroadcastRelay>,
    driver_version: OnceLock<u32>,
    rooms: Mutex<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new(
        tunnel: Arc<dyn TunnelDriver>,
        net: Arc<dyn NetConfigurator>,
        relay: Arc<BroadcastRelay>,
    ) -> Self {
        Self {
            tunnel,
            net,
            relay,
            driver_version: OnceLock::new(),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn relay(&self) -> &Arc<BroadcastRelay> {
        &self.relay
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Query the driver version once; 0 means no driver is loaded.
    fn ensure_driver(&self) -> Result<()> {
        let version = *self.driver_version.get_or_init(|| {
            let version = self.tunnel.running_version();
            if version == 0 {
                warn!("Tunnel driver not loaded");
            } else {
                let shown = format!("{}.{}", version >> 16, version & 0xffff);
                info!(version = %shown, "Tunnel driver loaded");
            }
            version
        });
        if version == 0 {
            return Err(NetError::DriverUnavailable);
        }
        Ok(())
    }

    /// Create a room. Returns `false` if a room with that name already exists,
    /// in which case nothing is changed.
    pub fn create_room(&self, settings: RoomSettings) -> Result<bool> {
        self.ensure_driver()?;
        let mut rooms = self.rooms();
        if rooms.contains_key(&settings.name) {
            debug!(room = %settings.name, "Room already exists");
            return Ok(false);
        }

        let room = self.build_room(&settings).map_err(|e| {
            warn!(room = %settings.name, error = %e, "Failed to create room");
            NetError::CreateFailed {
                room: settings.name.clone(),
                source: Box::new(e),
            }
        })?;

        info!(
            room = %settings.name,
            port = settings.listen_port,
            address = %settings.adapter_address,
            "Room created"
        );
        rooms.insert(settings.name, room);
        Ok(true)
    }

    /// Adapter, first apply (wiping any stale peers), then address and route.
    /// On any error the partially built room is dropped, closing its adapter.
    fn build_room(&self, settings: &RoomSettings) -> Result<Room> {
        let handle = self
            .tunnel
            .create_adapter(&settings.name, TUNNEL_TYPE)
            .map_err(|code| {
                NetError::AdapterCreateFailed(format!("{} (driver error {code})", settings.name))
            })?;

        let interface =
            InterfaceConfig::new(settings.keys.clone(), settings.listen_port).with_replace_peers();
        let mut room = Room::new(&settings.name, handle, Arc::clone(&self.tunnel), interface);
        room.apply()?;
        self.bind(&room, settings)?;
        room.clear_replace_peers();
        Ok(room)
    }

    fn bind(&self, room: &Room, settings: &RoomSettings) -> Result<()> {
        let luid = room.luid();
        self.net
            .add_address(luid, settings.adapter_address, ADAPTER_PREFIX_LEN)
            .map_err(|e| {
                NetError::Bind(format!(
                    "address {}/{ADAPTER_PREFIX_LEN}: {e}",
                    settings.adapter_address
                ))
            })?;
        self.net
            .add_route(luid, settings.routed_subnet)
            .map_err(|e| NetError::Bind(format!("route {}: {e}", settings.routed_subnet)))?;
        Ok(())
    }

    /// Delete a room. Returns `false` if it did not exist.
    pub fn del_room(&self, name: &str) -> bool {
        let Some(room) = self.rooms().remove(name) else {
            return false;
        };
        self.release(room);
        true
    }

    fn release(&self, room: Room) {
        for peer in room.peers() {
            self.relay.del_peers(&peer.broadcast_targets());
        }
        if let Err(e) = room.close() {
            warn!(room = %room.name(), error = %e, "Failed to take adapter down");
        }
        info!(room = %room.name(), "Room deleted");
    }

    fn with_room_mut<R>(&self, name: &str, f: impl FnOnce(&mut Room) -> Result<R>) -> Result<R> {
        let mut rooms = self.rooms();
        let room = rooms
            .get_mut(name)
            .ok_or_else(|| NetError::NotFound(name.to_string()))?;
        f(room)
    }

    /// Run `f` against a room.
    pub fn with_room<R>(&self, name: &str, f: impl FnOnce(&Room) -> R) -> Result<R> {
        let rooms = self.rooms();
        let room = rooms
            .get(name)
            .ok_or_else(|| NetError::NotFound(name.to_string()))?;
        Ok(f(room))
    }

    /// Add a peer to a room and register its addresses with the relay.
    pub fn add_peer(&self, room: &str, peer: Peer) -> Result<()> {
        let targets = peer.broadcast_targets();
        self.with_room_mut(room, |r| r.add_peer(peer))?;
        self.relay.add_peers(&targets);
        Ok(())
    }

    /// Remove a peer. Returns `false` if the room has no such peer.
    pub fn remove_peer(&self, room: &str, peer: &str) -> Result<bool> {
        let removed = self.with_room_mut(room, |r| Ok(r.remove_peer(peer)))?;
        match removed {
            Some(p) => {
                self.relay.del_peers(&p.broadcast_targets());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn update_peer_endpoint(&self, room: &str, peer: &str, endpoint: SocketAddr) -> Result<()> {
        self.with_room_mut(room, |r| r.update_peer_endpoint(peer, endpoint))
    }

    pub fn add_allowed_address(&self, room: &str, peer: &str, net: IpNet) -> Result<bool> {
        let (added, relayed) = self.with_room_mut(room, |r| {
            let added = r.add_allowed_address(peer, net)?;
            let relayed = r.peer(peer).is_some_and(|p| !p.transporter);
            Ok((added, relayed))
        })?;
        if let (true, true, IpNet::V4(v4)) = (added, relayed, net) {
            self.relay.add_peer(v4.addr());
        }
        Ok(added)
    }

    pub fn remove_allowed_address(&self, room: &str, peer: &str, net: IpNet) -> Result<bool> {
        let removed = self.with_room_mut(room, |r| r.remove_allowed_address(peer, net))?;
        if let (true, IpNet::V4(v4)) = (removed, net) {
            self.relay.del_peer(v4.addr());
        }
        Ok(removed)
    }

    pub fn run_adapter(&self, name: &str) -> Result<()> {
        self.with_room_mut(name, |r| r.set_state(AdapterState::Up))
    }

    pub fn pause_adapter(&self, name: &str) -> Result<()> {
        self.with_room_mut(name, |r| r.set_state(AdapterState::Down))
    }

    /// Read a room's live configuration from the driver and render it.
    pub fn adapter_config(&self, name: &str) -> Result<String> {
        let blob = self.with_room_mut(name, |r| r.read_configuration())?;
        dump::render(&blob)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rooms().contains_key(name)
    }

    /// Sorted room names.
    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.rooms().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms().is_empty()
    }

    /// Delete every room.
    pub fn shutdown(&self) {
        let rooms: Vec<Room> = self.rooms().drain().map(|(_, room)| room).collect();
        for room in rooms {
            self.release(room);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::driver::CaptureDriver;
    use crate::keys::Key;
    use crate::test_util::{MemoryCapture, MemoryNetConfigurator, MemoryTunnelDriver};

    struct Fixture {
        tunnel: Arc<MemoryTunnelDriver>,
        net: Arc<MemoryNetConfigurator>,
        registry: RoomRegistry,
    }

    fn fixture_with(tunnel: MemoryTunnelDriver) -> Fixture {
        let tunnel = Arc::new(tunnel);
        let net = Arc::new(MemoryNetConfigurator::new());
        let capture = Arc::new(MemoryCapture::new()) as Arc<dyn CaptureDriver>;
        let relay = Arc::new(BroadcastRelay::new(capture, RelayConfig::default()));
        let registry = RoomRegistry::new(
            tunnel.clone() as Arc<dyn TunnelDriver>,
            net.clone() as Arc<dyn NetConfigurator>,
            relay,
        );
        Fixture {
            tunnel,
            net,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryTunnelDriver::new())
    }

    fn settings(name: &str) -> RoomSettings {
        RoomSettings {
            name: name.to_string(),
            keys: KeyPair::new(Key::from_bytes([1; 32]), Key::from_bytes([2; 32])),
            listen_port: 8080,
            adapter_address: Ipv4Addr::new(10, 0, 0, 1),
            routed_subnet: "10.0.0.0/16".parse().unwrap(),
        }
    }

    #[test]
    fn test_create_binds_and_clears_replace_peers() {
        let f = fixture();
        assert!(f.registry.create_room(settings("test")).unwrap());

        let handle = f.tunnel.handle_by_name("test").unwrap();
        assert_eq!(f.tunnel.tunnel_type(handle).as_deref(), Some(TUNNEL_TYPE));

        // The first apply carried REPLACE_PEERS, the room no longer does
        let blob = crate::wire::deserialize(&f.tunnel.configuration(handle).unwrap()).unwrap();
        assert!(blob
            .interface
            .flags
            .contains(crate::wire::InterfaceFlags::REPLACE_PEERS));
        let replace = f
            .registry
            .with_room("test", |r| r.interface().replace_peers())
            .unwrap();
        assert!(!replace);

        let luid = f.tunnel.adapter_luid(handle);
        assert_eq!(
            f.net.addresses(),
            vec![(luid, Ipv4Addr::new(10, 0, 0, 1), ADAPTER_PREFIX_LEN)]
        );
        assert_eq!(f.net.routes().len(), 1);
    }

    #[test]
    fn test_create_is_idempotent() {
        let f = fixture();
        assert!(f.registry.create_room(settings("test")).unwrap());
        assert!(!f.registry.create_room(settings("test")).unwrap());
        assert_eq!(f.tunnel.open_adapters(), 1);
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn test_create_failure_releases_adapter() {
        let f = fixture();
        f.tunnel.fail_next_apply(5);
        let err = f.registry.create_room(settings("test")).unwrap_err();
        assert!(matches!(err, NetError::CreateFailed { .. }));
        assert_eq!(err.driver_code(), Some(5));
        assert!(!f.registry.contains("test"));
        assert_eq!(f.tunnel.open_adapters(), 0);

        f.net.fail_next();
        let err = f.registry.create_room(settings("test")).unwrap_err();
        match err {
            NetError::CreateFailed { source, .. } => {
                assert!(matches!(*source, NetError::Bind(_)))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.tunnel.open_adapters(), 0);

        f.tunnel.fail_next_create();
        assert!(f.registry.create_room(settings("test")).is_err());
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_driver_unavailable() {
        let f = fixture_with(MemoryTunnelDriver::unavailable());
        assert!(matches!(
            f.registry.create_room(settings("test")),
            Err(NetError::DriverUnavailable)
        ));
    }

    #[test]
    fn test_run_and_pause() {
        let f = fixture();
        f.registry.create_room(settings("test")).unwrap();
        let handle = f.tunnel.handle_by_name("test").unwrap();

        f.registry.run_adapter("test").unwrap();
        assert_eq!(f.tunnel.adapter_state(handle), Some(AdapterState::Up));
        f.registry.pause_adapter("test").unwrap();
        assert_eq!(f.tunnel.adapter_state(handle), Some(AdapterState::Down));

        f.tunnel.fail_next_state(1);
        assert!(matches!(
            f.registry.run_adapter("test"),
            Err(NetError::AdapterState { code: 1 })
        ));
        assert!(matches!(
            f.registry.run_adapter("missing"),
            Err(NetError::NotFound(_))
        ));
    }

    #[test]
    fn test_peers_feed_relay() {
        let f = fixture();
        f.registry.create_room(settings("test")).unwrap();
        let endpoint: SocketAddr = "192.168.0.100:8767".parse().unwrap();

        let peer = Peer::new("peer1", endpoint, Key::from_bytes([3; 32]))
            .with_allowed(["10.0.0.2/32".parse().unwrap()]);
        f.registry.add_peer("test", peer).unwrap();
        let transporter = Peer::new("hub", endpoint, Key::from_bytes([4; 32]))
            .with_allowed(["10.0.0.3/32".parse().unwrap()])
            .with_transporter(true);
        f.registry.add_peer("test", transporter).unwrap();

        let relay = f.registry.relay();
        assert_eq!(relay.addresses(), vec![Ipv4Addr::new(10, 0, 0, 2)]);

        let extra: IpNet = "10.0.0.9/32".parse().unwrap();
        assert!(f.registry.add_allowed_address("test", "peer1", extra).unwrap());
        assert!(relay.contains(Ipv4Addr::new(10, 0, 0, 9)));
        assert!(f.registry.remove_allowed_address("test", "peer1", extra).unwrap());
        assert!(!relay.contains(Ipv4Addr::new(10, 0, 0, 9)));

        assert!(f.registry.remove_peer("test", "peer1").unwrap());
        assert!(!f.registry.remove_peer("test", "peer1").unwrap());
        assert!(relay.is_empty());
    }

    #[test]
    fn test_del_room_drops_relay_addresses() {
        let f = fixture();
        f.registry.create_room(settings("test")).unwrap();
        let peer = Peer::new(
            "peer1",
            "192.168.0.100:8767".parse().unwrap(),
            Key::from_bytes([3; 32]),
        )
        .with_allowed(["10.0.0.2/32".parse().unwrap()]);
        f.registry.add_peer("test", peer).unwrap();

        let handle = f.tunnel.handle_by_name("test").unwrap();
        assert!(f.registry.del_room("test"));
        assert!(!f.registry.del_room("test"));
        assert!(f.registry.relay().is_empty());
        assert_eq!(f.tunnel.close_count(handle), 1);
    }

    #[test]
    fn test_adapter_config_dump() {
        let f = fixture();
        f.registry.create_room(settings("test")).unwrap();
        let text = f.registry.adapter_config("test").unwrap();
        assert!(text.contains("ListenPort = 8080"));
        assert!(text.contains("(No peers configured)"));
        assert!(f.registry.adapter_config("nope").is_err());
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let f = fixture();
        f.registry.create_room(settings("a")).unwrap();
        f.registry.create_room(settings("b")).unwrap();
        assert_eq!(f.registry.room_names(), vec!["a", "b"]);
        f.registry.shutdown();
        assert!(f.registry.is_empty());
        assert_eq!(f.tunnel.open_adapters(), 0);
    }
}
