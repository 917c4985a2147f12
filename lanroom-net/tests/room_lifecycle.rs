use lanroom_net::addr::{parse_allowed_address, parse_endpoint};
use lanroom_net::config::RelayConfig;
use lanroom_net::driver::{CaptureDriver, NetConfigurator, TunnelDriver};
use lanroom_net::keys::{Key, KeyPair};
use lanroom_net::test_util::{MemoryCapture, MemoryNetConfigurator, MemoryTunnelDriver};
use lanroom_net::wire::{self, ALLOWED_IP_SIZE, INTERFACE_SIZE, PEER_SIZE};
use lanroom_net::{BroadcastRelay, NetError, Peer, RoomRegistry, RoomSettings};
use std::net::Ipv4Addr;
use std::sync::Arc;

fn setup() -> (Arc<MemoryTunnelDriver>, RoomRegistry) {
    let tunnel = Arc::new(MemoryTunnelDriver::new());
    let relay = Arc::new(BroadcastRelay::new(
        Arc::new(MemoryCapture::new()) as Arc<dyn CaptureDriver>,
        RelayConfig::default(),
    ));
    let registry = RoomRegistry::new(
        tunnel.clone() as Arc<dyn TunnelDriver>,
        Arc::new(MemoryNetConfigurator::new()) as Arc<dyn NetConfigurator>,
        relay,
    );
    (tunnel, registry)
}

fn settings(name: &str) -> RoomSettings {
    RoomSettings {
        name: name.to_string(),
        keys: KeyPair::new(Key::from_bytes([0x11; 32]), Key::from_bytes([0x22; 32])),
        listen_port: 8080,
        adapter_address: Ipv4Addr::new(10, 0, 0, 1),
        routed_subnet: "10.0.0.0/16".parse().unwrap(),
    }
}

fn peer(name: &str, key: u8, allowed: &str) -> Peer {
    Peer::new(
        name,
        parse_endpoint("192.168.0.100", 8767).unwrap(),
        Key::from_bytes([key; 32]),
    )
    .with_allowed([parse_allowed_address(allowed).unwrap()])
}

#[test]
fn test_room_end_to_end() {
    let _ = tracing_subscriber::fmt::try_init();
    let (tunnel, registry) = setup();

    registry.create_room(settings("test")).unwrap();
    let handle = tunnel.handle_by_name("test").unwrap();
    let blob = wire::deserialize(&tunnel.configuration(handle).unwrap()).unwrap();
    assert_eq!(blob.interface.peers_count, 0);
    assert_eq!(blob.interface.listen_port, 8080);
    assert_eq!(blob.interface.public_key, Key::from_bytes([0x22; 32]));

    registry.add_peer("test", peer("peer1", 1, "10.0.0.1/32")).unwrap();
    let raw = tunnel.configuration(handle).unwrap();
    assert_eq!(raw.len(), INTERFACE_SIZE + PEER_SIZE + ALLOWED_IP_SIZE);
    let blob = wire::deserialize(&raw).unwrap();
    assert_eq!(blob.interface.peers_count, 1);
    assert_eq!(blob.peers[0].public_key, Key::from_bytes([1; 32]));
    assert_eq!(blob.peers[0].allowed_ips[0].to_string(), "10.0.0.1/32");
    assert_eq!(
        registry.with_room("test", |r| r.peers_count()).unwrap(),
        1
    );

    assert!(registry.del_room("test"));
    assert!(!tunnel.is_open(handle));
    assert_eq!(tunnel.close_count(handle), 1);
    assert!(!registry.contains("test"));
}

#[test]
fn test_add_remove_restores_table() {
    let (_tunnel, registry) = setup();
    registry.create_room(settings("test")).unwrap();
    registry.add_peer("test", peer("peer1", 1, "10.0.0.2")).unwrap();

    let before: Vec<Peer> = registry
        .with_room("test", |r| r.peers().cloned().collect())
        .unwrap();
    registry.add_peer("test", peer("peer2", 2, "10.0.0.3")).unwrap();
    assert!(registry.remove_peer("test", "peer2").unwrap());
    let after: Vec<Peer> = registry
        .with_room("test", |r| r.peers().cloned().collect())
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_failed_apply_leaves_no_trace() {
    let (tunnel, registry) = setup();
    registry.create_room(settings("test")).unwrap();
    let applies = tunnel.apply_count();

    tunnel.fail_next_apply(1168);
    let err = registry
        .add_peer("test", peer("peer1", 1, "10.0.0.2"))
        .unwrap_err();
    assert!(matches!(err, NetError::ApplyFailed { code: 1168 }));
    assert_eq!(tunnel.apply_count(), applies);
    assert!(
        registry
            .with_room("test", |r| r.peer("peer1").is_none())
            .unwrap()
    );
    assert!(!registry.relay().contains(Ipv4Addr::new(10, 0, 0, 2)));

    // Same name works once the driver recovers
    registry.add_peer("test", peer("peer1", 1, "10.0.0.2")).unwrap();
    assert!(registry.relay().contains(Ipv4Addr::new(10, 0, 0, 2)));
}

#[test]
fn test_duplicate_peer_and_missing_room() {
    let (_tunnel, registry) = setup();
    registry.create_room(settings("test")).unwrap();
    registry.add_peer("test", peer("peer1", 1, "10.0.0.2")).unwrap();

    assert!(matches!(
        registry.add_peer("test", peer("peer1", 9, "10.0.0.9")),
        Err(NetError::DuplicateName(_))
    ));
    assert!(matches!(
        registry.add_peer("other", peer("peer1", 1, "10.0.0.2")),
        Err(NetError::NotFound(_))
    ));
    assert!(!registry.relay().contains(Ipv4Addr::new(10, 0, 0, 9)));
}

#[test]
fn test_endpoint_update_round_trip() {
    let (tunnel, registry) = setup();
    registry.create_room(settings("test")).unwrap();
    registry.add_peer("test", peer("peer1", 1, "10.0.0.2")).unwrap();

    let moved = parse_endpoint("[2001:db8::7]", 51820).unwrap();
    registry
        .update_peer_endpoint("test", "peer1", moved)
        .unwrap();

    let text = registry.adapter_config("test").unwrap();
    assert!(text.contains("Endpoint = [2001:db8::7]:51820"));
    assert!(text.contains("AllowedIPs = 10.0.0.2/32"));
    assert!(text.contains("LastHandshake = never"));

    let handle = tunnel.handle_by_name("test").unwrap();
    let blob = wire::deserialize(&tunnel.configuration(handle).unwrap()).unwrap();
    assert_eq!(blob.peers[0].endpoint, Some(moved));
}
