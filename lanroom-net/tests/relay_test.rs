use lanroom_net::BroadcastRelay;
use lanroom_net::config::RelayConfig;
use lanroom_net::driver::{CaptureDriver, RecvError};
use lanroom_net::test_util::MemoryCapture;
use lanroom_net::test_util::packets::{
    broadcast_udp, checksums_valid, dst_addr, udp_packet, udp_payload,
};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);
const SOURCE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

fn setup() -> (Arc<MemoryCapture>, BroadcastRelay) {
    let capture = Arc::new(MemoryCapture::new());
    let relay = BroadcastRelay::new(
        capture.clone() as Arc<dyn CaptureDriver>,
        RelayConfig::default(),
    );
    (capture, relay)
}

fn collect(capture: &MemoryCapture, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map_while(|_| capture.recv_sent(WAIT))
        .collect()
}

#[test]
fn test_reserved_addresses_never_added() {
    let (_capture, relay) = setup();
    assert!(!relay.add_peer(Ipv4Addr::new(10, 0, 0, 0)));
    assert!(!relay.add_peer(Ipv4Addr::new(10, 0, 0, 1)));
    assert_eq!(
        relay.add_peers(&[Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 1), A]),
        1
    );
    assert_eq!(relay.addresses(), vec![A]);
}

#[test]
fn test_fan_out_to_every_address() {
    let _ = tracing_subscriber::fmt::try_init();
    let (capture, relay) = setup();
    relay.add_peers(&[A, B]);
    relay.run().unwrap();

    capture.inject(broadcast_udp(SOURCE, 4445, 4445, b"hello"));
    let copies = collect(&capture, 2);
    assert_eq!(copies.len(), 2);

    let dsts: BTreeSet<Ipv4Addr> = copies.iter().filter_map(|p| dst_addr(p)).collect();
    assert_eq!(dsts, BTreeSet::from([A, B]));
    for copy in &copies {
        assert!(checksums_valid(copy));
        assert_eq!(udp_payload(copy).as_deref(), Some(&b"hello"[..]));
    }

    relay.stop();
}

#[test]
fn test_failed_send_does_not_abort_fan_out() {
    let (capture, relay) = setup();
    relay.add_peers(&[A, B]);
    capture.refuse_destination(A);
    relay.run().unwrap();

    capture.inject(broadcast_udp(SOURCE, 4445, 4445, b"x"));
    let copies = collect(&capture, 1);
    assert_eq!(copies.len(), 1);
    assert_eq!(dst_addr(&copies[0]), Some(B));

    relay.stop();
}

#[test]
fn test_garbage_is_skipped() {
    let (capture, relay) = setup();
    relay.add_peer(A);
    relay.run().unwrap();

    capture.inject(vec![0x45, 0x00, 0x01]);
    capture.inject_error(RecvError::HostUnreachable);
    capture.inject(udp_packet(SOURCE, Ipv4Addr::BROADCAST, 1, 2, b"after"));

    let copies = collect(&capture, 1);
    assert_eq!(copies.len(), 1);
    assert_eq!(udp_payload(&copies[0]).as_deref(), Some(&b"after"[..]));

    relay.stop();
}

#[test]
fn test_stop_joins_and_nothing_is_relayed_after() {
    let (capture, relay) = setup();
    relay.add_peer(A);
    relay.run().unwrap();
    relay.stop();
    assert!(!relay.is_running());

    capture.inject(broadcast_udp(SOURCE, 1, 2, b"late"));
    thread::sleep(Duration::from_millis(100));
    assert!(capture.drain_sent().is_empty());

    // Stopping twice is harmless
    relay.stop();
}

#[test]
fn test_fatal_receive_error_ends_loop() {
    let (capture, relay) = setup();
    relay.add_peer(A);
    relay.run().unwrap();

    capture.inject_error(RecvError::Other(87));
    capture.inject(broadcast_udp(SOURCE, 1, 2, b"ignored"));
    assert!(capture.recv_sent(Duration::from_millis(200)).is_none());

    relay.stop();
}

#[test]
fn test_concurrent_removal_never_tears_fan_out() {
    let _ = tracing_subscriber::fmt::try_init();
    let (capture, relay) = setup();
    let relay = Arc::new(relay);
    relay.add_peers(&[A, B]);
    relay.run().unwrap();

    const PACKETS: usize = 50;
    let feeder = {
        let capture = Arc::clone(&capture);
        thread::spawn(move || {
            for i in 0..PACKETS {
                capture.inject(broadcast_udp(SOURCE, 4445, 4445, &(i as u32).to_be_bytes()));
            }
        })
    };
    let writer = {
        let relay = Arc::clone(&relay);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(1));
            relay.del_peer(B);
        })
    };
    feeder.join().unwrap();
    writer.join().unwrap();

    // Every packet yields at least its copy to A
    let mut by_packet: HashMap<Vec<u8>, BTreeSet<Ipv4Addr>> = HashMap::new();
    while let Some(copy) = capture.recv_sent(Duration::from_millis(300)) {
        let payload = udp_payload(&copy).unwrap();
        let dst = dst_addr(&copy).unwrap();
        assert!(
            by_packet.entry(payload).or_default().insert(dst),
            "duplicate copy to {dst}"
        );
    }
    relay.stop();

    assert_eq!(by_packet.len(), PACKETS);
    let full = BTreeSet::from([A, B]);
    let reduced = BTreeSet::from([A]);
    for dsts in by_packet.values() {
        assert!(*dsts == full || *dsts == reduced, "torn fan-out: {dsts:?}");
    }
    assert_eq!(relay.addresses(), vec![A]);
}
