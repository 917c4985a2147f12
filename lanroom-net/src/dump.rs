//! Human-readable rendering of a configuration blob.

use crate::addr::{format_allowed_addresses, format_endpoint};
use crate::driver::filetime_to_utc;
use crate::error::{NetError, Result};
use crate::wire::{self, ConfigBlob, InterfaceFlags, PeerFlags};
use std::fmt::Write;

/// Render a raw configuration buffer. An empty buffer renders as `None`.
pub fn render(buf: &[u8]) -> Result<String> {
    if buf.is_empty() {
        return Ok("None".to_string());
    }
    let blob = wire::deserialize(buf)?;
    Ok(render_blob(&blob))
}

/// Render into a caller-provided buffer, returning the number of bytes written.
pub fn render_into(buf: &[u8], out: &mut [u8]) -> Result<usize> {
    let text = render(buf)?;
    let bytes = text.as_bytes();
    if bytes.len() > out.len() {
        return Err(NetError::BufferTooSmall {
            needed: bytes.len(),
            available: out.len(),
        });
    }
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

/// Render an already decoded blob.
pub fn render_blob(blob: &ConfigBlob) -> String {
    let mut s = String::new();
    let iface = &blob.interface;

    // Writing into a String cannot fail
    let _ = writeln!(s, "[Interface]");
    if iface.flags.contains(InterfaceFlags::HAS_PRIVATE_KEY) {
        let _ = writeln!(s, "PrivateKey = {}", iface.private_key);
    }
    if iface.flags.contains(InterfaceFlags::HAS_PUBLIC_KEY) {
        let _ = writeln!(s, "PublicKey = {}", iface.public_key);
    }
    if iface.flags.contains(InterfaceFlags::HAS_LISTEN_PORT) {
        let _ = writeln!(s, "ListenPort = {}", iface.listen_port);
    }
    s.push('\n');

    if blob.peers.is_empty() {
        s.push_str("(No peers configured)\n");
        return s;
    }

    for (i, peer) in blob.peers.iter().enumerate() {
        let _ = writeln!(s, "[Peer #{}]", i + 1);
        if peer.flags.contains(PeerFlags::HAS_PUBLIC_KEY) {
            let _ = writeln!(s, "  PublicKey = {}", peer.public_key);
        }
        if peer.flags.contains(PeerFlags::HAS_PRESHARED_KEY) && !peer.preshared_key.is_zero() {
            let _ = writeln!(s, "  PresharedKey = {}", peer.preshared_key);
        }
        if peer.flags.contains(PeerFlags::HAS_ENDPOINT) {
            let endpoint = peer
                .endpoint
                .as_ref()
                .map(format_endpoint)
                .unwrap_or_else(|| "none".to_string());
            let _ = writeln!(s, "  Endpoint = {endpoint}");
        }
        if peer.flags.contains(PeerFlags::HAS_PERSISTENT_KEEPALIVE) {
            let _ = writeln!(s, "  PersistentKeepalive = {}", peer.persistent_keepalive);
        }
        let _ = writeln!(
            s,
            "  AllowedIPs = {}",
            format_allowed_addresses(&peer.allowed_ips)
        );
        let _ = writeln!(s, "  TxBytes = {}", peer.tx_bytes);
        let _ = writeln!(s, "  RxBytes = {}", peer.rx_bytes);
        match filetime_to_utc(peer.last_handshake) {
            Some(t) => {
                let _ = writeln!(s, "  LastHandshake = {}", t.format("%Y-%m-%d %H:%M:%S"));
            }
            None => s.push_str("  LastHandshake = never\n"),
        }
        s.push('\n');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::parse_allowed_address;
    use crate::driver::utc_to_filetime;
    use crate::keys::Key;
    use crate::wire::{InterfaceRecord, PeerRecord};
    use chrono::{TimeZone, Utc};

    fn sample() -> Vec<u8> {
        let iface = InterfaceRecord {
            flags: InterfaceFlags::HAS_LISTEN_PORT | InterfaceFlags::HAS_PUBLIC_KEY,
            listen_port: 8080,
            public_key: Key::from_bytes([1; 32]),
            peers_count: 2,
            ..Default::default()
        };
        let p1 = PeerRecord {
            flags: PeerFlags::HAS_PUBLIC_KEY
                | PeerFlags::HAS_ENDPOINT
                | PeerFlags::HAS_PERSISTENT_KEEPALIVE,
            public_key: Key::from_bytes([2; 32]),
            persistent_keepalive: 25,
            endpoint: Some("192.168.0.100:8767".parse().unwrap()),
            tx_bytes: 1024,
            rx_bytes: 2048,
            last_handshake: utc_to_filetime(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            allowed_ips_count: 2,
            allowed_ips: vec![
                parse_allowed_address("10.0.0.2").unwrap(),
                parse_allowed_address("10.1.0.0/16").unwrap(),
            ],
            ..Default::default()
        };
        let p2 = PeerRecord {
            flags: PeerFlags::HAS_PUBLIC_KEY | PeerFlags::HAS_ENDPOINT,
            public_key: Key::from_bytes([3; 32]),
            endpoint: Some("[2001:db8::1]:51820".parse().unwrap()),
            ..Default::default()
        };
        wire::serialize(&iface, &[p1, p2]).unwrap()
    }

    #[test]
    fn test_render_sections() {
        let text = render(&sample()).unwrap();
        assert!(text.starts_with("[Interface]\n"));
        assert!(!text.contains("PrivateKey"));
        assert!(text.contains(&format!("PublicKey = {}\n", Key::from_bytes([1; 32]))));
        assert!(text.contains("ListenPort = 8080\n"));
        assert!(text.contains("[Peer #1]\n"));
        assert!(text.contains("  Endpoint = 192.168.0.100:8767\n"));
        assert!(text.contains("  PersistentKeepalive = 25\n"));
        assert!(text.contains("  AllowedIPs = 10.0.0.2/32, 10.1.0.0/16\n"));
        assert!(text.contains("  TxBytes = 1024\n"));
        assert!(text.contains("  LastHandshake = 2024-01-02 03:04:05\n"));
        assert!(text.contains("[Peer #2]\n"));
        assert!(text.contains("  Endpoint = [2001:db8::1]:51820\n"));
        assert!(text.contains("  AllowedIPs = (none)\n"));
        assert!(text.contains("  LastHandshake = never\n"));
    }

    #[test]
    fn test_render_no_peers() {
        let iface = InterfaceRecord::default();
        let buf = wire::serialize(&iface, &[]).unwrap();
        let text = render(&buf).unwrap();
        assert!(text.ends_with("(No peers configured)\n"));
        assert_eq!(render(&[]).unwrap(), "None");
    }

    #[test]
    fn test_render_into_small_buffer() {
        let buf = sample();
        let mut small = [0u8; 16];
        assert!(matches!(
            render_into(&buf, &mut small),
            Err(NetError::BufferTooSmall { available: 16, .. })
        ));

        let mut big = vec![0u8; 4096];
        let n = render_into(&buf, &mut big).unwrap();
        assert_eq!(&big[..n], render(&buf).unwrap().as_bytes());
    }
}
