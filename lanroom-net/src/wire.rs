//! Tunnel driver configuration blob codec.
//!
//! The driver takes its whole configuration as one contiguous buffer:
//!
//! ```text
//! [interface][peer 1][allowed 1.1]..[allowed 1.n][peer 2][allowed 2.1]..
//! ```
//!
//! Every record is fixed-size, little-endian and 8-byte aligned. Peer
//! records are immediately followed by their own allowed-address entries;
//! a peer without allowed addresses is followed directly by the next peer.

use crate::error::{NetError, Result};
use crate::keys::{KEY_LEN, Key};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Size of the interface header record.
pub const INTERFACE_SIZE: usize = 80;
/// Size of one peer record.
pub const PEER_SIZE: usize = 136;
/// Size of one allowed-address entry.
pub const ALLOWED_IP_SIZE: usize = 24;
/// Size of the endpoint socket address embedded in a peer record.
pub const SOCKADDR_INET_SIZE: usize = 28;

/// Address family values used by the driver.
pub const AF_UNSPEC: u16 = 0;
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 23;

// Interface header offsets
const IF_FLAGS: usize = 0;
const IF_LISTEN_PORT: usize = 4;
const IF_PRIVATE_KEY: usize = 6;
const IF_PUBLIC_KEY: usize = 38;
const IF_PEERS_COUNT: usize = 72;

// Peer record offsets
const PEER_FLAGS: usize = 0;
const PEER_PUBLIC_KEY: usize = 8;
const PEER_PRESHARED_KEY: usize = 40;
const PEER_KEEPALIVE: usize = 72;
const PEER_ENDPOINT: usize = 76;
const PEER_TX_BYTES: usize = 104;
const PEER_RX_BYTES: usize = 112;
const PEER_LAST_HANDSHAKE: usize = 120;
const PEER_ALLOWED_COUNT: usize = 128;

// Allowed-address entry offsets
const ALLOWED_ADDRESS: usize = 0;
const ALLOWED_FAMILY: usize = 16;
const ALLOWED_CIDR: usize = 18;

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

flag_set! {
    /// Interface header flags.
    InterfaceFlags {
        HAS_PUBLIC_KEY = 1 << 0;
        HAS_PRIVATE_KEY = 1 << 1;
        HAS_LISTEN_PORT = 1 << 2;
        /// Drop every peer the driver knows before applying this buffer.
        REPLACE_PEERS = 1 << 3;
    }
}

flag_set! {
    /// Peer record flags.
    PeerFlags {
        HAS_PUBLIC_KEY = 1 << 0;
        HAS_PRESHARED_KEY = 1 << 1;
        HAS_PERSISTENT_KEEPALIVE = 1 << 2;
        HAS_ENDPOINT = 1 << 3;
        REPLACE_ALLOWED_IPS = 1 << 5;
        REMOVE = 1 << 6;
        UPDATE = 1 << 7;
    }
}

/// Interface header as laid out in the blob.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceRecord {
    pub flags: InterfaceFlags,
    pub listen_port: u16,
    pub private_key: Key,
    pub public_key: Key,
    pub peers_count: u32,
}

/// Peer record plus the allowed-address entries that follow it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerRecord {
    pub flags: PeerFlags,
    pub public_key: Key,
    pub preshared_key: Key,
    pub persistent_keepalive: u16,
    pub endpoint: Option<SocketAddr>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    /// 100ns ticks since 1601-01-01 UTC, 0 when no handshake happened yet.
    pub last_handshake: u64,
    /// Declared entry count, must match `allowed_ips.len()` when serializing.
    pub allowed_ips_count: u32,
    pub allowed_ips: Vec<IpNet>,
}

/// A decoded configuration buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigBlob {
    pub interface: InterfaceRecord,
    pub peers: Vec<PeerRecord>,
}

/// Exact buffer size for the given peers.
pub fn blob_size(peers: &[PeerRecord]) -> usize {
    INTERFACE_SIZE
        + peers.len() * PEER_SIZE
        + peers
            .iter()
            .map(|p| p.allowed_ips.len() * ALLOWED_IP_SIZE)
            .sum::<usize>()
}

/// Serialize an interface header and its peers into a fresh buffer.
pub fn serialize(interface: &InterfaceRecord, peers: &[PeerRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    serialize_into(&mut buf, interface, peers)?;
    Ok(buf)
}

/// Serialize into `buf`, reusing its allocation.
///
/// On success `buf.len()` is exactly [`blob_size`]. On error the buffer
/// contents are unspecified.
pub fn serialize_into(
    buf: &mut Vec<u8>,
    interface: &InterfaceRecord,
    peers: &[PeerRecord],
) -> Result<()> {
    if interface.peers_count as usize != peers.len() {
        return Err(NetError::Layout(format!(
            "interface declares {} peers, {} given",
            interface.peers_count,
            peers.len()
        )));
    }
    for (i, peer) in peers.iter().enumerate() {
        if peer.allowed_ips_count as usize != peer.allowed_ips.len() {
            return Err(NetError::Layout(format!(
                "peer #{} declares {} allowed addresses, {} stored",
                i + 1,
                peer.allowed_ips_count,
                peer.allowed_ips.len()
            )));
        }
    }

    let total = blob_size(peers);
    buf.clear();
    buf.resize(total, 0);

    encode_interface(&mut buf[..INTERFACE_SIZE], interface);
    let mut offset = INTERFACE_SIZE;
    for peer in peers {
        encode_peer(&mut buf[offset..offset + PEER_SIZE], peer);
        offset += PEER_SIZE;
        for allowed in &peer.allowed_ips {
            encode_allowed(&mut buf[offset..offset + ALLOWED_IP_SIZE], allowed);
            offset += ALLOWED_IP_SIZE;
        }
    }
    debug_assert_eq!(offset, total);
    Ok(())
}

/// Decode a buffer produced by [`serialize`] or returned by the driver.
pub fn deserialize(buf: &[u8]) -> Result<ConfigBlob> {
    let header = take(buf, 0, INTERFACE_SIZE, "interface header")?;
    let interface = decode_interface(header);

    let mut offset = INTERFACE_SIZE;
    // Cap by what the buffer can actually hold
    let fits = buf.len().saturating_sub(INTERFACE_SIZE) / PEER_SIZE;
    let mut peers = Vec::with_capacity((interface.peers_count as usize).min(fits));
    for i in 0..interface.peers_count {
        let record = take(buf, offset, PEER_SIZE, "peer record")?;
        let mut peer = decode_peer(record)
            .map_err(|e| NetError::Layout(format!("peer #{}: {e}", i + 1)))?;
        offset += PEER_SIZE;

        for _ in 0..peer.allowed_ips_count {
            let entry = take(buf, offset, ALLOWED_IP_SIZE, "allowed address entry")?;
            let allowed = decode_allowed(entry)
                .map_err(|e| NetError::Layout(format!("peer #{}: {e}", i + 1)))?;
            peer.allowed_ips.push(allowed);
            offset += ALLOWED_IP_SIZE;
        }
        peers.push(peer);
    }

    Ok(ConfigBlob { interface, peers })
}

fn take<'a>(buf: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    buf.get(offset..offset + len).ok_or_else(|| {
        NetError::Layout(format!(
            "truncated {what} at offset {offset} (buffer is {} bytes)",
            buf.len()
        ))
    })
}

fn encode_interface(out: &mut [u8], iface: &InterfaceRecord) {
    put_u32(out, IF_FLAGS, iface.flags.bits());
    put_u16(out, IF_LISTEN_PORT, iface.listen_port);
    out[IF_PRIVATE_KEY..IF_PRIVATE_KEY + KEY_LEN].copy_from_slice(iface.private_key.as_bytes());
    out[IF_PUBLIC_KEY..IF_PUBLIC_KEY + KEY_LEN].copy_from_slice(iface.public_key.as_bytes());
    put_u32(out, IF_PEERS_COUNT, iface.peers_count);
}

fn decode_interface(data: &[u8]) -> InterfaceRecord {
    InterfaceRecord {
        flags: InterfaceFlags::from_bits(get_u32(data, IF_FLAGS)),
        listen_port: get_u16(data, IF_LISTEN_PORT),
        private_key: get_key(data, IF_PRIVATE_KEY),
        public_key: get_key(data, IF_PUBLIC_KEY),
        peers_count: get_u32(data, IF_PEERS_COUNT),
    }
}

fn encode_peer(out: &mut [u8], peer: &PeerRecord) {
    put_u32(out, PEER_FLAGS, peer.flags.bits());
    out[PEER_PUBLIC_KEY..PEER_PUBLIC_KEY + KEY_LEN].copy_from_slice(peer.public_key.as_bytes());
    out[PEER_PRESHARED_KEY..PEER_PRESHARED_KEY + KEY_LEN]
        .copy_from_slice(peer.preshared_key.as_bytes());
    put_u16(out, PEER_KEEPALIVE, peer.persistent_keepalive);
    encode_sockaddr(
        &mut out[PEER_ENDPOINT..PEER_ENDPOINT + SOCKADDR_INET_SIZE],
        peer.endpoint.as_ref(),
    );
    put_u64(out, PEER_TX_BYTES, peer.tx_bytes);
    put_u64(out, PEER_RX_BYTES, peer.rx_bytes);
    put_u64(out, PEER_LAST_HANDSHAKE, peer.last_handshake);
    put_u32(out, PEER_ALLOWED_COUNT, peer.allowed_ips_count);
}

fn decode_peer(data: &[u8]) -> std::result::Result<PeerRecord, String> {
    Ok(PeerRecord {
        flags: PeerFlags::from_bits(get_u32(data, PEER_FLAGS)),
        public_key: get_key(data, PEER_PUBLIC_KEY),
        preshared_key: get_key(data, PEER_PRESHARED_KEY),
        persistent_keepalive: get_u16(data, PEER_KEEPALIVE),
        endpoint: decode_sockaddr(&data[PEER_ENDPOINT..PEER_ENDPOINT + SOCKADDR_INET_SIZE])?,
        tx_bytes: get_u64(data, PEER_TX_BYTES),
        rx_bytes: get_u64(data, PEER_RX_BYTES),
        last_handshake: get_u64(data, PEER_LAST_HANDSHAKE),
        allowed_ips_count: get_u32(data, PEER_ALLOWED_COUNT),
        allowed_ips: Vec::new(),
    })
}

/// SOCKADDR_INET: a union of sockaddr_in and sockaddr_in6 sharing the
/// family field. The port is in network byte order.
fn encode_sockaddr(out: &mut [u8], addr: Option<&SocketAddr>) {
    match addr {
        None => put_u16(out, 0, AF_UNSPEC),
        Some(SocketAddr::V4(v4)) => {
            put_u16(out, 0, AF_INET);
            out[2..4].copy_from_slice(&v4.port().to_be_bytes());
            out[4..8].copy_from_slice(&v4.ip().octets());
        }
        Some(SocketAddr::V6(v6)) => {
            put_u16(out, 0, AF_INET6);
            out[2..4].copy_from_slice(&v6.port().to_be_bytes());
            put_u32(out, 4, v6.flowinfo());
            out[8..24].copy_from_slice(&v6.ip().octets());
            put_u32(out, 24, v6.scope_id());
        }
    }
}

fn decode_sockaddr(data: &[u8]) -> std::result::Result<Option<SocketAddr>, String> {
    let port = u16::from_be_bytes([data[2], data[3]]);
    match get_u16(data, 0) {
        AF_UNSPEC => Ok(None),
        AF_INET => {
            let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            Ok(Some(SocketAddr::V4(SocketAddrV4::new(ip, port))))
        }
        AF_INET6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[8..24]);
            Ok(Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                get_u32(data, 4),
                get_u32(data, 24),
            ))))
        }
        other => Err(format!("unknown endpoint address family {other}")),
    }
}

fn encode_allowed(out: &mut [u8], net: &IpNet) {
    match net {
        IpNet::V4(v4) => {
            out[ALLOWED_ADDRESS..ALLOWED_ADDRESS + 4].copy_from_slice(&v4.addr().octets());
            put_u16(out, ALLOWED_FAMILY, AF_INET);
        }
        IpNet::V6(v6) => {
            out[ALLOWED_ADDRESS..ALLOWED_ADDRESS + 16].copy_from_slice(&v6.addr().octets());
            put_u16(out, ALLOWED_FAMILY, AF_INET6);
        }
    }
    out[ALLOWED_CIDR] = net.prefix_len();
}

fn decode_allowed(data: &[u8]) -> std::result::Result<IpNet, String> {
    let cidr = data[ALLOWED_CIDR];
    match get_u16(data, ALLOWED_FAMILY) {
        AF_INET => {
            let a = &data[ALLOWED_ADDRESS..ALLOWED_ADDRESS + 4];
            Ipv4Net::new(Ipv4Addr::new(a[0], a[1], a[2], a[3]), cidr)
                .map(IpNet::V4)
                .map_err(|_| format!("invalid IPv4 prefix length {cidr}"))
        }
        AF_INET6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[ALLOWED_ADDRESS..ALLOWED_ADDRESS + 16]);
            Ipv6Net::new(Ipv6Addr::from(octets), cidr)
                .map(IpNet::V6)
                .map_err(|_| format!("invalid IPv6 prefix length {cidr}"))
        }
        other => Err(format!("unknown allowed address family {other}")),
    }
}

fn put_u16(out: &mut [u8], at: usize, v: u16) {
    out[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut [u8], at: usize, v: u32) {
    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut [u8], at: usize, v: u64) {
    out[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn get_u32(data: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(data: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(b)
}

fn get_key(data: &[u8], at: usize) -> Key {
    let mut b = [0u8; KEY_LEN];
    b.copy_from_slice(&data[at..at + KEY_LEN]);
    Key::from_bytes(b)
}
