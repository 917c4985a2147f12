//! Network-layer packet builders for relay tests.
//!
//! Uses smoltcp for packet construction, matching the relay's parser.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr};

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// Build an IPv4/UDP datagram to the limited broadcast address.
pub fn broadcast_udp(src: Ipv4Address, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    udp_packet(src, Ipv4Address::BROADCAST, src_port, dst_port, payload)
}

/// Build an IPv4/UDP datagram with valid checksums.
pub fn udp_packet(
    src: Ipv4Address,
    dst: Ipv4Address,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + payload.len();
    let mut packet = vec![0u8; IP_HDR_SIZE + udp_len];

    let ip_repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut packet[..]);
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    let udp_repr = UdpRepr { src_port, dst_port };
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );

    packet
}

/// Destination address of an IPv4 packet.
pub fn dst_addr(packet: &[u8]) -> Option<Ipv4Address> {
    Ipv4Packet::new_checked(packet).ok().map(|p| p.dst_addr())
}

/// Whether both the IPv4 header and UDP checksums of `packet` verify.
pub fn checksums_valid(packet: &[u8]) -> bool {
    let Ok(ip) = Ipv4Packet::new_checked(packet) else {
        return false;
    };
    if !ip.verify_checksum() {
        return false;
    }
    if ip.next_header() != IpProtocol::Udp {
        return true;
    }
    let (src, dst) = (ip.src_addr(), ip.dst_addr());
    match UdpPacket::new_checked(ip.payload()) {
        Ok(udp) => udp.verify_checksum(&src.into(), &dst.into()),
        Err(_) => false,
    }
}

/// UDP payload of an IPv4 packet.
pub fn udp_payload(packet: &[u8]) -> Option<Vec<u8>> {
    let ip = Ipv4Packet::new_checked(packet).ok()?;
    let udp = UdpPacket::new_checked(ip.payload()).ok()?;
    Some(udp.payload().to_vec())
}
