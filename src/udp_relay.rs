//! UDP demultiplexing (inbound) and datagram synthesis (outbound).
//!
//! Unlike TCP, UDP has no persistent per-flow state in the NAT table: each
//! datagram carries its own endpoint, cloned once so the caller can hold
//! onto it after the tun-backed buffer is recycled.

use crate::error::{Error, Result};
use crate::nat::{Address as NatAddress, Endpoint};
use crate::pool::{BufferPool, PooledBuffer};
use crate::wire::{Ipv4Packet, Protocol, UdpPacket, IPV4_HEADER_LEN, UDP_HEADER_LEN};

/// One inbound datagram, demultiplexed and ready to hand to the
/// application-supplied receiver callback.
pub struct Inbound {
    pub endpoint: Endpoint,
    pub payload: PooledBuffer,
}

/// Demultiplexes one already-validated IPv4/UDP packet. The payload is
/// copied into a fresh pool-acquired buffer (sized to its own length, not
/// the tun frame's) so the caller can hold it past the frame's recycling.
/// Returns `None` if the UDP header itself is malformed (length field
/// inconsistent with the bytes actually present).
pub fn demux(packet: Ipv4Packet<PooledBuffer>, pool: &BufferPool) -> Option<Inbound> {
    let src_ip = packet.src_addr();
    let dst_ip = packet.dst_addr();
    let header_len = packet.header_len();
    let udp = UdpPacket::new_checked(&packet.as_ref()[header_len..]).ok()?;

    let mut out = pool.acquire(udp.payload().len());
    out.as_mut().copy_from_slice(udp.payload());

    Some(Inbound {
        endpoint: Endpoint {
            source: NatAddress::new(src_ip, udp.src_port()),
            target: NatAddress::new(dst_ip, udp.dst_port()),
        },
        payload: out,
    })
}

/// Synthesizes a fresh outbound IPv4/UDP datagram carrying `payload`, with
/// `endpoint.target` as the packet's source (this is a reply going back to
/// the guest) and `endpoint.source` as its destination.
pub fn send(pool: &BufferPool, mtu: usize, endpoint: &Endpoint, payload: &[u8]) -> Result<PooledBuffer> {
    let total = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    if total > mtu {
        return Err(Error::TooLarge);
    }

    let mut buf = pool.acquire(total);
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
        ip.set_version(4);
        ip.set_header_len(IPV4_HEADER_LEN as u8);
        ip.set_total_len(total as u16);
        ip.set_ident(0);
        ip.set_flags_and_fragment_offset(false, false, 0);
        ip.set_ttl(64);
        ip.set_protocol(Protocol::Udp);
        ip.set_src_addr(endpoint.target.ip);
        ip.set_dst_addr(endpoint.source.ip);
    }
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
        let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
        udp.set_src_port(endpoint.target.port);
        udp.set_dst_port(endpoint.source.port);
        udp.set_len((UDP_HEADER_LEN + payload.len()) as u16);
        udp.payload_mut().copy_from_slice(payload);
        udp.fill_checksum(endpoint.target.ip, endpoint.source.ip);
    }
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
        ip.fill_checksum();
    }

    Ok(buf)
}
