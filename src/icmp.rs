//! ICMP echo responder: the only ICMP behavior this stack implements.
//!
//! Everything that isn't a type=8/code=0 echo request addressed to a
//! globally-unicast destination is silently dropped before it gets here.

use crate::pool::PooledBuffer;
use crate::wire::icmpv4::{self, Packet as IcmpPacket};
use crate::wire::ipv4::AddressExt;
use crate::wire::Ipv4Packet;

/// Answers one echo request in place, returning the rewritten packet ready
/// for the encoder, or `None` if it isn't something this responder answers.
pub fn respond(packet: Ipv4Packet<PooledBuffer>) -> Option<PooledBuffer> {
    let src = packet.src_addr();
    let dst = packet.dst_addr();
    if !dst.x_is_unicast() || !src.x_is_unicast() {
        return None;
    }

    if !IcmpPacket::new_checked(packet.payload()).ok()?.is_echo_request() {
        return None;
    }

    let mut buffer = packet.into_inner();
    let mut ip = Ipv4Packet::new_unchecked(&mut buffer[..]);
    ip.set_src_addr(dst);
    ip.set_dst_addr(src);
    {
        let mut icmp = IcmpPacket::new_unchecked(ip.payload_mut());
        icmp.set_msg_type(icmpv4::TYPE_ECHO_REPLY);
        icmp.fill_checksum();
    }
    ip.fill_checksum();

    Some(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::wire::{Protocol, IPV4_HEADER_LEN};
    use std::net::Ipv4Addr;

    fn build_echo_request(pool: &BufferPool, src: Ipv4Addr, dst: Ipv4Addr, code: u8) -> PooledBuffer {
        let total = IPV4_HEADER_LEN + icmpv4::HEADER_LEN + 4;
        let mut buf = pool.acquire(total);
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.set_version(4);
            ip.set_header_len(IPV4_HEADER_LEN as u8);
            ip.set_total_len(total as u16);
            ip.set_ttl(64);
            ip.set_protocol(Protocol::Icmp);
            ip.set_src_addr(src);
            ip.set_dst_addr(dst);
        }
        {
            let mut icmp = IcmpPacket::new_unchecked(&mut buf[IPV4_HEADER_LEN..]);
            icmp.set_msg_type(icmpv4::TYPE_ECHO_REQUEST);
            icmp.set_msg_code(code);
            icmp.fill_checksum();
        }
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.fill_checksum();
        }
        buf
    }

    #[test]
    fn echo_request_gets_a_reply() {
        let pool = BufferPool::new(1500);
        let buf = build_echo_request(&pool, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(1, 1, 1, 1), 0);
        let pkt = Ipv4Packet::new_checked(buf).unwrap();
        let reply = respond(pkt).expect("echo request should be answered");

        let ip = Ipv4Packet::new_checked(reply).unwrap();
        assert_eq!(ip.src_addr(), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(ip.dst_addr(), Ipv4Addr::new(10, 0, 0, 5));
        let icmp = IcmpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), icmpv4::TYPE_ECHO_REPLY);
        assert!(icmp.verify_checksum());
    }

    #[test]
    fn non_zero_code_is_dropped() {
        let pool = BufferPool::new(1500);
        let buf = build_echo_request(&pool, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(1, 1, 1, 1), 3);
        let pkt = Ipv4Packet::new_checked(buf).unwrap();
        assert!(respond(pkt).is_none());
    }

    #[test]
    fn broadcast_destination_is_dropped() {
        let pool = BufferPool::new(1500);
        let buf = build_echo_request(&pool, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(255, 255, 255, 255), 0);
        let pkt = Ipv4Packet::new_checked(buf).unwrap();
        assert!(respond(pkt).is_none());
    }
}
