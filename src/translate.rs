//! TCP address/port translation: the part of the system that lets a host
//! TCP listener stand in for every guest-originated connection.
//!
//! Two directions are handled, distinguished purely by the packet's
//! destination address against the configured mirror:
//!
//! - guest → internet: mint or reuse a binding, rewrite toward the mirror
//!   and the host listener's ephemeral port.
//! - host listener → guest: rewrite back to the original 4-tuple using the
//!   binding recovered from the destination port.

use log::{debug, trace};
use std::net::Ipv4Addr;

use crate::nat::{Address as NatAddress, Endpoint, NatTable};
use crate::pool::PooledBuffer;
use crate::wire::{Ipv4Packet, TcpPacket};

/// Static addressing context the translator rewrites packets against.
#[derive(Debug, Clone, Copy)]
pub struct TranslatorConfig {
    /// Gateway address: the guest's default route on the tun subnet.
    pub gateway: Ipv4Addr,
    /// Mirror address: routed through the tun, stands in for the host
    /// listener from the guest's point of view.
    pub mirror: Ipv4Addr,
}

pub struct Translator<'a> {
    config: TranslatorConfig,
    nat: &'a NatTable,
    listener_port: u16,
}

/// What the caller should do with a packet after translation.
pub enum Outcome {
    /// Rewritten packet, ready for the encoder.
    Forward(PooledBuffer),
    /// Nothing to emit; the packet was consumed without producing a reply
    /// (dropped silently per the rules in §4.6).
    Drop,
}

impl<'a> Translator<'a> {
    pub fn new(config: TranslatorConfig, nat: &'a NatTable, listener_port: u16) -> Translator<'a> {
        Translator { config, nat, listener_port }
    }

    /// Translates one already-validated IPv4/TCP packet. Consumes the input
    /// buffer; on drop paths it is simply not forwarded (recycled when the
    /// caller's owning value goes out of scope).
    pub fn translate(&self, packet: Ipv4Packet<PooledBuffer>) -> Outcome {
        let dst = packet.dst_addr();
        if dst == self.config.mirror {
            self.translate_reply(packet)
        } else {
            self.translate_outbound(packet)
        }
    }

    fn translate_outbound(&self, packet: Ipv4Packet<PooledBuffer>) -> Outcome {
        let src_addr = packet.src_addr();
        let dst_addr = packet.dst_addr();
        let header_len = packet.header_len();
        let mut buffer = packet.into_inner();

        let tcp_view = TcpPacket::new_unchecked(&buffer.as_ref()[header_len..]);
        let src_port = tcp_view.src_port();
        let dst_port = tcp_view.dst_port();
        let flags = tcp_view.flags();

        let endpoint = Endpoint {
            source: NatAddress::new(src_addr, src_port),
            target: NatAddress::new(dst_addr, dst_port),
        };

        let binding = if let Some(binding) = self.nat.get_by_endpoint(&endpoint) {
            binding
        } else {
            if !flags.is_syn_only() {
                trace!("dropping mid-flow TCP with no binding: {:?}", endpoint);
                return Outcome::Drop;
            }
            match self.nat.get_or_create(endpoint) {
                Some(binding) => binding,
                None => {
                    debug!("ephemeral port space exhausted");
                    return Outcome::Drop;
                }
            }
        };

        let mut ip = Ipv4Packet::new_unchecked(&mut buffer[..]);
        ip.set_src_addr(self.config.mirror);
        ip.set_dst_addr(self.config.gateway);
        {
            let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
            tcp.set_src_port(binding.port);
            tcp.set_dst_port(self.listener_port);
            tcp.fill_checksum(self.config.mirror, self.config.gateway);
        }
        ip.fill_checksum();

        Outcome::Forward(buffer)
    }

    fn translate_reply(&self, packet: Ipv4Packet<PooledBuffer>) -> Outcome {
        let header_len = packet.header_len();
        let mut buffer = packet.into_inner();

        let tcp_view = TcpPacket::new_unchecked(&buffer.as_ref()[header_len..]);
        let src_port = tcp_view.src_port();
        let dst_port = tcp_view.dst_port();

        if src_port != self.listener_port {
            trace!("reply from unexpected source port {}", src_port);
            return Outcome::Drop;
        }

        let binding = match self.nat.get_by_port(dst_port) {
            Some(b) => b,
            None => {
                trace!("no binding for ephemeral port {}", dst_port);
                return Outcome::Drop;
            }
        };

        let mut ip = Ipv4Packet::new_unchecked(&mut buffer[..]);
        ip.set_src_addr(binding.endpoint.target.ip);
        ip.set_dst_addr(binding.endpoint.source.ip);
        {
            let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
            tcp.set_src_port(binding.endpoint.target.port);
            tcp.set_dst_port(binding.endpoint.source.port);
            tcp.fill_checksum(binding.endpoint.target.ip, binding.endpoint.source.ip);
        }
        ip.fill_checksum();

        Outcome::Forward(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::wire::{Protocol, TcpFlags, IPV4_HEADER_LEN, TCP_MIN_HEADER_LEN};

    fn build_syn(pool: &BufferPool, src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> PooledBuffer {
        let total = IPV4_HEADER_LEN + TCP_MIN_HEADER_LEN;
        let mut buf = pool.acquire(total);
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.set_version(4);
            ip.set_header_len(IPV4_HEADER_LEN as u8);
            ip.set_total_len(total as u16);
            ip.set_ttl(64);
            ip.set_protocol(Protocol::Tcp);
            ip.set_src_addr(src);
            ip.set_dst_addr(dst);
        }
        {
            let mut tcp = TcpPacket::new_unchecked(&mut buf[IPV4_HEADER_LEN..]);
            tcp.set_src_port(sport);
            tcp.set_dst_port(dport);
            tcp.set_seq_num(1);
            tcp.set_header_len_and_flags(20, TcpFlags(0x002));
            tcp.set_window(65535);
            tcp.fill_checksum(src, dst);
        }
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.fill_checksum();
        }
        buf
    }

    #[test]
    fn syn_allocates_a_binding_and_rewrites() {
        let pool = BufferPool::new(1500);
        let nat = NatTable::new(16);
        let config = TranslatorConfig {
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            mirror: Ipv4Addr::new(10, 0, 0, 254),
        };
        let translator = Translator::new(config, &nat, 9000);

        let buf = build_syn(
            &pool,
            Ipv4Addr::new(10, 0, 0, 5),
            40000,
            Ipv4Addr::new(93, 184, 216, 34),
            443,
        );
        let pkt = Ipv4Packet::new_checked(buf).unwrap();
        let out = translator.translate(pkt);
        let forwarded = match out {
            Outcome::Forward(b) => b,
            Outcome::Drop => panic!("expected forward"),
        };
        let ip = Ipv4Packet::new_checked(forwarded).unwrap();
        assert_eq!(ip.src_addr(), config.mirror);
        assert_eq!(ip.dst_addr(), config.gateway);
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(tcp.dst_port(), 9000);
        assert!((20000..=65535).contains(&tcp.src_port()));
        assert!(tcp.verify_checksum(config.mirror, config.gateway));

        let recovered = nat.get_by_port(tcp.src_port()).unwrap();
        assert_eq!(recovered.endpoint.source.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(recovered.endpoint.source.port, 40000);
    }

    #[test]
    fn mid_flow_non_syn_with_no_binding_is_dropped() {
        let pool = BufferPool::new(1500);
        let nat = NatTable::new(16);
        let config = TranslatorConfig {
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            mirror: Ipv4Addr::new(10, 0, 0, 254),
        };
        let translator = Translator::new(config, &nat, 9000);

        let mut buf = build_syn(
            &pool,
            Ipv4Addr::new(10, 0, 0, 5),
            40001,
            Ipv4Addr::new(93, 184, 216, 34),
            443,
        );
        {
            let mut tcp = TcpPacket::new_unchecked(&mut buf[IPV4_HEADER_LEN..]);
            tcp.set_header_len_and_flags(20, TcpFlags(0x010)); // ACK only
            tcp.fill_checksum(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(93, 184, 216, 34));
        }
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.fill_checksum();
        }

        let pkt = Ipv4Packet::new_checked(buf).unwrap();
        assert!(matches!(translator.translate(pkt), Outcome::Drop));
        assert_eq!(nat.len(), 0);
    }

    #[test]
    fn reply_is_rewritten_back_to_original_endpoint() {
        let pool = BufferPool::new(1500);
        let nat = NatTable::new(16);
        let config = TranslatorConfig {
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            mirror: Ipv4Addr::new(10, 0, 0, 254),
        };
        let translator = Translator::new(config, &nat, 9000);

        let syn = build_syn(
            &pool,
            Ipv4Addr::new(10, 0, 0, 5),
            40000,
            Ipv4Addr::new(93, 184, 216, 34),
            443,
        );
        let forwarded = match translator.translate(Ipv4Packet::new_checked(syn).unwrap()) {
            Outcome::Forward(b) => b,
            Outcome::Drop => panic!("expected forward"),
        };
        let ephemeral_port = TcpPacket::new_checked(Ipv4Packet::new_checked(forwarded).unwrap().payload())
            .unwrap()
            .src_port();

        let reply = build_syn(
            &pool,
            config.gateway,
            9000,
            config.mirror,
            ephemeral_port,
        );
        let reply_pkt = Ipv4Packet::new_checked(reply).unwrap();
        let out = translator.translate(reply_pkt);
        let forwarded = match out {
            Outcome::Forward(b) => b,
            Outcome::Drop => panic!("expected forward reply"),
        };
        let ip = Ipv4Packet::new_checked(forwarded).unwrap();
        assert_eq!(ip.src_addr(), Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(ip.dst_addr(), Ipv4Addr::new(10, 0, 0, 5));
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(tcp.src_port(), 443);
        assert_eq!(tcp.dst_port(), 40000);
    }
}
