use byteorder::{ByteOrder, NetworkEndian};
use std::fmt;

use crate::checksum;
use crate::error::{Error, Result};
use crate::wire::{Ipv4Address, Protocol};

/// A read/write wrapper around a TCP segment buffer. Unlike UDP, TCP
/// carries no length field of its own: the buffer handed to [`Packet`] is
/// expected to be sliced to exactly the segment length already (IP total
/// length minus IP header length), which is also the span the checksum
/// covers.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const DATA_OFF_FLAGS: Field = 12..14;
    pub const WINDOW: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT_PTR: Field = 18..20;
}

pub const HEADER_LEN: usize = field::URGENT_PTR.end;

/// TCP control bits. `NS` lives in the low bit of the byte that also
/// carries the data offset; the rest share the following byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(pub u16);

impl Flags {
    const FIN: u16 = 0x001;
    const SYN: u16 = 0x002;
    const RST: u16 = 0x004;
    const PSH: u16 = 0x008;
    const ACK: u16 = 0x010;
    const URG: u16 = 0x020;
    const ECE: u16 = 0x040;
    const CWR: u16 = 0x080;
    const NS: u16 = 0x100;

    pub const fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }
    pub const fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }
    pub const fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }
    pub const fn psh(self) -> bool {
        self.0 & Self::PSH != 0
    }
    pub const fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }
    pub const fn urg(self) -> bool {
        self.0 & Self::URG != 0
    }
    pub const fn ece(self) -> bool {
        self.0 & Self::ECE != 0
    }
    pub const fn cwr(self) -> bool {
        self.0 & Self::CWR != 0
    }
    pub const fn ns(self) -> bool {
        self.0 & Self::NS != 0
    }

    /// True for a bare SYN (no other bits set): the one case the NAT table
    /// is allowed to mint a new binding for.
    pub const fn is_syn_only(self) -> bool {
        self.0 == Self::SYN
    }

    pub const fn syn_ack() -> Flags {
        Flags(Self::SYN | Self::ACK)
    }
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error::InvalidLength);
        }
        let data_offset = self.header_len();
        if data_offset < HEADER_LEN || data_offset > len {
            return Err(Error::InvalidLength);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    #[inline]
    pub fn seq_num(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::SEQ_NUM])
    }

    #[inline]
    pub fn ack_num(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::ACK_NUM])
    }

    /// Data offset in bytes (the on-wire nibble is ×4): where the payload
    /// begins, after any options.
    #[inline]
    pub fn header_len(&self) -> usize {
        let raw = NetworkEndian::read_u16(&self.buffer.as_ref()[field::DATA_OFF_FLAGS]);
        ((raw >> 12) as usize) * 4
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        let raw = NetworkEndian::read_u16(&self.buffer.as_ref()[field::DATA_OFF_FLAGS]);
        Flags(raw & 0x01ff)
    }

    #[inline]
    pub fn window(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WINDOW])
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    pub fn verify_checksum(&self, src_addr: Ipv4Address, dst_addr: Ipv4Address) -> bool {
        let data = self.buffer.as_ref();
        let pseudo = checksum::pseudo_header(src_addr, dst_addr, Protocol::Tcp, data.len() as u16);
        checksum::checksum(pseudo, data) == 0
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        let header_len = self.header_len();
        &self.buffer.as_ref()[header_len..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC_PORT], value)
    }

    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST_PORT], value)
    }

    #[inline]
    pub fn set_seq_num(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::SEQ_NUM], value)
    }

    #[inline]
    pub fn set_ack_num(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::ACK_NUM], value)
    }

    pub fn set_header_len_and_flags(&mut self, header_len: u8, flags: Flags) {
        let raw = (((header_len / 4) as u16) << 12) | (flags.0 & 0x01ff);
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DATA_OFF_FLAGS], raw);
    }

    #[inline]
    pub fn set_window(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::WINDOW], value)
    }

    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value)
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        &mut self.buffer.as_mut()[header_len..]
    }

    /// Zeroes and restores the checksum under a scoped guard so the caller
    /// can keep mutating the view afterwards without needing to remember
    /// that the field was disturbed.
    pub fn fill_checksum(&mut self, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        self.set_checksum(0);
        let len = self.buffer.as_ref().len() as u16;
        let pseudo = checksum::pseudo_header(src_addr, dst_addr, Protocol::Tcp, len);
        let value = checksum::checksum(pseudo, self.buffer.as_ref());
        self.set_checksum(value);
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl<T: AsRef<[u8]>> fmt::Display for Packet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flags = self.flags();
        write!(
            f,
            "TCP src={} dst={} seq={} ack={} syn={} ack_flag={} fin={} rst={}",
            self.src_port(),
            self.dst_port(),
            self.seq_num(),
            self.ack_num(),
            flags.syn(),
            flags.ack(),
            flags.fin(),
            flags.rst(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(flags: Flags) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        let mut pkt = Packet::new_unchecked(&mut buf[..]);
        pkt.set_src_port(40000);
        pkt.set_dst_port(443);
        pkt.set_seq_num(1);
        pkt.set_ack_num(0);
        pkt.set_header_len_and_flags(HEADER_LEN as u8, flags);
        pkt.set_window(65535);
        let src = Ipv4Address::new(10, 0, 0, 5);
        let dst = Ipv4Address::new(93, 184, 216, 34);
        pkt.fill_checksum(src, dst);
        buf
    }

    #[test]
    fn syn_only_is_detected() {
        let buf = sample(Flags(Flags::SYN));
        let pkt = Packet::new_checked(&buf[..]).unwrap();
        assert!(pkt.flags().is_syn_only());
        assert!(!Flags(Flags::SYN | Flags::ACK).is_syn_only());
    }

    #[test]
    fn checksum_round_trips() {
        let buf = sample(Flags(Flags::SYN));
        let pkt = Packet::new_checked(&buf[..]).unwrap();
        let src = Ipv4Address::new(10, 0, 0, 5);
        let dst = Ipv4Address::new(93, 184, 216, 34);
        assert!(pkt.verify_checksum(src, dst));
    }

    #[test]
    fn rewriting_addresses_requires_checksum_refill() {
        let mut buf = sample(Flags::syn_ack());
        {
            let mut pkt = Packet::new_unchecked(&mut buf[..]);
            pkt.set_src_port(443);
            pkt.set_dst_port(40000);
            pkt.fill_checksum(Ipv4Address::new(93, 184, 216, 34), Ipv4Address::new(10, 0, 0, 5));
        }
        let pkt = Packet::new_checked(&buf[..]).unwrap();
        assert!(pkt.verify_checksum(Ipv4Address::new(93, 184, 216, 34), Ipv4Address::new(10, 0, 0, 5)));
        assert!(pkt.flags().syn() && pkt.flags().ack());
    }
}
