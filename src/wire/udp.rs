use byteorder::{ByteOrder, NetworkEndian};
use std::fmt;

use crate::checksum;
use crate::error::{Error, Result};
use crate::wire::{Ipv4Address, Protocol};

/// A read/write wrapper around a UDP datagram buffer.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const LENGTH: Field = 4..6;
    pub const CHECKSUM: Field = 6..8;
}

pub const HEADER_LEN: usize = field::CHECKSUM.end;

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensures no accessor will panic: the buffer holds at least a header,
    /// and the length field does not claim more than the buffer holds.
    pub fn check_len(&self) -> Result<()> {
        let buffer_len = self.buffer.as_ref().len();
        if buffer_len < HEADER_LEN {
            return Err(Error::InvalidLength);
        }
        let field_len = self.len() as usize;
        if buffer_len < field_len || field_len < HEADER_LEN {
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

    /// Header + payload length, as carried on the wire.
    #[inline]
    pub fn len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::LENGTH])
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    /// RFC 768: a zero on-wire checksum means "not computed"; skip
    /// verification in that case rather than treating it as corrupt.
    pub fn verify_checksum(&self, src_addr: Ipv4Address, dst_addr: Ipv4Address) -> bool {
        if self.checksum() == 0 {
            return true;
        }
        let data = self.buffer.as_ref();
        let pseudo = checksum::pseudo_header(src_addr, dst_addr, Protocol::Udp, self.len());
        checksum::checksum(pseudo, &data[..self.len() as usize]) == 0
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        let length = self.len() as usize;
        &self.buffer.as_ref()[HEADER_LEN..length]
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
    pub fn set_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::LENGTH], value)
    }

    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value)
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let length = self.len() as usize;
        &mut self.buffer.as_mut()[HEADER_LEN..length]
    }

    /// Always emits a valid non-zero checksum (never the RFC 768
    /// all-zero "not computed" escape hatch).
    pub fn fill_checksum(&mut self, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        self.set_checksum(0);
        let length = self.len();
        let pseudo = checksum::pseudo_header(src_addr, dst_addr, Protocol::Udp, length);
        let value = checksum::checksum(pseudo, &self.buffer.as_ref()[..length as usize]);
        self.set_checksum(if value == 0 { 0xffff } else { value });
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl<T: AsRef<[u8]>> fmt::Display for Packet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "UDP src={} dst={} len={}",
            self.src_port(),
            self.dst_port(),
            self.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_payload_is_valid() {
        let mut buf = vec![0u8; HEADER_LEN];
        let mut pkt = Packet::new_unchecked(&mut buf[..]);
        pkt.set_src_port(1);
        pkt.set_dst_port(2);
        pkt.set_len(HEADER_LEN as u16);
        let src = Ipv4Address::new(10, 0, 0, 1);
        let dst = Ipv4Address::new(10, 0, 0, 2);
        pkt.fill_checksum(src, dst);

        let pkt = Packet::new_checked(&buf[..]).unwrap();
        assert!(pkt.verify_checksum(src, dst));
        assert!(pkt.payload().is_empty());
    }

    #[test]
    fn on_wire_checksum_is_never_zero() {
        let mut buf = vec![0u8; HEADER_LEN + 2];
        let mut pkt = Packet::new_unchecked(&mut buf[..]);
        pkt.set_src_port(1);
        pkt.set_dst_port(2);
        pkt.set_len((HEADER_LEN + 2) as u16);
        pkt.payload_mut().copy_from_slice(&[0, 0]);
        pkt.fill_checksum(Ipv4Address::UNSPECIFIED, Ipv4Address::UNSPECIFIED);
        let pkt = Packet::new_unchecked(&buf[..]);
        assert_ne!(pkt.checksum(), 0);
    }

    #[test]
    fn zero_on_wire_checksum_skips_verification() {
        let mut buf = vec![0u8; HEADER_LEN + 4];
        let mut pkt = Packet::new_unchecked(&mut buf[..]);
        pkt.set_src_port(1);
        pkt.set_dst_port(2);
        pkt.set_len((HEADER_LEN + 4) as u16);
        pkt.payload_mut().copy_from_slice(b"test");
        pkt.set_checksum(0);

        let pkt = Packet::new_checked(&buf[..]).unwrap();
        assert!(pkt.verify_checksum(Ipv4Address::new(1, 1, 1, 1), Ipv4Address::new(2, 2, 2, 2)));
    }
}
