use byteorder::{ByteOrder, NetworkEndian};
use std::fmt;

pub use std::net::Ipv4Addr as Address;

use crate::checksum;
use crate::error::{Error, Result};
use crate::wire::Protocol;

pub(crate) trait AddressExt {
    /// Query whether the address is a valid unicast address: not broadcast,
    /// not multicast, not unspecified. ICMP echo responder and the NAT
    /// translator both refuse to act on anything else.
    fn x_is_unicast(&self) -> bool;
}

impl AddressExt for Address {
    fn x_is_unicast(&self) -> bool {
        !(self.is_broadcast() || self.is_multicast() || self.is_unspecified())
    }
}

mod field {
    use crate::wire::field::*;

    pub const VER_HLEN: usize = 0;
    pub const TOS: usize = 1;
    pub const TOTAL_LEN: Field = 2..4;
    pub const IDENT: Field = 4..6;
    pub const FLAGS_FRAG_OFF: Field = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

pub const HEADER_LEN: usize = field::SRC_ADDR.start + 8;
pub const VERSION: u8 = 4;

const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const FRAG_OFFSET_MASK: u16 = 0x1fff;

/// A read/write wrapper around an IPv4 packet buffer. `options`, if any,
/// live between the fixed 20-byte header and the payload; this view does
/// not interpret them, only carries their bytes along for fragmentation and
/// emission.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Validate everything an accessor relies on: minimum length, version,
    /// internal length consistency, and the header checksum.
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        if packet.version() != VERSION {
            return Err(Error::InvalidVersion);
        }
        if !packet.verify_checksum() {
            return Err(Error::InvalidChecksum);
        }
        Ok(packet)
    }

    fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error::InvalidLength);
        }
        let header_len = self.header_len();
        if header_len < HEADER_LEN || header_len > len {
            return Err(Error::InvalidLength);
        }
        let total_len = self.total_len();
        if total_len < header_len || total_len > len {
            return Err(Error::InvalidLength);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VER_HLEN] >> 4
    }

    /// Header length in bytes (the on-wire field is ×4).
    #[inline]
    pub fn header_len(&self) -> usize {
        ((self.buffer.as_ref()[field::VER_HLEN] & 0x0f) as usize) * 4
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::TOTAL_LEN]) as usize
    }

    #[inline]
    pub fn ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::IDENT])
    }

    #[inline]
    pub fn dont_fragment(&self) -> bool {
        let raw = NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS_FRAG_OFF]);
        raw & FLAG_DF != 0
    }

    #[inline]
    pub fn more_fragments(&self) -> bool {
        let raw = NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS_FRAG_OFF]);
        raw & FLAG_MF != 0
    }

    /// Fragment offset in bytes (the on-wire field is ×8).
    #[inline]
    pub fn fragment_offset(&self) -> usize {
        let raw = NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS_FRAG_OFF]);
        ((raw & FRAG_OFFSET_MASK) as usize) * 8
    }

    #[inline]
    pub fn ttl(&self) -> u8 {
        self.buffer.as_ref()[field::TTL]
    }

    #[inline]
    pub fn protocol_raw(&self) -> u8 {
        self.buffer.as_ref()[field::PROTOCOL]
    }

    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_u8(self.protocol_raw())
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    #[inline]
    pub fn src_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        Address::new(data[12], data[13], data[14], data[15])
    }

    #[inline]
    pub fn dst_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        Address::new(data[16], data[17], data[18], data[19])
    }

    pub fn options(&self) -> &[u8] {
        let header_len = self.header_len();
        &self.buffer.as_ref()[HEADER_LEN..header_len]
    }

    pub fn verify_checksum(&self) -> bool {
        let header_len = self.header_len();
        checksum::checksum(0, &self.buffer.as_ref()[..header_len]) == 0
    }

    /// Payload bounded by `total_len`, not by the backing buffer's length:
    /// callers reading a reassembled or truncated packet must see exactly
    /// the bytes this header claims, never trailing garbage.
    pub fn payload(&self) -> &[u8] {
        let header_len = self.header_len();
        let total_len = self.total_len();
        &self.buffer.as_ref()[header_len..total_len]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_version(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        let hlen = data[field::VER_HLEN] & 0x0f;
        data[field::VER_HLEN] = (value << 4) | hlen;
    }

    /// `length` is in bytes; stored on the wire as a ×4 nibble.
    pub fn set_header_len(&mut self, length: u8) {
        let data = self.buffer.as_mut();
        let version = data[field::VER_HLEN] & 0xf0;
        data[field::VER_HLEN] = version | ((length / 4) & 0x0f);
    }

    pub fn set_total_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::TOTAL_LEN], value);
    }

    pub fn set_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::IDENT], value);
    }

    pub fn set_flags_and_fragment_offset(&mut self, df: bool, mf: bool, offset_bytes: usize) {
        let mut raw = ((offset_bytes / 8) as u16) & FRAG_OFFSET_MASK;
        if df {
            raw |= FLAG_DF;
        }
        if mf {
            raw |= FLAG_MF;
        }
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::FLAGS_FRAG_OFF], raw);
    }

    pub fn set_ttl(&mut self, value: u8) {
        self.buffer.as_mut()[field::TTL] = value;
    }

    pub fn set_protocol(&mut self, value: Protocol) {
        self.buffer.as_mut()[field::PROTOCOL] = value as u8;
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value);
    }

    pub fn set_src_addr(&mut self, addr: Address) {
        self.buffer.as_mut()[field::SRC_ADDR].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Address) {
        self.buffer.as_mut()[field::DST_ADDR].copy_from_slice(&addr.octets());
    }

    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        &mut self.buffer.as_mut()[HEADER_LEN..header_len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        let total_len = self.total_len();
        &mut self.buffer.as_mut()[header_len..total_len]
    }

    /// Zero the checksum field, recompute over the header bytes, and write
    /// the result back.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let header_len = self.header_len();
        let value = checksum::checksum(0, &self.buffer.as_ref()[..header_len]);
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
        write!(
            f,
            "IPv4 src={} dst={} proto={:#04x} len={} id={:#06x} df={} mf={} off={}",
            self.src_addr(),
            self.dst_addr(),
            self.protocol_raw(),
            self.total_len(),
            self.ident(),
            self.dont_fragment(),
            self.more_fragments(),
            self.fragment_offset(),
        )
    }
}
