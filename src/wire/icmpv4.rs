use byteorder::{ByteOrder, NetworkEndian};
use std::fmt;

use crate::checksum;
use crate::error::{Error, Result};

/// A read/write wrapper around an ICMPv4 message buffer. Only the echo
/// request/reply subset this stack answers is modeled; other message types
/// are dropped by the caller before a view is even constructed.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const TYPE: usize = 0;
    pub const CODE: usize = 1;
    pub const CHECKSUM: Field = 2..4;
    pub const IDENT: Field = 4..6;
    pub const SEQ_NO: Field = 6..8;
    pub const ECHO_PAYLOAD: Rest = 8..;
}

pub const HEADER_LEN: usize = 8;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_ECHO_REQUEST: u8 = 8;
pub const CODE_ECHO: u8 = 0;

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
        if self.buffer.as_ref().len() < HEADER_LEN {
            return Err(Error::InvalidLength);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    #[inline]
    pub fn msg_type(&self) -> u8 {
        self.buffer.as_ref()[field::TYPE]
    }

    #[inline]
    pub fn msg_code(&self) -> u8 {
        self.buffer.as_ref()[field::CODE]
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    #[inline]
    pub fn ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::IDENT])
    }

    #[inline]
    pub fn seq_no(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SEQ_NO])
    }

    pub fn is_echo_request(&self) -> bool {
        self.msg_type() == TYPE_ECHO_REQUEST && self.msg_code() == CODE_ECHO
    }

    /// No pseudo-header for ICMP: the checksum covers only the ICMP
    /// message itself.
    pub fn verify_checksum(&self) -> bool {
        checksum::checksum(0, self.buffer.as_ref()) == 0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    pub fn echo_payload(&self) -> &'a [u8] {
        &self.buffer.as_ref()[field::ECHO_PAYLOAD]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    #[inline]
    pub fn set_msg_type(&mut self, value: u8) {
        self.buffer.as_mut()[field::TYPE] = value;
    }

    #[inline]
    pub fn set_msg_code(&mut self, value: u8) {
        self.buffer.as_mut()[field::CODE] = value;
    }

    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value);
    }

    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let value = checksum::checksum(0, self.buffer.as_ref());
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
            "ICMP type={} code={} ident={} seq={}",
            self.msg_type(),
            self.msg_code(),
            self.ident(),
            self.seq_no()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_round_trips() {
        let mut buf = vec![0u8; HEADER_LEN + 4];
        {
            let mut pkt = Packet::new_unchecked(&mut buf[..]);
            pkt.set_msg_type(TYPE_ECHO_REQUEST);
            pkt.set_msg_code(CODE_ECHO);
        }
        NetworkEndian::write_u16(&mut buf[field::IDENT], 7);
        NetworkEndian::write_u16(&mut buf[field::SEQ_NO], 1);
        buf[HEADER_LEN..].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        {
            let mut pkt = Packet::new_unchecked(&mut buf[..]);
            pkt.fill_checksum();
        }

        let pkt = Packet::new_checked(&buf[..]).unwrap();
        assert!(pkt.is_echo_request());
        assert!(pkt.verify_checksum());
        assert_eq!(pkt.echo_payload(), &[0xde, 0xad, 0xbe, 0xef]);
    }
}
