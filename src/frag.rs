//! IPv4 fragmentation (outbound) and reassembly (inbound).
//!
//! The two halves share nothing but the buffer pool: the fragmenter turns
//! one oversize datagram into several MTU-sized ones, the reassembler does
//! the reverse under a time and capacity bound.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::pool::{BufferPool, PooledBuffer};
use crate::wire::{Ipv4Address, Ipv4Packet, Protocol, IPV4_HEADER_LEN};

/// How long a tracker survives without a new fragment arriving.
pub const TRACKER_TTL: Duration = Duration::from_secs(120);

/// Default cap on in-flight trackers (`M` in the design notes).
pub const DEFAULT_MAX_TRACKERS: usize = 1024;

/// Splits one IPv4 datagram into an ordered run of MTU-sized fragments.
pub struct Fragmenter {
    pool: BufferPool,
    mtu: usize,
}

impl Fragmenter {
    pub fn new(pool: BufferPool, mtu: usize) -> Fragmenter {
        Fragmenter { pool, mtu }
    }

    /// Consumes the input packet, returning one or more fragments ready for
    /// the tun device. The input's backing buffer is recycled as a side
    /// effect of being dropped at the end of this call.
    pub fn fragment(&self, input: Ipv4Packet<PooledBuffer>) -> Vec<PooledBuffer> {
        let header_len = input.header_len();
        let total_len = input.total_len();

        if total_len <= self.mtu {
            let mut out = self.pool.acquire(total_len);
            out.as_mut()[..total_len].copy_from_slice(&input.as_ref()[..total_len]);
            return vec![out];
        }

        let payload_per_fragment = ((self.mtu - header_len) / 8) * 8;
        if payload_per_fragment == 0 {
            // MTU too small to carry even one 8-byte unit of payload past
            // the header; nothing sane to emit.
            return Vec::new();
        }

        let ident = rand::random::<u16>();
        let ttl = input.ttl();
        let protocol_raw = input.protocol_raw();
        let src = input.src_addr();
        let dst = input.dst_addr();
        let dont_fragment = input.dont_fragment();
        let header = input.as_ref()[..header_len].to_vec();
        let payload = input.payload();
        let payload_len = payload.len();

        let mut fragments = Vec::new();
        let mut offset = 0usize;
        while offset < payload_len {
            let chunk_len = payload_per_fragment.min(payload_len - offset);
            let frag_total = header_len + chunk_len;
            let mut buf = self.pool.acquire(frag_total);
            buf.as_mut()[..header_len].copy_from_slice(&header);
            buf.as_mut()[header_len..frag_total]
                .copy_from_slice(&payload[offset..offset + chunk_len]);

            let more = offset + chunk_len < payload_len;
            let mut pkt = Ipv4Packet::new_unchecked(buf);
            pkt.set_total_len(frag_total as u16);
            pkt.set_ident(ident);
            pkt.set_ttl(ttl);
            pkt.set_flags_and_fragment_offset(dont_fragment, more, offset);
            let _ = protocol_raw; // carried through the cloned header bytes
            let _ = (src, dst); // addresses likewise already cloned in header
            pkt.fill_checksum();
            fragments.push(pkt.into_inner());

            offset += chunk_len;
        }

        fragments
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragKey {
    src: Ipv4Address,
    dst: Ipv4Address,
    ident: u16,
}

struct FragEntry {
    offset: usize,
    payload_len: usize,
    more: bool,
    buffer: PooledBuffer,
}

struct Tracker {
    fragments: Vec<FragEntry>,
    deadline: Instant,
}

/// Outcome of feeding one packet through the reassembler.
pub enum Reassembled {
    /// Not fragmented (or already the sole fragment); pass through as-is.
    Complete(PooledBuffer),
    /// Part of an in-flight datagram; nothing to emit yet.
    Pending,
}

pub struct Reassembler {
    pool: BufferPool,
    trackers: Mutex<HashMap<FragKey, Tracker>>,
    max_trackers: usize,
}

impl Reassembler {
    pub fn new(pool: BufferPool, max_trackers: usize) -> Reassembler {
        Reassembler {
            pool,
            trackers: Mutex::new(HashMap::new()),
            max_trackers,
        }
    }

    fn sweep_expired(&self, trackers: &mut HashMap<FragKey, Tracker>) {
        let now = Instant::now();
        trackers.retain(|_, tracker| tracker.deadline > now);
    }

    /// Feeds one already length/checksum-validated IPv4 packet through
    /// reassembly. Consumes it; fragments that are dropped (blocked,
    /// duplicate, or superseded by an overlap) are recycled as a side
    /// effect of going out of scope.
    pub fn process(&self, packet: Ipv4Packet<PooledBuffer>) -> Result<Reassembled> {
        let offset = packet.fragment_offset();
        let more = packet.more_fragments();

        if offset == 0 && !more {
            return Ok(Reassembled::Complete(packet.into_inner()));
        }

        if packet.dont_fragment() {
            return Err(Error::ReassembleBlocked);
        }

        let key = FragKey {
            src: packet.src_addr(),
            dst: packet.dst_addr(),
            ident: packet.ident(),
        };
        let header_len = packet.header_len();
        let payload_len = packet.payload().len();
        let buffer = packet.into_inner();

        let mut trackers = self.trackers.lock().unwrap();
        self.sweep_expired(&mut trackers);

        if !trackers.contains_key(&key) {
            if trackers.len() >= self.max_trackers {
                return Err(Error::ReassembleBlocked);
            }
            trackers.insert(
                key,
                Tracker {
                    fragments: Vec::new(),
                    deadline: Instant::now() + TRACKER_TTL,
                },
            );
        }

        let tracker = trackers.get_mut(&key).unwrap();
        tracker.deadline = Instant::now() + TRACKER_TTL;

        let insert_at = tracker
            .fragments
            .iter()
            .position(|f| f.offset >= offset)
            .unwrap_or(tracker.fragments.len());

        if let Some(existing) = tracker.fragments.get(insert_at) {
            if existing.offset == offset {
                // Duplicate: keep the first, drop the arrival (buffer
                // recycled when it goes out of scope below).
                return Ok(Reassembled::Pending);
            }
        }
        let overlaps_prev = insert_at > 0
            && tracker.fragments[insert_at - 1].offset + tracker.fragments[insert_at - 1].payload_len
                > offset;
        let overlaps_next = tracker
            .fragments
            .get(insert_at)
            .map(|f| offset + payload_len > f.offset)
            .unwrap_or(false);
        if overlaps_prev || overlaps_next {
            // Conservative policy: drop the whole datagram on any overlap.
            let tracker = trackers.remove(&key).unwrap();
            drop(tracker);
            drop(buffer);
            return Err(Error::ReassembleBlocked);
        }

        tracker.fragments.insert(
            insert_at,
            FragEntry {
                offset,
                payload_len,
                more,
                buffer,
            },
        );

        let mut expected = 0usize;
        let mut complete = false;
        for entry in tracker.fragments.iter() {
            if entry.offset != expected {
                break;
            }
            expected += entry.payload_len;
            if !entry.more {
                complete = true;
                break;
            }
        }
        if !complete {
            return Ok(Reassembled::Pending);
        }

        let total_payload = expected;
        let total_len = header_len + total_payload;
        let mut merged = self.pool.acquire(total_len);
        {
            let first = &tracker.fragments[0];
            merged.as_mut()[..header_len].copy_from_slice(&first.buffer.as_ref()[..header_len]);
        }
        for entry in tracker.fragments.iter() {
            let frag_header_len = Ipv4Packet::new_unchecked(&entry.buffer).header_len();
            let src = &entry.buffer.as_ref()[frag_header_len..frag_header_len + entry.payload_len];
            let dst_start = header_len + entry.offset;
            merged.as_mut()[dst_start..dst_start + entry.payload_len].copy_from_slice(src);
        }

        let mut merged_pkt = Ipv4Packet::new_unchecked(merged);
        merged_pkt.set_total_len(total_len as u16);
        merged_pkt.set_flags_and_fragment_offset(false, false, 0);
        merged_pkt.fill_checksum();

        trackers.remove(&key);

        Ok(Reassembled::Complete(merged_pkt.into_inner()))
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Protocol;

    fn build_udp_datagram(pool: &BufferPool, payload_len: usize) -> PooledBuffer {
        let total = IPV4_HEADER_LEN + 8 + payload_len;
        let mut buf = pool.acquire(total);
        let mut pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
        pkt.set_version(4);
        pkt.set_header_len(IPV4_HEADER_LEN as u8);
        pkt.set_total_len(total as u16);
        pkt.set_ident(0xabcd);
        pkt.set_flags_and_fragment_offset(false, false, 0);
        pkt.set_ttl(64);
        pkt.set_protocol(Protocol::Udp);
        pkt.set_src_addr(Ipv4Address::new(10, 0, 0, 5));
        pkt.set_dst_addr(Ipv4Address::new(93, 184, 216, 34));
        for (i, b) in pkt.payload_mut().iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        pkt.fill_checksum();
        buf
    }

    #[test]
    fn fragments_cover_payload_in_order() {
        let pool = BufferPool::new(1500);
        let buf = build_udp_datagram(&pool, 3000 - IPV4_HEADER_LEN - 8);
        let pkt = Ipv4Packet::new_checked(buf).unwrap();
        let frag = Fragmenter::new(pool, 1500);
        let pieces = frag.fragment(pkt);

        assert_eq!(pieces.len(), 3);
        let offsets: Vec<usize> = pieces
            .iter()
            .map(|p| Ipv4Packet::new_unchecked(p.as_ref()).fragment_offset())
            .collect();
        assert_eq!(offsets, vec![0, 1480, 2960]);
        let mf: Vec<bool> = pieces
            .iter()
            .map(|p| Ipv4Packet::new_unchecked(p.as_ref()).more_fragments())
            .collect();
        assert_eq!(mf, vec![true, true, false]);
    }

    fn clone_buffer(pool: &BufferPool, buf: &PooledBuffer) -> PooledBuffer {
        let mut out = pool.acquire(buf.len());
        out.as_mut().copy_from_slice(buf.as_ref());
        out
    }

    #[test]
    fn reassembles_out_of_order_fragments() {
        let pool = BufferPool::new(1500);
        let original = build_udp_datagram(&pool, 3000 - IPV4_HEADER_LEN - 8);
        let original_payload = original.as_ref()[IPV4_HEADER_LEN..].to_vec();
        let pkt = Ipv4Packet::new_checked(original).unwrap();
        let frag = Fragmenter::new(pool.clone(), 1500);
        let pieces = frag.fragment(pkt);
        assert_eq!(pieces.len(), 3);
        let mut pieces: Vec<Option<PooledBuffer>> = pieces.into_iter().map(Some).collect();

        let reassembler = Reassembler::new(pool, DEFAULT_MAX_TRACKERS);
        let order = [1, 0, 2];
        let mut result = None;
        for &i in order.iter() {
            let piece = pieces[i].take().unwrap();
            let view = Ipv4Packet::new_checked(piece).unwrap();
            match reassembler.process(view).unwrap() {
                Reassembled::Complete(buf) => result = Some(buf),
                Reassembled::Pending => {}
            }
        }
        let merged = result.expect("datagram should complete");
        let merged_pkt = Ipv4Packet::new_checked(merged).unwrap();
        assert_eq!(merged_pkt.payload(), &original_payload[..]);
        assert_eq!(reassembler.tracker_count(), 0);
    }

    #[test]
    fn duplicate_fragment_is_dropped_without_completing() {
        let pool = BufferPool::new(1500);
        let original = build_udp_datagram(&pool, 3000 - IPV4_HEADER_LEN - 8);
        let pkt = Ipv4Packet::new_checked(original).unwrap();
        let frag = Fragmenter::new(pool.clone(), 1500);
        let pieces = frag.fragment(pkt);

        let reassembler = Reassembler::new(pool.clone(), DEFAULT_MAX_TRACKERS);
        let first = clone_buffer(&pool, &pieces[0]);
        let first_again = clone_buffer(&pool, &pieces[0]);

        reassembler
            .process(Ipv4Packet::new_checked(first).unwrap())
            .unwrap();
        reassembler
            .process(Ipv4Packet::new_checked(first_again).unwrap())
            .unwrap();

        assert_eq!(reassembler.tracker_count(), 1);
    }

    #[test]
    fn overlapping_fragment_blocks_the_whole_datagram() {
        let pool = BufferPool::new(1500);
        let original = build_udp_datagram(&pool, 3000 - IPV4_HEADER_LEN - 8);
        let pkt = Ipv4Packet::new_checked(original).unwrap();
        let frag = Fragmenter::new(pool.clone(), 1500);
        let pieces = frag.fragment(pkt);

        let reassembler = Reassembler::new(pool.clone(), DEFAULT_MAX_TRACKERS);
        let first = clone_buffer(&pool, &pieces[0]);
        reassembler
            .process(Ipv4Packet::new_checked(first).unwrap())
            .unwrap();

        // Shift the second fragment's offset back so it overlaps the first.
        let mut overlapping = clone_buffer(&pool, &pieces[1]);
        {
            let mut view = Ipv4Packet::new_unchecked(&mut overlapping[..]);
            let more = view.more_fragments();
            view.set_flags_and_fragment_offset(false, more, 8);
            view.fill_checksum();
        }
        let result = reassembler.process(Ipv4Packet::new_checked(overlapping).unwrap());
        assert!(result.is_err());
        assert_eq!(reassembler.tracker_count(), 0);
    }
}
