//! Bidirectional TCP 4-tuple ↔ ephemeral-port translation table.
//!
//! A bounded LRU keyed on the guest-observed [`Endpoint`], with a second
//! index over the ephemeral port so a reply arriving from the host listener
//! can be routed back to its original peer. Both lookup directions count as
//! a use for LRU purposes.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use lru::LruCache;

pub const DEFAULT_CAPACITY: usize = 2048;
const EPHEMERAL_PORT_RANGE: std::ops::RangeInclusive<u16> = 20000..=65535;

/// A guest-observed IPv4 address plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Address {
    pub fn new(ip: Ipv4Addr, port: u16) -> Address {
        Address { ip, port }
    }
}

/// The original client-observed 4-tuple: where a flow came from and where
/// it was headed before translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub source: Address,
    pub target: Address,
}

/// An endpoint paired with the ephemeral port standing in for it on the
/// host-side listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub endpoint: Endpoint,
    pub port: u16,
}

/// Cycles `start_probe` through the ephemeral range, returning the first
/// port not present in `by_port` plus the probe value to resume from next
/// time. Pure function of its inputs so it can run either under
/// [`NatTable::find_free_port`]'s own lock or inside
/// [`NatTable::get_or_create`]'s single critical section.
fn probe_free_port(by_port: &HashMap<u16, Endpoint>, start_probe: u32) -> Option<(u16, u32)> {
    let span = (*EPHEMERAL_PORT_RANGE.end() as u32) - (*EPHEMERAL_PORT_RANGE.start() as u32) + 1;
    let mut probe = start_probe;
    for _ in 0..span {
        let candidate = (*EPHEMERAL_PORT_RANGE.start() as u32) + (probe - *EPHEMERAL_PORT_RANGE.start() as u32) % span;
        probe = candidate + 1;
        let candidate = candidate as u16;
        if !by_port.contains_key(&candidate) {
            return Some((candidate, probe));
        }
    }
    None
}

struct Table {
    by_endpoint: LruCache<Endpoint, Binding>,
    by_port: HashMap<u16, Endpoint>,
    next_port_probe: u32,
}

impl Table {
    fn new(capacity: usize) -> Table {
        Table {
            by_endpoint: LruCache::new(std::num::NonZeroUsize::new(capacity).expect("capacity must be nonzero")),
            by_port: HashMap::new(),
            next_port_probe: *EPHEMERAL_PORT_RANGE.start() as u32,
        }
    }
}

/// The NAT table. Every operation is serialized under one lock; the table
/// is the one structure in the datapath that outlives individual packets.
pub struct NatTable {
    inner: Mutex<Table>,
    capacity: usize,
}

impl NatTable {
    pub fn new(capacity: usize) -> NatTable {
        NatTable {
            inner: Mutex::new(Table::new(capacity)),
            capacity,
        }
    }

    /// Inserts a binding, evicting the least-recently-used entry if the
    /// table is already at capacity. Returns the evicted binding, if any.
    pub fn put(&self, binding: Binding) -> Option<Binding> {
        let mut table = self.inner.lock().unwrap();
        let evicted = if table.by_endpoint.len() >= self.capacity && !table.by_endpoint.contains(&binding.endpoint)
        {
            table.by_endpoint.pop_lru()
        } else {
            None
        };
        if let Some((old_endpoint, old_binding)) = &evicted {
            table.by_port.remove(&old_binding.port);
            let _ = old_endpoint;
        }
        table.by_port.insert(binding.port, binding.endpoint);
        table.by_endpoint.put(binding.endpoint, binding);
        evicted.map(|(_, b)| b)
    }

    pub fn get_by_endpoint(&self, endpoint: &Endpoint) -> Option<Binding> {
        let mut table = self.inner.lock().unwrap();
        table.by_endpoint.get(endpoint).copied()
    }

    /// Looks up `endpoint`, allocating and inserting a fresh binding under
    /// the same lock on a miss. The lookup, port allocation, and insert run
    /// as one critical section, so two dispatcher threads racing on distinct
    /// endpoints can never both observe the same port as free and commit
    /// conflicting bindings — unlike composing [`NatTable::find_free_port`]
    /// and [`NatTable::put`] as separate calls, which reopens that race.
    pub fn get_or_create(&self, endpoint: Endpoint) -> Option<Binding> {
        let mut table = self.inner.lock().unwrap();
        if let Some(binding) = table.by_endpoint.get(&endpoint).copied() {
            return Some(binding);
        }

        let (port, next_probe) = probe_free_port(&table.by_port, table.next_port_probe)?;
        table.next_port_probe = next_probe;

        let binding = Binding { endpoint, port };
        let evicted = if table.by_endpoint.len() >= self.capacity && !table.by_endpoint.contains(&endpoint) {
            table.by_endpoint.pop_lru()
        } else {
            None
        };
        if let Some((_, old_binding)) = evicted {
            table.by_port.remove(&old_binding.port);
        }
        table.by_port.insert(port, endpoint);
        table.by_endpoint.put(endpoint, binding);
        Some(binding)
    }

    pub fn get_by_port(&self, port: u16) -> Option<Binding> {
        let mut table = self.inner.lock().unwrap();
        let endpoint = *table.by_port.get(&port)?;
        table.by_endpoint.get(&endpoint).copied()
    }

    /// Cycles a counter through the ephemeral range and returns the first
    /// port not currently bound. Worst-case linear in table size; acceptable
    /// at the bounded capacities this table runs at (see design notes on
    /// replacing this with a free-list if that ever changes).
    pub fn find_free_port(&self) -> Option<u16> {
        let mut table = self.inner.lock().unwrap();
        let (port, next_probe) = probe_free_port(&table.by_port, table.next_port_probe)?;
        table.next_port_probe = next_probe;
        Some(port)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all bindings, as required whenever the host listener's port
    /// changes.
    pub fn reset(&self) {
        let mut table = self.inner.lock().unwrap();
        table.by_endpoint.clear();
        table.by_port.clear();
        table.next_port_probe = *EPHEMERAL_PORT_RANGE.start() as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(a: u8, b: u8, c: u8, d: u8, sport: u16, tport: u16) -> Endpoint {
        Endpoint {
            source: Address::new(Ipv4Addr::new(10, 0, 0, a), sport),
            target: Address::new(Ipv4Addr::new(93, 184, b.wrapping_add(c), d), tport),
        }
    }

    #[test]
    fn bijection_holds_across_inserts() {
        let table = NatTable::new(4);
        for i in 0..4u8 {
            let ep = endpoint(i, 1, 1, i, 40000 + i as u16, 443);
            let port = table.find_free_port().unwrap();
            table.put(Binding { endpoint: ep, port });
        }
        assert_eq!(table.len(), 4);
        for i in 0..4u8 {
            let ep = endpoint(i, 1, 1, i, 40000 + i as u16, 443);
            let binding = table.get_by_endpoint(&ep).expect("present");
            assert_eq!(table.get_by_port(binding.port).unwrap().endpoint, ep);
        }
    }

    #[test]
    fn exact_capacity_evicts_least_recently_used() {
        let table = NatTable::new(2);
        let a = endpoint(1, 0, 0, 1, 1, 1);
        let b = endpoint(2, 0, 0, 2, 2, 2);
        let c = endpoint(3, 0, 0, 3, 3, 3);

        table.put(Binding { endpoint: a, port: 20000 });
        table.put(Binding { endpoint: b, port: 20001 });
        // touch `a` so `b` becomes the LRU entry
        table.get_by_endpoint(&a);
        table.put(Binding { endpoint: c, port: 20002 });

        assert_eq!(table.len(), 2);
        assert!(table.get_by_endpoint(&b).is_none());
        assert!(table.get_by_endpoint(&a).is_some());
        assert!(table.get_by_endpoint(&c).is_some());
        assert!(table.get_by_port(20001).is_none());
    }

    #[test]
    fn find_free_port_stays_in_ephemeral_range() {
        let table = NatTable::new(4);
        for _ in 0..10 {
            let port = table.find_free_port().unwrap();
            assert!(EPHEMERAL_PORT_RANGE.contains(&port));
        }
    }

    #[test]
    fn reset_clears_both_indexes() {
        let table = NatTable::new(4);
        let ep = endpoint(1, 1, 1, 1, 1, 1);
        table.put(Binding { endpoint: ep, port: 20000 });
        table.reset();
        assert_eq!(table.len(), 0);
        assert!(table.get_by_port(20000).is_none());
    }

    #[test]
    fn get_or_create_is_idempotent_for_the_same_endpoint() {
        let table = NatTable::new(4);
        let ep = endpoint(1, 1, 1, 1, 1, 1);
        let first = table.get_or_create(ep).unwrap();
        let second = table.get_or_create(ep).unwrap();
        assert_eq!(first.port, second.port);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_get_or_create_never_assigns_the_same_port_twice() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(NatTable::new(64));
        let handles: Vec<_> = (0..32u8)
            .map(|i| {
                let table = table.clone();
                thread::spawn(move || {
                    let ep = endpoint(i, 1, 1, i, 40000 + i as u16, 443);
                    table.get_or_create(ep).unwrap().port
                })
            })
            .collect();

        let mut ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ports.sort_unstable();
        let before_dedup = ports.len();
        ports.dedup();
        assert_eq!(ports.len(), before_dedup, "two endpoints were assigned the same ephemeral port");
    }
}
