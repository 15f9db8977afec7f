use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use vmbridge_packet::{is_broadcast_or_multicast, MacAddr};

use crate::bridge::PortId;

pub const DEFAULT_MAC_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAC_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct MacEntry {
    port: PortId,
    last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    New,
    Refreshed,
    /// The address showed up behind a different port.
    Moved { from: PortId },
    /// Group addresses are never learned.
    Ignored,
}

/// Source MAC -> port it was last seen on.
///
/// Ordered by last sighting, so the least recently seen address is both the first to expire and
/// the one evicted when the table is full.
pub struct MacTable {
    entries: LruCache<MacAddr, MacEntry>,
    ttl: Duration,
}

impl MacTable {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn learn(&mut self, mac: MacAddr, port: PortId, now: Instant) -> Learned {
        if is_broadcast_or_multicast(&mac) {
            return Learned::Ignored;
        }
        let entry = MacEntry {
            port,
            last_seen: now,
        };
        match self.entries.put(mac, entry) {
            None => Learned::New,
            Some(old) if old.port == port => Learned::Refreshed,
            Some(old) => Learned::Moved { from: old.port },
        }
    }

    /// Port `mac` was last seen on, unless that sighting has expired.
    pub fn lookup(&mut self, mac: &MacAddr, now: Instant) -> Option<PortId> {
        let entry = *self.entries.peek(mac)?;
        if now.saturating_duration_since(entry.last_seen) >= self.ttl {
            self.entries.pop(mac);
            return None;
        }
        Some(entry.port)
    }

    /// Forget every address learned on `port`.
    pub fn purge_port(&mut self, port: PortId) -> usize {
        let stale: Vec<MacAddr> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.port == port)
            .map(|(mac, _)| *mac)
            .collect();
        for mac in &stale {
            self.entries.pop(mac);
        }
        stale.len()
    }

    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((_, entry)) = self.entries.peek_lru() {
            if now.saturating_duration_since(entry.last_seen) < self.ttl {
                break;
            }
            self.entries.pop_lru();
            expired += 1;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, last])
    }

    fn table(capacity: usize) -> MacTable {
        MacTable::new(NonZeroUsize::new(capacity).unwrap(), Duration::from_secs(300))
    }

    #[test]
    fn learns_and_moves() {
        let mut t = table(8);
        let now = Instant::now();
        assert_eq!(t.learn(mac(1), PortId(1), now), Learned::New);
        assert_eq!(t.learn(mac(1), PortId(1), now), Learned::Refreshed);
        assert_eq!(
            t.learn(mac(1), PortId(2), now),
            Learned::Moved { from: PortId(1) }
        );
        assert_eq!(t.lookup(&mac(1), now), Some(PortId(2)));
    }

    #[test]
    fn group_sources_are_not_learned() {
        let mut t = table(8);
        let now = Instant::now();
        assert_eq!(t.learn(MacAddr::BROADCAST, PortId(1), now), Learned::Ignored);
        assert_eq!(
            t.learn(MacAddr([0x01, 0x00, 0x5e, 0, 0, 1]), PortId(1), now),
            Learned::Ignored
        );
        assert!(t.is_empty());
    }

    #[test]
    fn entries_expire() {
        let mut t = table(8);
        let t0 = Instant::now();
        t.learn(mac(1), PortId(1), t0);
        t.learn(mac(2), PortId(1), t0 + Duration::from_secs(200));

        assert_eq!(t.lookup(&mac(1), t0 + Duration::from_secs(299)), Some(PortId(1)));
        assert_eq!(t.expire(t0 + Duration::from_secs(300)), 1);
        assert_eq!(t.lookup(&mac(1), t0 + Duration::from_secs(300)), None);
        assert_eq!(t.lookup(&mac(2), t0 + Duration::from_secs(300)), Some(PortId(1)));
        assert_eq!(t.lookup(&mac(2), t0 + Duration::from_secs(500)), None);
        assert!(t.is_empty());
    }

    #[test]
    fn full_table_evicts_oldest_sighting() {
        let mut t = table(2);
        let now = Instant::now();
        t.learn(mac(1), PortId(1), now);
        t.learn(mac(2), PortId(2), now);
        t.learn(mac(1), PortId(1), now);
        t.learn(mac(3), PortId(3), now);

        assert_eq!(t.len(), 2);
        assert_eq!(t.lookup(&mac(2), now), None);
        assert_eq!(t.lookup(&mac(1), now), Some(PortId(1)));
    }

    #[test]
    fn purge_removes_only_that_port() {
        let mut t = table(8);
        let now = Instant::now();
        t.learn(mac(1), PortId(1), now);
        t.learn(mac(2), PortId(1), now);
        t.learn(mac(3), PortId(2), now);

        assert_eq!(t.purge_port(PortId(1)), 2);
        assert_eq!(t.lookup(&mac(1), now), None);
        assert_eq!(t.lookup(&mac(3), now), Some(PortId(2)));
    }
}
