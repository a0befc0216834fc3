//! The agent's per-interface flow cache: key construction, aggregation and
//! the four-condition aging/eviction policy.

use std::collections::HashMap;

use crate::flow::{FlowEntry, FlowKey, PacketObservation};

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub cache_limit: usize,
    pub active_timeout: f64,
    pub inactive_timeout: f64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        CacheLimits {
            cache_limit: 1024,
            active_timeout: 1800.0,
            inactive_timeout: 15.0,
        }
    }
}

/// Why an entry was evicted, in priority order: shutdown drain first,
/// then overflow, then TCP termination, then the two timeouts. Exactly one
/// reason applies to any given emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgingReason {
    Shutdown,
    Overflow,
    TcpEnd,
    ActiveTimeout,
    InactiveTimeout,
}

pub struct FlowCache {
    entries: HashMap<FlowKey, FlowEntry>,
    limits: CacheLimits,
}

impl FlowCache {
    pub fn new(limits: CacheLimits) -> Self {
        FlowCache {
            entries: HashMap::new(),
            limits,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies the update rule for one packet (insert-or-aggregate), then
    /// runs the full aging pass and returns every entry evicted as a
    /// consequence — at most one overflow eviction, plus any number of
    /// TCP-end/active/inactive evictions discovered on this pass. The cache
    /// never holds more than `cache_limit` entries once this returns.
    pub fn observe(&mut self, obs: &PacketObservation, now: f64) -> Vec<(FlowEntry, AgingReason)> {
        let key = FlowKey::from_observation(obs);
        let mut evicted = Vec::new();

        // A packet that would push its own flow past active_timeout cuts the
        // existing entry loose first and starts a fresh one from this packet,
        // rather than folding it in and then immediately re-aging it away.
        if let Some(entry) = self.entries.get(&key) {
            if now - entry.fields.start_time > self.limits.active_timeout {
                if let Some(stale) = self.entries.remove(&key) {
                    evicted.push((stale, AgingReason::ActiveTimeout));
                }
            }
        }

        self.entries
            .entry(key.clone())
            .and_modify(|e| e.observe(obs, now))
            .or_insert_with(|| FlowEntry::new(key, obs, now));

        evicted.extend(self.age(now, false));
        evicted
    }

    /// Shutdown drain: evicts every remaining entry regardless of its
    /// individual aging condition, so no live flow is lost on teardown.
    pub fn drain_all(&mut self) -> Vec<(FlowEntry, AgingReason)> {
        self.age(f64::INFINITY, true)
    }

    fn age(&mut self, now: f64, shutdown: bool) -> Vec<(FlowEntry, AgingReason)> {
        let mut evicted = Vec::new();

        if shutdown {
            for (_, entry) in self.entries.drain() {
                evicted.push((entry, AgingReason::Shutdown));
            }
            return evicted;
        }

        // Overflow eviction: at most one per packet, smallest start_time
        // wins, ties broken arbitrarily.
        if self.entries.len() > self.limits.cache_limit {
            if let Some(oldest_key) = self
                .entries
                .iter()
                .min_by(|a, b| a.1.fields.start_time.partial_cmp(&b.1.fields.start_time).unwrap())
                .map(|(k, _)| k.clone())
            {
                if let Some(entry) = self.entries.remove(&oldest_key) {
                    evicted.push((entry, AgingReason::Overflow));
                }
            }
        }

        // Scan remaining entries for terminal/timeout aging.
        let stale: Vec<(FlowKey, AgingReason)> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                let f = &entry.fields;
                if f.flags.contains('F') || f.flags.contains('R') {
                    Some((key.clone(), AgingReason::TcpEnd))
                } else if f.end_time - f.start_time > self.limits.active_timeout {
                    Some((key.clone(), AgingReason::ActiveTimeout))
                } else if now - f.end_time > self.limits.inactive_timeout {
                    Some((key.clone(), AgingReason::InactiveTimeout))
                } else {
                    None
                }
            })
            .collect();

        for (key, reason) in stale {
            if let Some(entry) = self.entries.remove(&key) {
                evicted.push((entry, reason));
            }
        }

        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::TcpFlags;

    fn udp_obs(ifname: &str, sport: u16, len: u64) -> PacketObservation {
        PacketObservation {
            ifname: ifname.to_string(),
            src_ip: "10.0.0.1".into(),
            dst_ip: "10.0.0.2".into(),
            proto: 17,
            tos: 0,
            length: len,
            src_port: sport,
            dst_port: 53,
            flags: TcpFlags::none(),
        }
    }

    fn tcp_obs(sport: u16, len: u64, flags: &str) -> PacketObservation {
        PacketObservation {
            ifname: "eth0".into(),
            src_ip: "1.1.1.1".into(),
            dst_ip: "2.2.2.2".into(),
            proto: 6,
            tos: 0,
            length: len,
            src_port: sport,
            dst_port: 80,
            flags: TcpFlags::from_letters(flags),
        }
    }

    #[test]
    fn single_udp_flow_ages_out_on_inactivity() {
        let obs = udp_obs("", 1000, 128);
        let mut cache = FlowCache::new(CacheLimits::default());
        cache.observe(&obs, 100.0);
        // simulate time passing without further packets on that flow by
        // observing a distinct key far enough in the future
        let other = udp_obs("", 2, 1);
        let evicted = cache.observe(&other, 116.1);
        let hit = evicted.iter().find(|(e, _)| e.key.src_port == 1000);
        assert!(hit.is_some());
        let (entry, reason) = hit.unwrap();
        assert_eq!(reason, &AgingReason::InactiveTimeout);
        assert_eq!(entry.fields.bytes, 128);
        assert_eq!(entry.fields.packets, 1);
        assert_eq!(entry.fields.flags, "None");
        assert_eq!(entry.key.to_wire_string(), ",10.0.0.1,10.0.0.2,17,1000,53,0");
    }

    #[test]
    fn tcp_fin_ages_immediately() {
        let mut cache = FlowCache::new(CacheLimits::default());
        assert!(cache.observe(&tcp_obs(5000, 60, "S"), 1.0).is_empty());
        assert!(cache.observe(&tcp_obs(5000, 500, "A"), 1.1).is_empty());
        let evicted = cache.observe(&tcp_obs(5000, 40, "FA"), 1.2);
        assert_eq!(evicted.len(), 1);
        let (entry, reason) = &evicted[0];
        assert_eq!(reason, &AgingReason::TcpEnd);
        assert_eq!(entry.fields.bytes, 600);
        assert_eq!(entry.fields.packets, 3);
        assert!(entry.fields.flags.contains('F'));
    }

    #[test]
    fn active_timeout_emits_and_restarts() {
        let mut cache = FlowCache::new(CacheLimits {
            cache_limit: 1024,
            active_timeout: 5.0,
            inactive_timeout: 1000.0,
        });
        cache.observe(&udp_obs("", 1, 10), 0.0);
        let evicted = cache.observe(&udp_obs("", 1, 10), 6.0);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].1, AgingReason::ActiveTimeout);
        assert_eq!(cache.len(), 1);
        let entry = cache.entries.values().next().unwrap();
        assert_eq!(entry.fields.start_time, 6.0);
    }

    #[test]
    fn overflow_evicts_oldest_start_time() {
        let mut cache = FlowCache::new(CacheLimits {
            cache_limit: 4,
            active_timeout: 10_000.0,
            inactive_timeout: 10_000.0,
        });
        for i in 0..4u16 {
            assert!(cache.observe(&udp_obs("", i, 1), i as f64).is_empty());
        }
        assert_eq!(cache.len(), 4);
        let evicted = cache.observe(&udp_obs("", 99, 1), 10.0);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].1, AgingReason::Overflow);
        assert_eq!(evicted[0].0.key.src_port, 0);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn shutdown_drains_every_entry() {
        let mut cache = FlowCache::new(CacheLimits::default());
        for i in 0..10u16 {
            cache.observe(&udp_obs("", i, 1), 0.0);
        }
        assert_eq!(cache.len(), 10);
        let evicted = cache.drain_all();
        assert_eq!(evicted.len(), 10);
        assert!(evicted.iter().all(|(_, r)| *r == AgingReason::Shutdown));
        assert!(cache.is_empty());
    }
}
