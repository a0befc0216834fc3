//! Flow keys, cache entries and the wire/persisted record shapes.

use serde::{Deserialize, Serialize};

/// A single packet observation, as dissected off the wire by the agent's
/// [`crate::agent::processor`]. Transient: it lives only long enough to be
/// folded into a [`FlowEntry`].
#[derive(Debug, Clone, PartialEq)]
pub struct PacketObservation {
    pub ifname: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub proto: u8,
    pub tos: u8,
    pub length: u64,
    pub src_port: u16,
    pub dst_port: u16,
    /// `None` for non-TCP datagrams, `Some("None")` is never produced —
    /// absence of TCP is represented as `Flags::none()`.
    pub flags: TcpFlags,
}

/// Textual union of observed TCP flags, matching the wire representation
/// `"None"` | any subset of `"FSRPAUEC"` written as the flag letters seen so
/// far. Accumulates across updates (see `FlowEntry::observe`) rather than
/// being overwritten by the latest packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcpFlags(String);

impl TcpFlags {
    pub fn none() -> Self {
        TcpFlags("None".to_string())
    }

    pub fn from_letters(letters: &str) -> Self {
        if letters.is_empty() {
            TcpFlags::none()
        } else {
            TcpFlags(letters.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn contains(&self, c: char) -> bool {
        self.0.contains(c)
    }

    /// OR-accumulate `other` into `self`, keeping each flag letter at most
    /// once, so the FIN/RST aging rule stays monotone over a flow's
    /// lifetime instead of depending on the latest packet's flags.
    pub fn merge(&mut self, other: &TcpFlags) {
        if other.0 == "None" {
            return;
        }
        if self.0 == "None" {
            self.0.clear();
        }
        for c in other.0.chars() {
            if !self.0.contains(c) {
                self.0.push(c);
            }
        }
    }
}

/// The 7-tuple identifying a flow. `ifname` leads so that the same source
/// interface never collides with another's otherwise-identical 6-tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ifname: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub tos: u8,
}

impl FlowKey {
    pub fn from_observation(obs: &PacketObservation) -> Self {
        FlowKey {
            ifname: obs.ifname.clone(),
            src_ip: obs.src_ip.clone(),
            dst_ip: obs.dst_ip.clone(),
            proto: obs.proto,
            src_port: obs.src_port,
            dst_port: obs.dst_port,
            tos: obs.tos,
        }
    }

    /// `"<ifname>,<src_ip>,<dst_ip>,<proto>,<src_port>,<dst_port>,<tos>"`
    pub fn to_wire_string(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.ifname, self.src_ip, self.dst_ip, self.proto, self.src_port, self.dst_port, self.tos
        )
    }

    /// Inverse of [`FlowKey::to_wire_string`]. The collector parses exactly
    /// seven comma-separated fields; anything else is a malformed key.
    pub fn parse(s: &str) -> Option<FlowKey> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 7 {
            return None;
        }
        Some(FlowKey {
            ifname: parts[0].to_string(),
            src_ip: parts[1].to_string(),
            dst_ip: parts[2].to_string(),
            proto: parts[3].parse().ok()?,
            src_port: parts[4].parse().ok()?,
            dst_port: parts[5].parse().ok()?,
            tos: parts[6].parse().ok()?,
        })
    }
}

/// The aggregated state held in the agent's flow cache for one key.
///
/// `start_time <= end_time <= now` always holds, and a present entry always
/// has `packets >= 1` and `bytes >= packets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFields {
    pub bytes: u64,
    pub packets: u64,
    pub start_time: f64,
    pub end_time: f64,
    pub flags: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowEntry {
    pub key: FlowKey,
    pub fields: FlowFields,
}

impl FlowEntry {
    pub fn new(key: FlowKey, obs: &PacketObservation, now: f64) -> Self {
        FlowEntry {
            key,
            fields: FlowFields {
                bytes: obs.length,
                packets: 1,
                start_time: now,
                end_time: now,
                flags: obs.flags.as_str().to_string(),
            },
        }
    }

    /// Folds a newly-observed packet into an existing entry. `flags`
    /// OR-accumulates; `end_time` and byte/packet counters only ever move
    /// forward.
    pub fn observe(&mut self, obs: &PacketObservation, now: f64) {
        self.fields.bytes += obs.length;
        self.fields.packets += 1;
        self.fields.end_time = now;
        let mut flags = TcpFlags::from_letters(&self.fields.flags);
        flags.merge(&obs.flags);
        self.fields.flags = flags.as_str().to_string();
    }
}

/// The wire record: one flow key mapped to its fields, the unit of a single
/// UDP datagram.
pub type FlowRecord = std::collections::BTreeMap<String, FlowFields>;

/// A decoded, persisted flow as stored in the relational store: the decoded
/// record's fields, plus the agent's source address, a freshly minted
/// UUIDv4, and the raw wire string for audit/debugging.
#[derive(Debug, Clone)]
pub struct PersistedFlow {
    pub uuid: uuid::Uuid,
    pub raw: String,
    pub agent_address: String,
    pub key: FlowKey,
    pub fields: FlowFields,
}

impl PersistedFlow {
    pub fn new(agent_address: String, key: FlowKey, fields: FlowFields, raw: String) -> Self {
        PersistedFlow {
            uuid: uuid::Uuid::new_v4(),
            raw,
            agent_address,
            key,
            fields,
        }
    }

    /// Per-second time-series expansion: `s0 = floor(start)`, `s1 =
    /// ceil(end)`, `d = s1 - s0`. `d <= 1` yields one point carrying the
    /// full counters; otherwise `d` points, each carrying an even share of
    /// bytes/packets.
    pub fn expand_timeseries(&self) -> Vec<TimeseriesPoint> {
        let s0 = self.fields.start_time.floor() as i64;
        let s1 = self.fields.end_time.ceil() as i64;
        let d = (s1 - s0).max(1);
        if d <= 1 {
            return vec![TimeseriesPoint {
                seconds: s0,
                uuid: self.uuid,
                agent_address: self.agent_address.clone(),
                key: self.key.clone(),
                bytes: self.fields.bytes as f64,
                packets: self.fields.packets as f64,
                flows: 1.0,
                flags: self.fields.flags.clone(),
            }];
        }
        let bytes_share = self.fields.bytes as f64 / d as f64;
        let packets_share = self.fields.packets as f64 / d as f64;
        (0..d)
            .map(|i| TimeseriesPoint {
                seconds: s0 + i,
                uuid: self.uuid,
                agent_address: self.agent_address.clone(),
                key: self.key.clone(),
                bytes: bytes_share,
                packets: packets_share,
                flows: 1.0,
                flags: self.fields.flags.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesPoint {
    pub seconds: i64,
    pub uuid: uuid::Uuid,
    pub agent_address: String,
    pub key: FlowKey,
    pub bytes: f64,
    pub packets: f64,
    pub flows: f64,
    pub flags: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ifname: &str) -> FlowKey {
        FlowKey {
            ifname: ifname.to_string(),
            src_ip: "10.0.0.1".into(),
            dst_ip: "10.0.0.2".into(),
            proto: 17,
            src_port: 1000,
            dst_port: 53,
            tos: 0,
        }
    }

    #[test]
    fn wire_string_round_trips() {
        let k = key("eth0");
        let s = k.to_wire_string();
        assert_eq!(s, "eth0,10.0.0.1,10.0.0.2,17,1000,53,0");
        assert_eq!(FlowKey::parse(&s).unwrap(), k);
    }

    #[test]
    fn wire_string_leading_field_is_ifname() {
        // an empty ifname still leads the serialized key.
        let k = key("");
        assert_eq!(k.to_wire_string(), ",10.0.0.1,10.0.0.2,17,1000,53,0");
    }

    #[test]
    fn tcp_flags_accumulate_rather_than_overwrite() {
        let mut flags = TcpFlags::from_letters("S");
        flags.merge(&TcpFlags::from_letters("A"));
        flags.merge(&TcpFlags::from_letters("FA"));
        assert!(flags.contains('S'));
        assert!(flags.contains('A'));
        assert!(flags.contains('F'));
    }

    #[test]
    fn timeseries_expansion_short_flow_is_one_point() {
        let flow = PersistedFlow::new(
            "1.2.3.4".into(),
            key("eth0"),
            FlowFields {
                bytes: 600,
                packets: 3,
                start_time: 10.2,
                end_time: 10.9,
                flags: "SA".into(),
            },
            "raw".into(),
        );
        let points = flow.expand_timeseries();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].bytes, 600.0);
        assert_eq!(points[0].packets, 3.0);
    }

    #[test]
    fn timeseries_expansion_sums_to_total_bytes() {
        let flow = PersistedFlow::new(
            "1.2.3.4".into(),
            key("eth0"),
            FlowFields {
                bytes: 1000,
                packets: 10,
                start_time: 10.5,
                end_time: 14.2,
                flags: "None".into(),
            },
            "raw".into(),
        );
        let points = flow.expand_timeseries();
        assert_eq!(points.len(), 5);
        let total: f64 = points.iter().map(|p| p.bytes).sum();
        assert!((total - 1000.0).abs() < 1e-6);
    }
}
