//! Dissects captured frames, maintains the flow cache, and ages entries
//! into `ent_q`.

use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheLimits, FlowCache};
use crate::flow::{FlowEntry, PacketObservation, TcpFlags};
use crate::pipeline::{now_secs, MessageSink};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Dissects one captured Ethernet frame into a [`PacketObservation`].
/// Returns `None` for anything that isn't IPv4 or IPv6 — non-IP packets are
/// silently dropped.
pub fn dissect_frame(frame: &[u8], ifname: &str) -> Option<PacketObservation> {
    let ethernet = EthernetPacket::new(frame)?;
    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => dissect_ipv4(ethernet.payload(), ifname),
        EtherTypes::Ipv6 => dissect_ipv6(ethernet.payload(), ifname),
        _ => None,
    }
}

fn dissect_ipv4(payload: &[u8], ifname: &str) -> Option<PacketObservation> {
    let packet = Ipv4Packet::new(payload)?;
    let (src_port, dst_port, flags) = dissect_l4(packet.get_next_level_protocol(), packet.payload());
    Some(PacketObservation {
        ifname: ifname.to_string(),
        src_ip: packet.get_source().to_string(),
        dst_ip: packet.get_destination().to_string(),
        proto: packet.get_next_level_protocol().0,
        tos: packet.get_dscp() << 2 | packet.get_ecn(),
        length: packet.get_total_length() as u64,
        src_port,
        dst_port,
        flags,
    })
}

/// Fixed IPv6 header size; `get_payload_length()` excludes it, unlike
/// IPv4's `get_total_length()`, so it must be added back in to make the two
/// families' `length` fields mean the same thing: the full on-wire IP
/// datagram size.
const IPV6_HEADER_LEN: u64 = 40;

fn dissect_ipv6(payload: &[u8], ifname: &str) -> Option<PacketObservation> {
    let packet = Ipv6Packet::new(payload)?;
    let (src_port, dst_port, flags) = dissect_l4(packet.get_next_header(), packet.payload());
    Some(PacketObservation {
        ifname: ifname.to_string(),
        src_ip: packet.get_source().to_string(),
        dst_ip: packet.get_destination().to_string(),
        proto: packet.get_next_header().0,
        tos: packet.get_traffic_class(),
        length: packet.get_payload_length() as u64 + IPV6_HEADER_LEN,
        src_port,
        dst_port,
        flags,
    })
}

fn dissect_l4(proto: pnet_packet::ip::IpNextHeaderProtocol, payload: &[u8]) -> (u16, u16, TcpFlags) {
    match proto {
        IpNextHeaderProtocols::Tcp => {
            if let Some(tcp) = TcpPacket::new(payload) {
                (tcp.get_source(), tcp.get_destination(), flags_to_letters(tcp.get_flags()))
            } else {
                (0, 0, TcpFlags::none())
            }
        }
        IpNextHeaderProtocols::Udp => {
            if let Some(udp) = UdpPacket::new(payload) {
                (udp.get_source(), udp.get_destination(), TcpFlags::none())
            } else {
                (0, 0, TcpFlags::none())
            }
        }
        _ => (0, 0, TcpFlags::none()),
    }
}

fn flags_to_letters(bits: u8) -> TcpFlags {
    const NAMES: [(u8, char); 6] = [(0x01, 'F'), (0x02, 'S'), (0x04, 'R'), (0x08, 'P'), (0x10, 'A'), (0x20, 'U')];
    let letters: String = NAMES.iter().filter(|(bit, _)| bits & bit != 0).map(|(_, c)| *c).collect();
    TcpFlags::from_letters(&letters)
}

pub struct Processor {
    packets: mpsc::Receiver<(Vec<u8>, String)>,
    entries: mpsc::Sender<FlowEntry>,
    messages: MessageSink,
    cache: FlowCache,
}

impl Processor {
    pub fn new(
        packets: mpsc::Receiver<(Vec<u8>, String)>,
        entries: mpsc::Sender<FlowEntry>,
        messages: MessageSink,
        limits: CacheLimits,
    ) -> Self {
        Processor {
            packets,
            entries,
            messages,
            cache: FlowCache::new(limits),
        }
    }

    pub async fn run(mut self, stop: CancellationToken) {
        self.messages.info("up and running...").await;
        loop {
            match timeout(POLL_INTERVAL, self.packets.recv()).await {
                Ok(Some((frame, ifname))) => self.handle_frame(&frame, &ifname).await,
                Ok(None) => break,
                Err(_) => {
                    if stop.is_cancelled() {
                        break;
                    }
                }
            }
        }

        self.messages.info("stopping...").await;
        self.drain().await;
        self.messages.info("stopped...").await;
    }

    async fn handle_frame(&mut self, frame: &[u8], ifname: &str) {
        let Some(obs) = dissect_frame(frame, ifname) else {
            return;
        };
        let evicted = self.cache.observe(&obs, now_secs());
        if evicted.iter().any(|(_, r)| *r == crate::cache::AgingReason::Overflow) {
            self.messages.warning("cache size exceeded, evicting oldest entry").await;
        }
        for (entry, _) in evicted {
            self.messages.debug(format!("sending entry {} to exporter", entry.key.to_wire_string())).await;
            if self.entries.send(entry).await.is_err() {
                break;
            }
        }
    }

    /// Drains any still-queued frames, then ages out every remaining cache
    /// entry regardless of its individual timeout, ensuring no live flow is
    /// lost on shutdown.
    async fn drain(&mut self) {
        while let Ok((frame, ifname)) = self.packets.try_recv() {
            self.handle_frame(&frame, &ifname).await;
        }
        for (entry, _) in self.cache.drain_all() {
            let _ = self.entries.send(entry).await;
        }
    }
}
