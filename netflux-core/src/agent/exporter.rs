//! Serializes, encodes, encrypts and transmits each flow entry to the
//! collector over UDP.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::flow::FlowEntry;
use crate::pipeline::{now_unix, MessageSink};
use crate::wire::{self, SharedKey};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Recommended ceiling on a single UDP datagram; the collector's receive
/// buffer is sized to match.
pub const MAX_DATAGRAM_BYTES: usize = 1024;

pub struct Exporter {
    entries: mpsc::Receiver<FlowEntry>,
    messages: MessageSink,
    socket: UdpSocket,
    collector: SocketAddr,
    key: Arc<SharedKey>,
}

impl Exporter {
    pub fn new(
        entries: mpsc::Receiver<FlowEntry>,
        messages: MessageSink,
        socket: UdpSocket,
        collector: SocketAddr,
        key: Arc<SharedKey>,
    ) -> Self {
        Exporter { entries, messages, socket, collector, key }
    }

    pub async fn run(mut self, stop: CancellationToken) {
        self.messages.info("up and running...").await;
        loop {
            match timeout(POLL_INTERVAL, self.entries.recv()).await {
                Ok(Some(entry)) => self.export_entry(&entry).await,
                Ok(None) => break,
                Err(_) => {
                    if stop.is_cancelled() {
                        break;
                    }
                }
            }
        }

        self.messages.info("stopping...").await;
        while let Ok(entry) = self.entries.try_recv() {
            self.export_entry(&entry).await;
        }
        self.messages.info("stopped...").await;
    }

    /// `entry -> JSON -> UTF-8 -> base64 -> AE-encrypt -> UDP datagram`.
    /// Exactly one datagram per entry.
    async fn export_entry(&self, entry: &FlowEntry) {
        let mut record = std::collections::BTreeMap::new();
        record.insert(entry.key.to_wire_string(), entry.fields.clone());
        let json = serde_json::to_vec(&record).expect("flow record always serializes");
        let encoded = STANDARD.encode(json);
        let token = wire::encrypt(&self.key, encoded.as_bytes(), now_unix());

        if token.len() > MAX_DATAGRAM_BYTES {
            self.messages
                .warning(format!("entry for {} exceeds {} bytes, dropping", entry.key.to_wire_string(), MAX_DATAGRAM_BYTES))
                .await;
            return;
        }

        if let Err(e) = self.socket.send_to(token.as_bytes(), self.collector).await {
            self.messages.warning(format!("send to collector failed: {e}")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowFields, FlowKey};

    fn entry() -> FlowEntry {
        FlowEntry {
            key: FlowKey {
                ifname: "eth0".into(),
                src_ip: "10.0.0.1".into(),
                dst_ip: "10.0.0.2".into(),
                proto: 17,
                src_port: 1000,
                dst_port: 53,
                tos: 0,
            },
            fields: FlowFields { bytes: 128, packets: 1, start_time: 1.0, end_time: 1.0, flags: "None".into() },
        }
    }

    #[tokio::test]
    async fn exports_and_collector_can_decrypt() {
        let key = Arc::new(SharedKey::from_base64(&SharedKey::generate()).unwrap());
        let (_tx, rx) = mpsc::channel(1);
        let (msg_tx, mut msg_rx) = mpsc::channel(8);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let collector_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let collector_addr = collector_socket.local_addr().unwrap();

        let exporter = Exporter::new(
            rx,
            crate::pipeline::MessageSink::new(msg_tx, "exporter_001".into()),
            socket,
            collector_addr,
            key.clone(),
        );
        exporter.export_entry(&entry()).await;

        let mut buf = [0u8; 2048];
        let (n, _) = collector_socket.recv_from(&mut buf).await.unwrap();
        let token = std::str::from_utf8(&buf[..n]).unwrap();
        let decoded = wire::decrypt(&key, token, now_unix(), 5).unwrap();
        let encoded = std::str::from_utf8(&decoded).unwrap();
        let json = STANDARD.decode(encoded).unwrap();
        let record: std::collections::BTreeMap<String, FlowFields> = serde_json::from_slice(&json).unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record.values().next().unwrap().bytes, 128);
        let _ = msg_rx.try_recv();
        drop(msg_rx);
    }
}
