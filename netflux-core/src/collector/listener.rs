//! Binds the collector's UDP socket and pushes `(payload, peer_addr)` onto
//! `rec_q` for whitelisted peers only.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::pipeline::MessageSink;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM_BYTES: usize = 1024;

pub struct Listener {
    socket: UdpSocket,
    records: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    messages: MessageSink,
    /// `peer_ip -> shared_key` whitelist, owned as per-listener
    /// configuration rather than shared mutable state.
    agents: HashMap<String, String>,
}

impl Listener {
    pub fn new(
        socket: UdpSocket,
        records: mpsc::Sender<(Vec<u8>, SocketAddr)>,
        messages: MessageSink,
        agents: HashMap<String, String>,
    ) -> Self {
        Listener { socket, records, messages, agents }
    }

    pub async fn run(self, stop: CancellationToken) {
        self.messages.info("up and running...").await;
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            match timeout(POLL_INTERVAL, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((n, peer))) => self.process_datagram(&buf[..n], peer).await,
                Ok(Err(e)) => {
                    self.messages.warning(format!("recv error: {e}")).await;
                }
                Err(_) => {
                    if stop.is_cancelled() {
                        break;
                    }
                }
            }
        }
        self.messages.info("stopping...").await;
        self.messages.info("stopped...").await;
    }

    async fn process_datagram(&self, data: &[u8], peer: SocketAddr) {
        if self.agents.contains_key(&peer.ip().to_string()) {
            let _ = self.records.send((data.to_vec(), peer)).await;
        } else {
            self.messages.warning(format!("data from {peer} was ignored, not in the agent whitelist")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn whitelisted_peer_reaches_rec_q() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = "1.2.3.4:5555".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (msg_tx, _msg_rx) = mpsc::channel(8);
        let mut agents = HashMap::new();
        agents.insert("1.2.3.4".to_string(), "key".to_string());
        let listener = Listener::new(socket, tx, MessageSink::new(msg_tx, "listener_001".into()), agents);
        listener.process_datagram(b"hello", addr).await;
        let (data, peer) = rx.recv().await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(peer, addr);
    }

    #[tokio::test]
    async fn unknown_peer_is_dropped() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = "9.9.9.9:5555".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (msg_tx, _msg_rx) = mpsc::channel(8);
        let listener = Listener::new(socket, tx, MessageSink::new(msg_tx, "listener_001".into()), HashMap::new());
        listener.process_datagram(b"hello", addr).await;
        assert!(rx.try_recv().is_err());
    }
}
