//! The agent: one independent Sniffer/Processor/Exporter stack per
//! configured interface, all sharing one Messenger.

pub mod exporter;
pub mod processor;
pub mod sniffer;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheLimits;
use crate::config::AgentConfig;
use crate::messenger::Messenger;
use crate::pipeline::{MessageSink, WorkerId};
use crate::wire::SharedKey;

const QUEUE_CAPACITY: usize = 1024;

/// Builds and runs the full agent topology: the Messenger plus one
/// Sniffer/Processor/Exporter stack per interface, until `shutdown` is
/// cancelled. Drain order on the way down is Sniffer -> Processor ->
/// Exporter -> Messenger.
pub async fn run(config: AgentConfig, shutdown: CancellationToken) -> std::io::Result<()> {
    let (msg_tx, msg_rx) = mpsc::channel(QUEUE_CAPACITY);
    let messenger = Messenger::new(msg_rx);
    let messenger_token = CancellationToken::new();
    let messenger_handle = tokio::spawn(messenger.run(messenger_token.clone()));

    let key = Arc::new(SharedKey::from_base64(&config.key).expect("validated at config load"));
    let collector_addr: SocketAddr =
        tokio::net::lookup_host((config.collector_address.as_str(), config.collector_port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("could not resolve collector address {}:{}", config.collector_address, config.collector_port),
                )
            })?;

    let mut stacks = Vec::new();
    for (n, ifname) in config.interfaces.iter().enumerate() {
        let n = n as u32 + 1;
        let (pkt_tx, pkt_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (ent_tx, ent_rx) = mpsc::channel(QUEUE_CAPACITY);

        let sniffer_sink = MessageSink::new(msg_tx.clone(), WorkerId::new("sniffer", n).name());
        let processor_sink = MessageSink::new(msg_tx.clone(), WorkerId::new("processor", n).name());
        let exporter_sink = MessageSink::new(msg_tx.clone(), WorkerId::new("exporter", n).name());

        let sniffer_token = CancellationToken::new();
        let processor_token = CancellationToken::new();
        let exporter_token = CancellationToken::new();

        let sniffer = sniffer::Sniffer::new(ifname.clone(), pkt_tx, sniffer_sink);
        let processor = processor::Processor::new(
            pkt_rx,
            ent_tx,
            processor_sink,
            CacheLimits {
                cache_limit: config.cache_limit,
                active_timeout: config.cache_active_timeout,
                inactive_timeout: config.cache_inactive_timeout,
            },
        );
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let exporter = exporter::Exporter::new(ent_rx, exporter_sink, socket, collector_addr, key.clone());

        let sniffer_h = tokio::spawn(sniffer.run(sniffer_token.clone()));
        let processor_h = tokio::spawn(processor.run(processor_token.clone()));
        let exporter_h = tokio::spawn(exporter.run(exporter_token.clone()));

        stacks.push((sniffer_token, sniffer_h, processor_token, processor_h, exporter_token, exporter_h));
    }

    shutdown.cancelled().await;
    for (sniffer_token, sniffer_h, processor_token, processor_h, exporter_token, exporter_h) in stacks {
        sniffer_token.cancel();
        let _ = sniffer_h.await;
        processor_token.cancel();
        let _ = processor_h.await;
        exporter_token.cancel();
        let _ = exporter_h.await;
    }
    messenger_token.cancel();
    let _ = messenger_handle.await;
    Ok(())
}
