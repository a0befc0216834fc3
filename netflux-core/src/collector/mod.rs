//! The collector: one Listener fanning out to `processors_number`
//! processors and `writers_number` writers over shared queues, all
//! sharing one Messenger.

pub mod listener;
pub mod processor;
pub mod writer;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::CollectorConfig;
use crate::messenger::Messenger;
use crate::pipeline::{MessageSink, WorkerId};
use crate::store::sqlite::SqliteStore;
use crate::wire::SharedKey;

const QUEUE_CAPACITY: usize = 1024;

/// Builds and runs the full collector topology: one Listener feeding
/// `processors_number` processors feeding `writers_number` writers. Drain
/// order on the way down is Listener -> Processor(s) -> Writer(s) ->
/// Messenger.
pub async fn run(config: CollectorConfig, shutdown: CancellationToken) -> std::io::Result<()> {
    let (msg_tx, msg_rx) = mpsc::channel(QUEUE_CAPACITY);
    let messenger = Messenger::new(msg_rx);
    let messenger_token = CancellationToken::new();
    let messenger_handle = tokio::spawn(messenger.run(messenger_token.clone()));

    let agents: HashMap<String, SharedKey> = config
        .agents
        .iter()
        .map(|(ip, key)| (ip.clone(), SharedKey::from_base64(key).expect("validated at config load")))
        .collect();

    let (rec_tx, rec_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (ent_tx, ent_rx) = mpsc::channel(QUEUE_CAPACITY);

    let socket = UdpSocket::bind((config.bind_address.as_str(), config.bind_port)).await?;
    let listener_sink = MessageSink::new(msg_tx.clone(), WorkerId::new("listener", 1).name());
    let listener = listener::Listener::new(socket, rec_tx, listener_sink, config.agents.clone());
    let listener_token = CancellationToken::new();
    let listener_handle = tokio::spawn(listener.run(listener_token.clone()));

    // Both pools drain a single shared queue guarded by a mutex rather than
    // each getting its own channel: `processors_number`/`writers_number` are
    // independent scaling knobs, not one per upstream producer.
    let rec_rx: processor::SharedRecords = Arc::new(Mutex::new(rec_rx));
    let mut processor_tokens = Vec::new();
    let mut processor_handles = Vec::new();
    for n in 0..config.processors_number {
        let sink = MessageSink::new(msg_tx.clone(), WorkerId::new("processor", n as u32 + 1).name());
        let worker = processor::Processor::new(rec_rx.clone(), ent_tx.clone(), sink, agents.clone(), config.token_ttl);
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));
        processor_tokens.push(token);
        processor_handles.push(handle);
    }
    drop(ent_tx);

    let ent_rx: writer::SharedEntries = Arc::new(Mutex::new(ent_rx));
    let mut writer_tokens = Vec::new();
    let mut writer_handles = Vec::new();
    for n in 0..config.writers_number {
        let sink = MessageSink::new(msg_tx.clone(), WorkerId::new("writer", n as u32 + 1).name());
        let store = SqliteStore::open(&config.db_name)
            .map_err(|e| std::io::Error::other(format!("failed to open store: {e}")))?;
        let worker = writer::Writer::new(ent_rx.clone(), sink, store);
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));
        writer_tokens.push(token);
        writer_handles.push(handle);
    }

    shutdown.cancelled().await;
    listener_token.cancel();
    let _ = listener_handle.await;
    for token in processor_tokens {
        token.cancel();
    }
    for handle in processor_handles {
        let _ = handle.await;
    }
    for token in writer_tokens {
        token.cancel();
    }
    for handle in writer_handles {
        let _ = handle.await;
    }
    messenger_token.cancel();
    let _ = messenger_handle.await;
    Ok(())
}
