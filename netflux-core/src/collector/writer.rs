//! Persists each normalized entry to the relational store and expands it
//! into time-series points.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::flow::{FlowFields, FlowKey, PersistedFlow};
use crate::pipeline::MessageSink;
use crate::store::{RelationalStore, TimeSeriesStore};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// An entry queue shared by every writer worker in the collector's pool:
/// `writers_number` independent workers draining one `ent_q`, each holding
/// its own long-lived store connection.
pub type SharedEntries = Arc<Mutex<mpsc::Receiver<(SocketAddr, BTreeMap<String, FlowFields>)>>>;

/// A writer holds one store handle implementing both traits, so relational
/// inserts and time-series expansion for the same entry go through the same
/// long-lived connection rather than two independent ones competing for the
/// same backing file.
pub struct Writer<S> {
    entries: SharedEntries,
    messages: MessageSink,
    store: S,
}

impl<S: RelationalStore + TimeSeriesStore> Writer<S> {
    pub fn new(entries: SharedEntries, messages: MessageSink, store: S) -> Self {
        Writer { entries, messages, store }
    }

    pub async fn run(mut self, stop: CancellationToken) {
        self.messages.info("up and running...").await;
        loop {
            let next = {
                let mut entries = self.entries.lock().await;
                timeout(POLL_INTERVAL, entries.recv()).await
            };
            match next {
                Ok(Some((peer, record))) => self.process_entry(peer, record).await,
                Ok(None) => break,
                Err(_) => {
                    if stop.is_cancelled() {
                        break;
                    }
                }
            }
        }
        self.messages.info("stopping...").await;
        loop {
            let next = self.entries.lock().await.try_recv();
            match next {
                Ok((peer, record)) => self.process_entry(peer, record).await,
                Err(_) => break,
            }
        }
        self.messages.info("stopped...").await;
    }

    async fn process_entry(&mut self, peer: SocketAddr, record: BTreeMap<String, FlowFields>) {
        let raw = format!("{record:?}");
        for (flow_id, fields) in record {
            let Some(key) = FlowKey::parse(&flow_id) else {
                self.messages.warning(format!("malformed flow record: bad key {flow_id}")).await;
                continue;
            };
            let flow = PersistedFlow::new(peer.ip().to_string(), key, fields, raw.clone());
            if let Err(e) = self.store.insert_flow(&flow) {
                self.messages.warning(format!("relational store error: {e}")).await;
                continue;
            }
            let points = flow.expand_timeseries();
            if let Err(e) = self.store.insert_points(&points) {
                self.messages.warning(format!("time-series store error: {e}")).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    #[tokio::test]
    async fn writes_flow_and_timeseries_points() {
        let (_tx, rx) = mpsc::channel::<(SocketAddr, BTreeMap<String, FlowFields>)>(4);
        let (mtx, _mrx) = mpsc::channel(8);
        let store = SqliteStore::open_in_memory().unwrap();
        let mut writer =
            Writer::new(Arc::new(Mutex::new(rx)), MessageSink::new(mtx, "writer_001".into()), store);

        let mut record = BTreeMap::new();
        record.insert(
            "eth0,10.0.0.1,10.0.0.2,17,1000,53,0".to_string(),
            FlowFields { bytes: 128, packets: 1, start_time: 1.0, end_time: 1.0, flags: "None".into() },
        );
        writer.process_entry("1.2.3.4:1".parse().unwrap(), record).await;

        assert_eq!(writer.store.count_flows(), 1);
        assert_eq!(writer.store.count_timeseries(), 1);
    }

    #[tokio::test]
    async fn malformed_key_is_skipped_without_stopping_worker() {
        let (_tx, rx) = mpsc::channel::<(SocketAddr, BTreeMap<String, FlowFields>)>(4);
        let (mtx, _mrx) = mpsc::channel(8);
        let store = SqliteStore::open_in_memory().unwrap();
        let mut writer =
            Writer::new(Arc::new(Mutex::new(rx)), MessageSink::new(mtx, "writer_001".into()), store);

        let mut record = BTreeMap::new();
        record.insert(
            "not,enough,fields".to_string(),
            FlowFields { bytes: 1, packets: 1, start_time: 1.0, end_time: 1.0, flags: "None".into() },
        );
        writer.process_entry("1.2.3.4:1".parse().unwrap(), record).await;
        assert_eq!(writer.store.count_flows(), 0);
    }
}
