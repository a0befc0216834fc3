//! Validates, decrypts, decodes and normalizes each record.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::flow::FlowFields;
use crate::pipeline::{now_unix, MessageSink};
use crate::wire::{self, SharedKey};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A record queue shared by every processor worker in the collector's pool:
/// `processors_number` independent workers draining one `rec_q`.
pub type SharedRecords = Arc<Mutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>>;

pub struct Processor {
    records: SharedRecords,
    entries: mpsc::Sender<(SocketAddr, BTreeMap<String, FlowFields>)>,
    messages: MessageSink,
    agents: HashMap<String, SharedKey>,
    token_ttl: u64,
}

impl Processor {
    pub fn new(
        records: SharedRecords,
        entries: mpsc::Sender<(SocketAddr, BTreeMap<String, FlowFields>)>,
        messages: MessageSink,
        agents: HashMap<String, SharedKey>,
        token_ttl: u64,
    ) -> Self {
        Processor { records, entries, messages, agents, token_ttl }
    }

    pub async fn run(self, stop: CancellationToken) {
        self.messages.info("up and running...").await;
        loop {
            let next = {
                let mut records = self.records.lock().await;
                timeout(POLL_INTERVAL, records.recv()).await
            };
            match next {
                Ok(Some((data, peer))) => self.process_record(&data, peer).await,
                Ok(None) => break,
                Err(_) => {
                    if stop.is_cancelled() {
                        break;
                    }
                }
            }
        }
        self.messages.info("stopping...").await;
        while let Ok((data, peer)) = self.records.lock().await.try_recv() {
            self.process_record(&data, peer).await;
        }
        self.messages.info("stopped...").await;
    }

    async fn process_record(&self, data: &[u8], peer: SocketAddr) {
        let Some(key) = self.agents.get(&peer.ip().to_string()) else {
            self.messages.warning(format!("record from {peer} ignored: peer not in whitelist")).await;
            return;
        };

        let Ok(token) = std::str::from_utf8(data) else {
            self.messages.warning(format!("record from {peer} ignored: invalid token encoding")).await;
            return;
        };

        let plaintext = match wire::decrypt(key, token, now_unix(), self.token_ttl) {
            Ok(p) => p,
            Err(e) => {
                self.messages.warning(format!("record from {peer} ignored: invalid token ({e})")).await;
                return;
            }
        };

        let encoded = match std::str::from_utf8(&plaintext) {
            Ok(s) => s,
            Err(e) => {
                self.messages.warning(format!("record from {peer} ignored: utf-8 error ({e})")).await;
                return;
            }
        };

        let json_bytes = match STANDARD.decode(encoded) {
            Ok(b) => b,
            Err(e) => {
                self.messages.warning(format!("record from {peer} ignored: base64 error ({e})")).await;
                return;
            }
        };

        let json = match std::str::from_utf8(&json_bytes) {
            Ok(s) => s,
            Err(e) => {
                self.messages.warning(format!("record from {peer} ignored: utf-8 error ({e})")).await;
                return;
            }
        };

        let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(json) {
            Ok(m) => m,
            Err(e) => {
                self.messages.warning(format!("record from {peer} ignored: json parse error ({e})")).await;
                return;
            }
        };

        let mut normalized = BTreeMap::new();
        for (flow_id, value) in raw {
            match normalize_fields(&value) {
                Ok(fields) => {
                    normalized.insert(flow_id, fields);
                }
                Err(e) => {
                    self.messages.warning(format!("flow {flow_id} from {peer} ignored: {e}")).await;
                }
            }
        }

        if !normalized.is_empty() {
            let _ = self.entries.send((peer, normalized)).await;
        }
    }
}

/// Coerces/validates one flow's fields out of the parsed JSON value,
/// returning a descriptive key/value error on the first missing or
/// uncoercible field.
fn normalize_fields(value: &serde_json::Value) -> Result<FlowFields, String> {
    let obj = value.as_object().ok_or("flow value is not an object")?;
    let bytes = obj
        .get("bytes")
        .and_then(coerce_u64)
        .ok_or("missing or non-numeric 'bytes'")?;
    let packets = obj
        .get("packets")
        .and_then(coerce_u64)
        .ok_or("missing or non-numeric 'packets'")?;
    let start_time = obj
        .get("start_time")
        .and_then(serde_json::Value::as_f64)
        .ok_or("missing or non-numeric 'start_time'")?;
    let end_time = obj
        .get("end_time")
        .and_then(serde_json::Value::as_f64)
        .ok_or("missing or non-numeric 'end_time'")?;
    let flags = obj
        .get("flags")
        .and_then(serde_json::Value::as_str)
        .ok_or("missing or non-string 'flags'")?
        .to_string();
    Ok(FlowFields { bytes, packets, start_time, end_time, flags })
}

fn coerce_u64(value: &serde_json::Value) -> Option<u64> {
    value.as_u64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_record(key: &SharedKey, record: &BTreeMap<String, FlowFields>, now: u64) -> Vec<u8> {
        let json = serde_json::to_vec(record).unwrap();
        let encoded = STANDARD.encode(json);
        wire::encrypt(key, encoded.as_bytes(), now).into_bytes()
    }

    fn fields() -> FlowFields {
        FlowFields { bytes: 128, packets: 1, start_time: 1.0, end_time: 1.0, flags: "None".into() }
    }

    #[tokio::test]
    async fn valid_record_is_normalized_and_forwarded() {
        let key = SharedKey::from_base64(&SharedKey::generate()).unwrap();
        let mut record = BTreeMap::new();
        record.insert(",10.0.0.1,10.0.0.2,17,1000,53,0".to_string(), fields());
        let data = encode_record(&key, &record, now_unix());

        let mut agents = HashMap::new();
        agents.insert("1.2.3.4".to_string(), key);
        let (_rtx, rrx) = mpsc::channel(4);
        let (etx, mut erx) = mpsc::channel(4);
        let (mtx, _mrx) = mpsc::channel(8);
        let processor = Processor::new(
            Arc::new(Mutex::new(rrx)),
            etx,
            MessageSink::new(mtx, "processor_001".into()),
            agents,
            5,
        );

        processor.process_record(&data, "1.2.3.4:1".parse().unwrap()).await;
        let (peer, normalized) = erx.recv().await.unwrap();
        assert_eq!(peer.ip().to_string(), "1.2.3.4");
        assert_eq!(normalized.len(), 1);
    }

    #[tokio::test]
    async fn unknown_peer_is_dropped_with_no_entry() {
        let (_rtx, rrx) = mpsc::channel(4);
        let (etx, mut erx) = mpsc::channel(4);
        let (mtx, _mrx) = mpsc::channel(8);
        let processor = Processor::new(
            Arc::new(Mutex::new(rrx)),
            etx,
            MessageSink::new(mtx, "processor_001".into()),
            HashMap::new(),
            5,
        );
        processor.process_record(b"garbage", "9.9.9.9:1".parse().unwrap()).await;
        assert!(erx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_token_is_dropped() {
        let key = SharedKey::from_base64(&SharedKey::generate()).unwrap();
        let mut record = BTreeMap::new();
        record.insert("k".to_string(), fields());
        let data = encode_record(&key, &record, now_unix() - 100);

        let mut agents = HashMap::new();
        agents.insert("1.2.3.4".to_string(), key);
        let (_rtx, rrx) = mpsc::channel(4);
        let (etx, mut erx) = mpsc::channel(4);
        let (mtx, _mrx) = mpsc::channel(8);
        let processor = Processor::new(
            Arc::new(Mutex::new(rrx)),
            etx,
            MessageSink::new(mtx, "processor_001".into()),
            agents,
            5,
        );
        processor.process_record(&data, "1.2.3.4:1".parse().unwrap()).await;
        assert!(erx.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_malformed_flow_does_not_block_others_in_the_same_record() {
        let key = SharedKey::from_base64(&SharedKey::generate()).unwrap();
        let mut record: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        record.insert("good".to_string(), serde_json::to_value(fields()).unwrap());
        record.insert("bad".to_string(), serde_json::json!({"bytes": "oops"}));
        let json = serde_json::to_vec(&record).unwrap();
        let encoded = STANDARD.encode(json);
        let data = wire::encrypt(&key, encoded.as_bytes(), now_unix()).into_bytes();

        let mut agents = HashMap::new();
        agents.insert("1.2.3.4".to_string(), key);
        let (_rtx, rrx) = mpsc::channel(4);
        let (etx, mut erx) = mpsc::channel(4);
        let (mtx, _mrx) = mpsc::channel(8);
        let processor = Processor::new(
            Arc::new(Mutex::new(rrx)),
            etx,
            MessageSink::new(mtx, "processor_001".into()),
            agents,
            5,
        );
        processor.process_record(&data, "1.2.3.4:1".parse().unwrap()).await;
        let (_peer, normalized) = erx.recv().await.unwrap();
        assert_eq!(normalized.len(), 1);
        assert!(normalized.contains_key("good"));
    }
}
