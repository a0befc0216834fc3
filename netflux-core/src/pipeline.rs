//! Generic pipeline scaffolding shared by every stage in both the agent and
//! the collector: a `(level, message)` sink for the Messenger, and the
//! per-worker cancellation/drain helpers each stage builds on.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A worker's human-readable identity, injected at construction rather than
/// drawn from a process-global counter.
#[derive(Debug, Clone)]
pub struct WorkerId {
    pub group: &'static str,
    pub number: u32,
}

impl WorkerId {
    pub fn new(group: &'static str, number: u32) -> Self {
        WorkerId { group, number }
    }

    pub fn name(&self) -> String {
        format!("{}_{:03}", self.group, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

/// One message bound for the Messenger: the level plus a rendered payload.
/// Mirrors the source's `(level, payload)` tuple on `msg_queue`.
pub type Message = (Level, String);

/// Handle every worker holds to post onto the shared message queue.
#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<Message>,
    worker: String,
}

impl MessageSink {
    pub fn new(tx: mpsc::Sender<Message>, worker: String) -> Self {
        MessageSink { tx, worker }
    }

    async fn send(&self, level: Level, msg: impl Into<String>) {
        // Messages are best-effort: a full/closed msg_q must never block or
        // panic a worker out of its main loop.
        let _ = self.tx.send((level, format!("{}: {}", self.worker, msg.into()))).await;
    }

    pub async fn debug(&self, msg: impl Into<String>) {
        self.send(Level::Debug, msg).await;
    }

    pub async fn info(&self, msg: impl Into<String>) {
        self.send(Level::Info, msg).await;
    }

    pub async fn warning(&self, msg: impl Into<String>) {
        self.send(Level::Warning, msg).await;
    }

    fn blocking_send(&self, level: Level, msg: impl Into<String>) {
        let _ = self.tx.blocking_send((level, format!("{}: {}", self.worker, msg.into())));
    }

    /// Non-async counterparts for callers running inside
    /// `tokio::task::spawn_blocking`, where `.await` isn't available.
    pub fn blocking_debug(&self, msg: impl Into<String>) {
        self.blocking_send(Level::Debug, msg);
    }

    pub fn blocking_warning(&self, msg: impl Into<String>) {
        self.blocking_send(Level::Warning, msg);
    }
}

/// A per-worker stop flag, the direct analogue of the source's
/// `threading.Event`, but observable from `tokio::select!` suspension
/// points.
pub type StopToken = CancellationToken;

/// Seconds since the Unix epoch as an `f64`, matching `time.time()` in the
/// original source and the `f64` timestamps carried on [`crate::flow::FlowFields`].
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_secs_f64()
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_name_is_zero_padded() {
        let id = WorkerId::new("processor", 1);
        assert_eq!(id.name(), "processor_001");
    }

    #[tokio::test]
    async fn message_sink_prefixes_worker_name() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = MessageSink::new(tx, "sniffer_001".to_string());
        sink.info("up and running...").await;
        let (level, text) = rx.recv().await.unwrap();
        assert_eq!(level, Level::Info);
        assert_eq!(text, "sniffer_001: up and running...");
    }
}
