//! Single consumer of `msg_q`: dispatches `(level, payload)` messages to
//! `tracing`, preserving per-producer log ordering, and drains any
//! remaining messages before stopping.

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::{Level, Message};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Messenger {
    messages: mpsc::Receiver<Message>,
}

impl Messenger {
    pub fn new(messages: mpsc::Receiver<Message>) -> Self {
        Messenger { messages }
    }

    pub async fn run(mut self, stop: CancellationToken) {
        info!("messenger_001: up and running...");
        loop {
            match timeout(POLL_INTERVAL, self.messages.recv()).await {
                Ok(Some(msg)) => dispatch(msg),
                Ok(None) => break,
                Err(_) => {
                    if stop.is_cancelled() {
                        break;
                    }
                }
            }
        }

        info!("messenger_001: stopping...");
        while let Ok(msg) = self.messages.try_recv() {
            dispatch(msg);
        }
        info!("messenger_001: stopped...");
    }
}

fn dispatch((level, payload): Message) {
    match level {
        Level::Debug => debug!("{payload}"),
        Level::Info => info!("{payload}"),
        Level::Warning => warn!("{payload}"),
        Level::Error => tracing::error!("{payload}"),
    }
}
