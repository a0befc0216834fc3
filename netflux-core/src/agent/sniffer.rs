//! Opens an L2 capture handle on one interface and forwards every Ethernet
//! frame received to `pkt_q`, annotated with the capture interface name.
//! Non-Ethernet frames never reach here: `pnet_datalink`'s datalink channel
//! only yields link-layer frames in the first place.

use std::collections::HashSet;
use std::time::Duration;

use pnet_datalink::Channel::Ethernet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::MessageSink;

/// Lists the NIC names available on this host, for the `ifconfig`
/// subcommand and agent config validation.
pub fn list_interfaces() -> HashSet<String> {
    pnet_datalink::interfaces().into_iter().map(|i| i.name).collect()
}

pub struct Sniffer {
    ifname: String,
    packets: mpsc::Sender<(Vec<u8>, String)>,
    messages: MessageSink,
}

impl Sniffer {
    pub fn new(ifname: String, packets: mpsc::Sender<(Vec<u8>, String)>, messages: MessageSink) -> Self {
        Sniffer { ifname, packets, messages }
    }

    /// Runs the capture loop until `stop` is cancelled. The actual capture
    /// runs on a blocking thread via `spawn_blocking`, since
    /// `pnet_datalink`'s receiver is a synchronous, OS-level read that would
    /// otherwise tie up a tokio worker thread for up to a 1s read timeout on
    /// every poll.
    pub async fn run(self, stop: CancellationToken) {
        self.messages.info("up and running...").await;

        let interface = match pnet_datalink::interfaces().into_iter().find(|i| i.name == self.ifname) {
            Some(i) => i,
            None => {
                self.messages
                    .warning(format!("interface {} not found, capture cannot start", self.ifname))
                    .await;
                return;
            }
        };

        let ifname = self.ifname.clone();
        let packets = self.packets.clone();
        let messages = self.messages.clone();
        let stop_for_capture = stop.clone();
        let _ = tokio::task::spawn_blocking(move || capture_loop(interface, ifname, packets, messages, stop_for_capture)).await;

        self.messages.info("stopping...").await;
        self.messages.info("stopped...").await;
    }
}

/// The blocking capture loop, run on a dedicated thread via
/// `spawn_blocking`. Re-checks `stop` at least once per second, bounded by
/// the datalink channel's read timeout.
fn capture_loop(
    interface: pnet_datalink::NetworkInterface,
    ifname: String,
    packets: mpsc::Sender<(Vec<u8>, String)>,
    messages: MessageSink,
    stop: CancellationToken,
) {
    let config = pnet_datalink::Config {
        read_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };

    let mut rx = match pnet_datalink::channel(&interface, config) {
        Ok(Ethernet(_tx, rx)) => rx,
        Ok(_) => {
            messages.blocking_warning("unsupported datalink channel type");
            return;
        }
        Err(e) => {
            messages.blocking_warning(format!("failed to open capture handle: {e}"));
            return;
        }
    };

    loop {
        if stop.is_cancelled() {
            break;
        }
        match rx.next() {
            Ok(frame) => {
                messages.blocking_debug(format!("received a frame on {ifname}"));
                if packets.blocking_send((frame.to_vec(), ifname.clone())).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock => {
                continue;
            }
            Err(e) => {
                messages.blocking_warning(format!("capture read error: {e}"));
            }
        }
    }
}
