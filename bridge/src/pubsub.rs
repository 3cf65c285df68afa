//! In-process publish/subscribe bus.
//!
//! Carries the cross-process cache-coherence and alarm-creation notices.
//! Channels are created lazily on first publish or subscribe; payloads are
//! JSON strings, matching the wire shape of the external message bus. Every
//! publish also lands on a single ordered firehose so a consumer of several
//! channels sees notices in publish order, not per-channel order.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

pub struct PubSub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    firehose: broadcast::Sender<(String, String)>,
}

impl Default for PubSub {
    fn default() -> Self {
        PubSub::new()
    }
}

impl PubSub {
    pub fn new() -> Self {
        let (firehose, _) = broadcast::channel(CHANNEL_CAPACITY);
        PubSub {
            channels: Mutex::new(HashMap::new()),
            firehose,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish a payload; subscribers that lag past the channel capacity
    /// miss messages, which is acceptable for cache-coherence notices.
    pub fn publish(&self, channel: &str, payload: &str) {
        let sender = self.sender(channel);
        let delivered = sender.send(payload.to_string()).unwrap_or(0);
        let _ = self
            .firehose
            .send((channel.to_string(), payload.to_string()));
        debug!("published to {} ({} receivers)", channel, delivered);
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    /// One ordered view across every channel: `(channel, payload)` tuples in
    /// publish order. Use this when relative order between channels matters.
    pub fn subscribe_all(&self) -> broadcast::Receiver<(String, String)> {
        self.firehose.subscribe()
    }
}
