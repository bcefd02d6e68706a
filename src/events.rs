//! In-process event bus with per-subscriber bounded queues. Events are
//! serialized once per publication; a subscriber whose buffer overflows is
//! disconnected rather than allowed to grow without bound.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::types::{now_millis, GatewayEvent};

pub const DEFAULT_BUFFER: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Requests,
    Providers,
    Cli,
    Stream,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Providers => "providers",
            Self::Cli => "cli",
            Self::Stream => "stream",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "requests" => Some(Self::Requests),
            "providers" => Some(Self::Providers),
            "cli" => Some(Self::Cli),
            "stream" => Some(Self::Stream),
            _ => None,
        }
    }

    pub fn all() -> [Self; 4] {
        [Self::Requests, Self::Providers, Self::Cli, Self::Stream]
    }
}

impl GatewayEvent {
    pub fn channel(&self) -> Channel {
        match self {
            Self::RequestSubmitted { .. }
            | Self::RequestProcessing { .. }
            | Self::RequestCompleted { .. }
            | Self::RequestFailed { .. }
            | Self::RequestCancelled { .. } => Channel::Requests,
            Self::ProviderHealthChanged { .. } => Channel::Providers,
            Self::BackendExecuting { .. } => Channel::Cli,
            Self::StreamChunk { .. } => Channel::Stream,
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    channels: HashSet<Channel>,
    tx: mpsc::Sender<Bytes>,
}

#[derive(Debug)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Bytes>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, channels: HashSet<Channel>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers
            .lock()
            .expect("event bus lock")
            .push(Subscriber { id, channels, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("event bus lock")
            .retain(|subscriber| subscriber.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event bus lock").len()
    }

    /// Serialize once, then push to every subscriber of the event's channel.
    /// A full buffer disconnects that subscriber; publication order per
    /// channel is preserved for everyone who keeps up.
    pub fn publish(&self, event: &GatewayEvent) {
        let channel = event.channel();
        let payload = match serialize(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize event");
                return;
            }
        };

        let mut subscribers = self.subscribers.lock().expect("event bus lock");
        subscribers.retain(|subscriber| {
            if !subscriber.channels.contains(&channel) {
                return true;
            }
            match subscriber.tx.try_send(payload.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = subscriber.id,
                        channel = channel.as_str(),
                        "disconnecting slow consumer"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

fn serialize(event: &GatewayEvent) -> Result<Bytes, serde_json::Error> {
    let mut value = serde_json::to_value(event)?;
    if let Some(object) = value.as_object_mut() {
        object.insert("ts_ms".to_string(), serde_json::json!(now_millis()));
    }
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}
