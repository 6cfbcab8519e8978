//! Durable and ephemeral channels.
//!
//! The durable channel must deliver every published event to every subscriber in one
//! total order; the reducer relies on nothing else. The liveness channel promises nothing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ll_proto::{EntryBody, LivenessMessage, SignedEvent};
use ll_store::ReplicatedLog;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ThresholdError;

const CHANNEL_CAPACITY: usize = 1024;
const EVENT_KEY_PREFIX: &str = "threshold/";

#[async_trait]
pub trait DurableChannel: Send + Sync {
    async fn publish(&self, event: SignedEvent) -> Result<(), ThresholdError>;

    /// Everything published so far, in delivery order.
    async fn history(&self) -> Result<Vec<SignedEvent>, ThresholdError>;

    fn subscribe(&self) -> broadcast::Receiver<SignedEvent>;
}

#[async_trait]
pub trait LivenessChannel: Send + Sync {
    async fn broadcast(&self, message: LivenessMessage) -> Result<(), ThresholdError>;

    fn subscribe(&self) -> broadcast::Receiver<LivenessMessage>;
}

// ── In-memory bus ────────────────────────────────────────────────────────────

/// Both channels in one process. Liveness delivery can be switched off to simulate loss.
pub struct MemoryBus {
    durable: broadcast::Sender<SignedEvent>,
    liveness: broadcast::Sender<LivenessMessage>,
    history: Mutex<Vec<SignedEvent>>,
    liveness_enabled: AtomicBool,
    liveness_delivered: AtomicUsize,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        let (durable, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (liveness, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            durable,
            liveness,
            history: Mutex::new(Vec::new()),
            liveness_enabled: AtomicBool::new(true),
            liveness_delivered: AtomicUsize::new(0),
        })
    }

    pub fn set_liveness_enabled(&self, enabled: bool) {
        self.liveness_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn published(&self) -> usize {
        self.history.lock().len()
    }

    /// Liveness messages handed to subscribers so far.
    pub fn liveness_delivered(&self) -> usize {
        self.liveness_delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableChannel for MemoryBus {
    async fn publish(&self, event: SignedEvent) -> Result<(), ThresholdError> {
        // Holding the lock across send keeps history and delivery order identical.
        let mut history = self.history.lock();
        history.push(event.clone());
        let _ = self.durable.send(event);
        Ok(())
    }

    async fn history(&self) -> Result<Vec<SignedEvent>, ThresholdError> {
        Ok(self.history.lock().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignedEvent> {
        self.durable.subscribe()
    }
}

#[async_trait]
impl LivenessChannel for MemoryBus {
    async fn broadcast(&self, message: LivenessMessage) -> Result<(), ThresholdError> {
        if self.liveness_enabled.load(Ordering::SeqCst) && self.liveness.send(message).is_ok() {
            self.liveness_delivered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LivenessMessage> {
        self.liveness.subscribe()
    }
}

// ── Replicated-log channel ───────────────────────────────────────────────────

/// Durable channel stored in a replicated log, one `threshold/<sender>/<counter>` entry per event.
pub struct LogChannel {
    log: Arc<dyn ReplicatedLog>,
    events: broadcast::Sender<SignedEvent>,
    forwarder: JoinHandle<()>,
}

impl LogChannel {
    /// Wrap `log` and start forwarding its appends to subscribers. Needs a tokio runtime.
    pub fn new(log: Arc<dyn ReplicatedLog>) -> Arc<Self> {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let mut appended = log.subscribe();
        let tx = events.clone();
        let source = log.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match appended.recv().await {
                    Ok(entry) => {
                        if let Some(event) = decode_event(&entry.key, &entry.body) {
                            let _ = tx.send(event);
                        }
                    }
                    // Resend everything; subscribers drop what they already applied.
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "coordination log forwarder lagged; resending from the log");
                        match source.entries().await {
                            Ok(entries) => {
                                for entry in &entries {
                                    if let Some(event) = decode_event(&entry.key, &entry.body) {
                                        let _ = tx.send(event);
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "could not re-read the coordination log"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Arc::new(Self { log, events, forwarder })
    }
}

impl Drop for LogChannel {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

fn decode_event(key: &str, body: &EntryBody) -> Option<SignedEvent> {
    if !key.starts_with(EVENT_KEY_PREFIX) {
        return None;
    }
    match body {
        EntryBody::Plain { value } => match serde_json::from_value(value.clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(key, error = %e, "skipping undecodable coordination entry");
                None
            }
        },
        _ => None,
    }
}

#[async_trait]
impl DurableChannel for LogChannel {
    async fn publish(&self, event: SignedEvent) -> Result<(), ThresholdError> {
        let key = format!("{EVENT_KEY_PREFIX}{}/{}", event.sender, event.counter);
        let value = serde_json::to_value(&event)?;
        self.log.append(&key, EntryBody::Plain { value }).await?;
        Ok(())
    }

    async fn history(&self) -> Result<Vec<SignedEvent>, ThresholdError> {
        Ok(self
            .log
            .entries()
            .await?
            .iter()
            .filter_map(|entry| decode_event(&entry.key, &entry.body))
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignedEvent> {
        self.events.subscribe()
    }
}
