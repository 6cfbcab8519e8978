//! Async driver for one device's `Coordinator`.
//!
//! A single task owns the coordinator and waits on four things at once: durable events,
//! liveness messages, local commands and a periodic tick. Effects are carried out in the
//! order the coordinator produced them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ll_proto::{DeviceId, ShareEnvelope, ThresholdPolicy};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, Effect};
use crate::error::ThresholdError;
use crate::transport::{DurableChannel, LivenessChannel};

const COMMAND_CAPACITY: usize = 32;

/// Receives the effects that are not transport work (keys, failures, prompts).
#[async_trait]
pub trait EffectSink: Send + Sync {
    async fn apply(&self, effect: &Effect) -> Result<(), ThresholdError>;
}

type Reply<T> = oneshot::Sender<Result<T, ThresholdError>>;

enum Command {
    StartEnrollment {
        key_ref: String,
        policy: ThresholdPolicy,
        devices: Vec<DeviceId>,
        reply: Reply<()>,
    },
    StartRotation {
        key_ref: String,
        revoke: Vec<DeviceId>,
        reply: Reply<()>,
    },
    RequestUnlock {
        key_ref: String,
        epoch: Option<u64>,
        reply: Reply<String>,
    },
    RequestRecovery {
        key_ref: String,
        lost_devices: Vec<DeviceId>,
        reply: Reply<String>,
    },
    Approve {
        key_ref: String,
        request_id: String,
        reply: Reply<()>,
    },
    Lock {
        key_ref: String,
    },
}

#[derive(Clone)]
pub struct RunnerHandle {
    commands: mpsc::Sender<Command>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RunnerHandle {
    pub async fn start_enrollment(
        &self,
        key_ref: &str,
        policy: ThresholdPolicy,
        devices: Vec<DeviceId>,
    ) -> Result<(), ThresholdError> {
        self.call(|reply| Command::StartEnrollment {
            key_ref: key_ref.to_string(),
            policy,
            devices,
            reply,
        })
        .await
    }

    pub async fn start_rotation(&self, key_ref: &str, revoke: Vec<DeviceId>) -> Result<(), ThresholdError> {
        self.call(|reply| Command::StartRotation {
            key_ref: key_ref.to_string(),
            revoke,
            reply,
        })
        .await
    }

    /// Returns the request id.
    pub async fn request_unlock(&self, key_ref: &str, epoch: Option<u64>) -> Result<String, ThresholdError> {
        self.call(|reply| Command::RequestUnlock {
            key_ref: key_ref.to_string(),
            epoch,
            reply,
        })
        .await
    }

    pub async fn request_recovery(&self, key_ref: &str, lost_devices: Vec<DeviceId>) -> Result<String, ThresholdError> {
        self.call(|reply| Command::RequestRecovery {
            key_ref: key_ref.to_string(),
            lost_devices,
            reply,
        })
        .await
    }

    pub async fn approve(&self, key_ref: &str, request_id: &str) -> Result<(), ThresholdError> {
        self.call(|reply| Command::Approve {
            key_ref: key_ref.to_string(),
            request_id: request_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn lock(&self, key_ref: &str) -> Result<(), ThresholdError> {
        self.commands
            .send(Command::Lock {
                key_ref: key_ref.to_string(),
            })
            .await
            .map_err(|_| ThresholdError::TransportClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ThresholdError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ThresholdError::TransportClosed)?;
        rx.await.map_err(|_| ThresholdError::TransportClosed)?
    }
}

pub struct Runner {
    coordinator: Coordinator,
    durable: Arc<dyn DurableChannel>,
    liveness: Arc<dyn LivenessChannel>,
    sink: Arc<dyn EffectSink>,
    envelopes: Vec<ShareEnvelope>,
}

impl Runner {
    pub fn new(
        coordinator: Coordinator,
        durable: Arc<dyn DurableChannel>,
        liveness: Arc<dyn LivenessChannel>,
        sink: Arc<dyn EffectSink>,
    ) -> Self {
        Self {
            coordinator,
            durable,
            liveness,
            sink,
            envelopes: Vec::new(),
        }
    }

    /// Envelopes kept by the local keystore, restored after the durable history is replayed.
    pub fn with_envelopes(mut self, envelopes: Vec<ShareEnvelope>) -> Self {
        self.envelopes = envelopes;
        self
    }

    /// Spawn the loop. The task hands the coordinator back when it stops.
    pub fn spawn(self) -> (JoinHandle<Coordinator>, RunnerHandle) {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(command_rx, shutdown_rx));
        (
            task,
            RunnerHandle {
                commands,
                shutdown_tx: Arc::new(shutdown_tx),
            },
        )
    }

    async fn run(self, mut command_rx: mpsc::Receiver<Command>, mut shutdown_rx: watch::Receiver<bool>) -> Coordinator {
        let Runner {
            mut coordinator,
            durable,
            liveness,
            sink,
            envelopes,
        } = self;

        // Subscribe before reading history so nothing falls in between; overlap is
        // dropped by the ledger as replays.
        let mut durable_rx = durable.subscribe();
        let mut liveness_rx = liveness.subscribe();
        match durable.history().await {
            Ok(history) => {
                let applied = coordinator.replay(&history);
                debug!(device = coordinator.device_id(), applied, "durable history replayed");
            }
            Err(e) => warn!(error = %e, "could not read durable history"),
        }
        for envelope in &envelopes {
            match coordinator.restore_envelope(envelope) {
                Ok(true) => debug!(key_ref = %envelope.key_ref, epoch = envelope.epoch, "share restored"),
                Ok(false) => {}
                Err(e) => warn!(key_ref = %envelope.key_ref, error = %e, "stored share rejected"),
            }
        }

        match coordinator.resume() {
            Ok(owed) => dispatch(owed, durable.as_ref(), liveness.as_ref(), sink.as_ref()).await,
            Err(e) => warn!(error = %e, "could not resume ceremonies"),
        }

        let mut ticker = time::interval(coordinator.config().tick_interval());
        info!(device = coordinator.device_id(), "threshold runner started");
        loop {
            let effects = tokio::select! {
                event = durable_rx.recv() => match event {
                    Ok(event) => coordinator.handle_durable(&event).unwrap_or_else(|e| {
                        debug!(sender = %event.sender, event = event.event.type_name(), error = %e, "event rejected");
                        Vec::new()
                    }),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "durable channel lagged; catching up from history");
                        catch_up(&mut coordinator, durable.as_ref()).await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                message = liveness_rx.recv() => {
                    if let Ok(message) = message {
                        coordinator.handle_liveness(&message, Utc::now());
                    }
                    Vec::new()
                }
                Some(command) = command_rx.recv() => execute(&mut coordinator, command),
                _ = ticker.tick() => coordinator.tick(Utc::now()).unwrap_or_else(|e| {
                    warn!(error = %e, "tick failed");
                    Vec::new()
                }),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    Vec::new()
                }
            };
            dispatch(effects, durable.as_ref(), liveness.as_ref(), sink.as_ref()).await;
        }
        info!(device = coordinator.device_id(), "threshold runner stopped");
        coordinator
    }
}

/// Feed the durable history through the coordinator again after the live feed dropped
/// events. Whatever it already applied fails the counter check and is skipped.
async fn catch_up(coordinator: &mut Coordinator, durable: &dyn DurableChannel) -> Vec<Effect> {
    let history = match durable.history().await {
        Ok(history) => history,
        Err(e) => {
            warn!(error = %e, "could not re-read durable history");
            return Vec::new();
        }
    };
    let mut effects = Vec::new();
    let mut applied = 0;
    for event in &history {
        if let Ok(produced) = coordinator.handle_durable(event) {
            applied += 1;
            effects.extend(produced);
        }
    }
    info!(device = coordinator.device_id(), applied, "caught up after lag");
    effects
}

fn execute(coordinator: &mut Coordinator, command: Command) -> Vec<Effect> {
    fn answer<T>(reply: Reply<T>, result: Result<(T, Vec<Effect>), ThresholdError>) -> Vec<Effect> {
        match result {
            Ok((value, effects)) => {
                let _ = reply.send(Ok(value));
                effects
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                Vec::new()
            }
        }
    }

    match command {
        Command::StartEnrollment {
            key_ref,
            policy,
            devices,
            reply,
        } => answer(reply, coordinator.start_enrollment(&key_ref, policy, devices).map(|e| ((), e))),
        Command::StartRotation { key_ref, revoke, reply } => {
            answer(reply, coordinator.start_rotation(&key_ref, revoke).map(|e| ((), e)))
        }
        Command::RequestUnlock { key_ref, epoch, reply } => answer(reply, coordinator.request_unlock(&key_ref, epoch)),
        Command::RequestRecovery {
            key_ref,
            lost_devices,
            reply,
        } => answer(reply, coordinator.request_recovery(&key_ref, lost_devices)),
        Command::Approve {
            key_ref,
            request_id,
            reply,
        } => answer(reply, coordinator.approve(&key_ref, &request_id).map(|e| ((), e))),
        Command::Lock { key_ref } => coordinator.lock(&key_ref),
    }
}

async fn dispatch(
    effects: Vec<Effect>,
    durable: &dyn DurableChannel,
    liveness: &dyn LivenessChannel,
    sink: &dyn EffectSink,
) {
    for effect in effects {
        let result = match effect {
            Effect::Publish(event) => durable.publish(event).await,
            Effect::Broadcast(message) => liveness.broadcast(message).await,
            other => sink.apply(&other).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "effect failed");
        }
    }
}
