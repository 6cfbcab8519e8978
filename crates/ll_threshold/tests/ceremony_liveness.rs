//! Liveness is advisory: it never completes a ceremony and its absence never blocks one.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{config, ids, is_finalize, Harness, KEY_REF};
use ll_crypto::DeviceIdentity;
use ll_proto::{AbortReason, CeremonyPhase, DeviceStatus, LivenessMessage, SignedEvent, ThresholdPolicy};
use ll_threshold::{
    Coordinator, DurableChannel, Effect, EffectSink, MemoryBus, Runner, RunnerHandle, ThresholdError,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const DEVICES: [&str; 3] = ["desktop", "phone-a", "phone-b"];

struct ChannelSink(mpsc::UnboundedSender<Effect>);

#[async_trait]
impl EffectSink for ChannelSink {
    async fn apply(&self, effect: &Effect) -> Result<(), ThresholdError> {
        self.0.send(effect.clone()).map_err(|_| ThresholdError::TransportClosed)
    }
}

/// Publishes to and reads history from the bus, but the live feed is whatever the test sends.
struct HeldFeed {
    bus: Arc<MemoryBus>,
    feed: broadcast::Sender<SignedEvent>,
}

#[async_trait]
impl DurableChannel for HeldFeed {
    async fn publish(&self, event: SignedEvent) -> Result<(), ThresholdError> {
        self.bus.publish(event).await
    }

    async fn history(&self) -> Result<Vec<SignedEvent>, ThresholdError> {
        self.bus.history().await
    }

    fn subscribe(&self) -> broadcast::Receiver<SignedEvent> {
        self.feed.subscribe()
    }
}

fn spawn(
    name: &str,
    bus: &Arc<MemoryBus>,
) -> (JoinHandle<Coordinator>, RunnerHandle, mpsc::UnboundedReceiver<Effect>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(DeviceIdentity::generate(name), config());
    let (task, handle) = Runner::new(coordinator, bus.clone(), bus.clone(), Arc::new(ChannelSink(tx))).spawn();
    (task, handle, rx)
}

/// A round trip through the command queue; the runner has subscribed once it answers.
async fn wait_started(handle: &RunnerHandle) {
    assert!(matches!(
        handle.request_unlock(KEY_REF, None).await,
        Err(ThresholdError::UnknownKey(_))
    ));
}

async fn wait_for<T>(rx: &mut mpsc::UnboundedReceiver<Effect>, pick: impl Fn(&Effect) -> Option<T>) -> T {
    timeout(Duration::from_secs(10), async {
        loop {
            let effect = rx.recv().await.expect("sink closed");
            if let Some(found) = pick(&effect) {
                return found;
            }
        }
    })
    .await
    .expect("expected effect did not arrive in time")
}

fn key_established(effect: &Effect) -> Option<u64> {
    match effect {
        Effect::KeyEstablished { epoch, .. } => Some(*epoch),
        _ => None,
    }
}

fn session_ready(effect: &Effect) -> Option<u64> {
    match effect {
        Effect::SessionReady { epoch, .. } => Some(*epoch),
        _ => None,
    }
}

async fn stop(task: JoinHandle<Coordinator>, handle: RunnerHandle) -> Coordinator {
    handle.shutdown();
    task.await.unwrap()
}

#[tokio::test]
async fn enrollment_completes_with_liveness_disabled() {
    let bus = MemoryBus::new();
    bus.set_liveness_enabled(false);
    let (desktop_task, desktop, mut desktop_rx) = spawn("desktop", &bus);
    let (a_task, phone_a, _a_rx) = spawn("phone-a", &bus);
    let (b_task, phone_b, _b_rx) = spawn("phone-b", &bus);
    for handle in [&desktop, &phone_a, &phone_b] {
        wait_started(handle).await;
    }

    desktop
        .start_enrollment(KEY_REF, ThresholdPolicy::new(2, 3).unwrap(), ids(&DEVICES))
        .await
        .unwrap();
    assert_eq!(wait_for(&mut desktop_rx, key_established).await, 1);

    // The phones see the finalize before the request, so an approval proves they hold epoch-1 shares.
    desktop.request_unlock(KEY_REF, None).await.unwrap();
    assert_eq!(wait_for(&mut desktop_rx, session_ready).await, 1);
    assert_eq!(bus.liveness_delivered(), 0);

    let desktop = stop(desktop_task, desktop).await;
    stop(a_task, phone_a).await;
    stop(b_task, phone_b).await;
    let key = desktop.ledger().key(KEY_REF).unwrap();
    assert_eq!(key.epoch, 1);
    assert_eq!(key.members.len(), 3);
}

#[tokio::test]
async fn late_device_joins_after_replaying_history() {
    let bus = MemoryBus::new();
    let (desktop_task, desktop, mut desktop_rx) = spawn("desktop", &bus);
    let (a_task, phone_a, _a_rx) = spawn("phone-a", &bus);
    wait_started(&desktop).await;
    wait_started(&phone_a).await;

    desktop
        .start_enrollment(KEY_REF, ThresholdPolicy::new(2, 3).unwrap(), ids(&DEVICES))
        .await
        .unwrap();
    // Init plus phone-a's join are in the history before phone-b starts.
    timeout(Duration::from_secs(10), async {
        while bus.published() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (b_task, phone_b, _b_rx) = spawn("phone-b", &bus);
    // Finalizing needs phone-b's acknowledgement, so it must have joined on its own.
    assert_eq!(wait_for(&mut desktop_rx, key_established).await, 1);

    stop(desktop_task, desktop).await;
    stop(a_task, phone_a).await;
    let phone_b = stop(b_task, phone_b).await;
    let ceremony = phone_b.ledger().key(KEY_REF).and_then(|k| k.ceremony.clone()).unwrap();
    assert!(ceremony.status("phone-b").is_some_and(|s| s != DeviceStatus::Discovered));
}

#[tokio::test]
async fn lagging_device_catches_up_from_history() {
    let bus = MemoryBus::new();
    let (feed, _) = broadcast::channel::<SignedEvent>(1);
    let held = Arc::new(HeldFeed {
        bus: bus.clone(),
        feed: feed.clone(),
    });
    let (desktop_task, desktop, mut desktop_rx) = spawn("desktop", &bus);
    let (a_task, phone_a, _a_rx) = spawn("phone-a", &bus);
    let (b_tx, _b_rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(DeviceIdentity::generate("phone-b"), config());
    let (b_task, phone_b) = Runner::new(coordinator, held, bus.clone(), Arc::new(ChannelSink(b_tx))).spawn();
    for handle in [&desktop, &phone_a, &phone_b] {
        wait_started(handle).await;
    }

    desktop
        .start_enrollment(KEY_REF, ThresholdPolicy::new(2, 3).unwrap(), ids(&DEVICES))
        .await
        .unwrap();
    timeout(Duration::from_secs(10), async {
        while bus.published() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Init and phone-a's join overflow phone-b's one-slot feed, so the init never arrives live.
    let missed = bus.history().await.unwrap();
    let mut live = DurableChannel::subscribe(bus.as_ref());
    for event in missed {
        let _ = feed.send(event);
    }
    let forwarder = tokio::spawn(async move {
        while let Ok(event) = live.recv().await {
            let _ = feed.send(event);
        }
    });

    assert_eq!(wait_for(&mut desktop_rx, key_established).await, 1);

    let desktop = stop(desktop_task, desktop).await;
    stop(a_task, phone_a).await;
    stop(b_task, phone_b).await;
    forwarder.abort();
    let key = desktop.ledger().key(KEY_REF).unwrap();
    assert!(key.members.contains_key("phone-b"));
}

fn heartbeats(h: &mut Harness, at: chrono::DateTime<Utc>) {
    for to in DEVICES {
        for from in DEVICES {
            let message = LivenessMessage::Heartbeat {
                device_id: from.to_string(),
                key_ref: KEY_REF.to_string(),
                sent_at: at,
            };
            h.device_mut(to).handle_liveness(&message, at);
        }
    }
}

fn failures(effects: &[Effect]) -> Vec<(CeremonyPhase, AbortReason)> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::CeremonyFailed { phase, reason, .. } => Some((*phase, reason.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn heartbeats_alone_never_finalize() {
    let mut h = Harness::new(&DEVICES, config());
    h.drop_events(is_finalize);
    h.call("desktop", |c| {
        c.start_enrollment(KEY_REF, ThresholdPolicy::new(2, 3).unwrap(), ids(&DEVICES))
    })
    .unwrap();
    h.pump();
    assert_eq!(h.dropped.len(), 1);

    let now = Utc::now();
    heartbeats(&mut h, now);
    let statuses = h.device("desktop").device_statuses(KEY_REF, now).unwrap();
    assert!(statuses.values().all(|s| *s == DeviceStatus::Verified));
    for device in DEVICES {
        let key = h.device(device).ledger().key(KEY_REF).unwrap();
        assert_eq!(key.epoch, 0);
        assert_eq!(key.active_ceremony().unwrap().phase, CeremonyPhase::VerifyingShares);
    }

    // Everyone stays online, yet the phase still times out.
    let later = now + chrono::Duration::seconds(121);
    heartbeats(&mut h, later);
    let effects = h.device_mut("desktop").tick(later).unwrap();
    h.submit("desktop", effects);
    h.pump();

    for device in DEVICES {
        let key = h.device(device).ledger().key(KEY_REF).unwrap();
        let ceremony = key.ceremony.as_ref().unwrap();
        assert_eq!(ceremony.phase, CeremonyPhase::Error);
        assert_eq!(ceremony.abort_reason, Some(AbortReason::Timeout));
        assert_eq!(
            failures(&h.take(device)),
            vec![(CeremonyPhase::VerifyingShares, AbortReason::Timeout)]
        );
        assert!(matches!(
            h.device(device).ceremony_result(KEY_REF),
            Err(ThresholdError::CeremonyTimeout {
                phase: CeremonyPhase::VerifyingShares
            })
        ));
    }
}

#[test]
fn missing_device_times_out_the_join_phase() {
    let mut h = Harness::new(&DEVICES, config());
    h.set_offline("phone-b");
    h.call("desktop", |c| {
        c.start_enrollment(KEY_REF, ThresholdPolicy::new(2, 3).unwrap(), ids(&DEVICES))
    })
    .unwrap();
    h.pump();
    assert_eq!(h.device("desktop").ceremony_result(KEY_REF).unwrap(), None);
    let phase = |h: &Harness| h.device("desktop").ledger().key(KEY_REF).unwrap().ceremony.as_ref().unwrap().phase;
    assert_eq!(phase(&h), CeremonyPhase::CollectingJoins);

    // Not yet.
    let now = Utc::now();
    let early = h.device_mut("desktop").tick(now + chrono::Duration::seconds(10)).unwrap();
    assert!(!early.iter().any(|e| matches!(e, Effect::Publish(_))));

    let later = now + chrono::Duration::seconds(301);
    let effects = h.device_mut("desktop").tick(later).unwrap();
    h.submit("desktop", effects);
    h.pump();
    assert_eq!(phase(&h), CeremonyPhase::Error);
    assert_eq!(
        failures(&h.take("desktop")),
        vec![(CeremonyPhase::CollectingJoins, AbortReason::Timeout)]
    );
    assert!(matches!(
        h.device("desktop").ceremony_result(KEY_REF),
        Err(ThresholdError::CeremonyTimeout {
            phase: CeremonyPhase::CollectingJoins
        })
    ));

    let statuses = h.device("desktop").device_statuses(KEY_REF, later).unwrap();
    assert_eq!(statuses["phone-b"], DeviceStatus::TimedOut);
    assert_eq!(statuses["desktop"], DeviceStatus::TimedOut);

    // A second tick does not abort twice.
    let again = h.device_mut("desktop").tick(later + chrono::Duration::seconds(1)).unwrap();
    assert!(!again.iter().any(|e| matches!(e, Effect::Publish(_))));

    // Once phone-b is back, a fresh enrollment reaches epoch 1.
    h.set_online("phone-b");
    h.pump();
    h.call("desktop", |c| {
        c.start_enrollment(KEY_REF, ThresholdPolicy::new(2, 3).unwrap(), ids(&DEVICES))
    })
    .unwrap();
    h.pump();
    for device in DEVICES {
        assert_eq!(h.device(device).ledger().key(KEY_REF).unwrap().epoch, 1);
        assert_eq!(h.device(device).ceremony_result(KEY_REF).unwrap(), Some(1));
    }
}

#[test]
fn silent_peer_shows_offline_without_changing_the_ledger() {
    let mut h = Harness::new(&DEVICES, config());
    h.call("desktop", |c| {
        c.start_enrollment(KEY_REF, ThresholdPolicy::new(2, 3).unwrap(), ids(&DEVICES))
    })
    .unwrap();
    h.pump();
    let before = h.device("desktop").ledger().clone();

    let now = Utc::now();
    let beat = LivenessMessage::Heartbeat {
        device_id: "phone-a".into(),
        key_ref: KEY_REF.into(),
        sent_at: now,
    };
    h.device_mut("desktop").handle_liveness(&beat, now);
    let statuses = h.device("desktop").device_statuses(KEY_REF, now).unwrap();
    assert_eq!(statuses["phone-a"], DeviceStatus::Ready);
    assert_eq!(statuses["phone-b"], DeviceStatus::Offline);
    assert_eq!(statuses["desktop"], DeviceStatus::Ready);
    assert_eq!(h.device("desktop").ledger(), &before);
}
