//! A shopping list shared by a desktop and two phones, from enrollment through losing a
//! phone and rotating it out.

mod common;

use common::{config, expected_entries, ids, DesktopStore, Harness, KEY_REF};
use ll_crypto::SecretKey;
use ll_proto::{CeremonyPhase, EncryptionMethod, ThresholdPolicy};
use ll_store::{GateError, OpenMode};
use ll_threshold::{Effect, ThresholdError};

const DEVICES: [&str; 3] = ["desktop", "phone-a", "phone-b"];

fn session_ready(effects: &[Effect]) -> Vec<u64> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::SessionReady { epoch, .. } => Some(*epoch),
            _ => None,
        })
        .collect()
}

fn established(effects: &[Effect]) -> Vec<(u64, Option<u64>, ThresholdPolicy)> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::KeyEstablished {
                epoch,
                previous_epoch,
                policy,
                ..
            } => Some((*epoch, *previous_epoch, *policy)),
            _ => None,
        })
        .collect()
}

fn enroll(h: &mut Harness) {
    h.call("desktop", |c| {
        c.start_enrollment(KEY_REF, ThresholdPolicy::new(2, 3).unwrap(), ids(&DEVICES))
    })
    .unwrap();
    h.pump();
}

#[tokio::test]
async fn enroll_unlock_lose_a_phone_and_rotate() {
    let store = DesktopStore::with_list().await;
    let mut h = Harness::new(&DEVICES, config());

    // Enrollment: 2-of-3 at epoch 1 on every device.
    enroll(&mut h);
    assert!(h.rejections.is_empty(), "{:?}", h.rejections);
    for device in DEVICES {
        let key = h.device(device).ledger().key(KEY_REF).unwrap();
        assert_eq!(key.epoch, 1);
        assert_eq!(key.policy, Some(ThresholdPolicy::new(2, 3).unwrap()));
        assert_eq!(key.ceremony.as_ref().unwrap().phase, CeremonyPhase::Ready);
        assert_eq!(h.device(device).share_epoch(KEY_REF), Some(1));
    }
    assert_eq!(h.device("desktop").ledger(), h.device("phone-a").ledger());
    assert_eq!(h.device("desktop").ledger(), h.device("phone-b").ledger());

    let effects = h.take("desktop");
    assert_eq!(established(&effects), vec![(1, None, ThresholdPolicy::new(2, 3).unwrap())]);
    store.apply(&effects).await;
    let record = store.gate.registry().get("my-list").unwrap().unwrap();
    assert_eq!(record.encryption_method, EncryptionMethod::ThresholdV1);
    assert_eq!(record.epoch, 1);
    assert_eq!(store.read_all().await, expected_entries());

    // Lock, then unlock with one phone's approval.
    let locked = h.device_mut("desktop").lock(KEY_REF);
    store.apply(&locked).await;
    assert!(matches!(
        store.gate.open("my-list", OpenMode::ReadOnly).await,
        Err(GateError::NeedsCredential { .. })
    ));

    h.call("desktop", |c| c.request_unlock(KEY_REF, None).map(|(_, e)| e)).unwrap();
    h.pump();
    let effects = h.take("desktop");
    assert_eq!(session_ready(&effects), vec![1]);
    store.apply(&effects).await;
    assert_eq!(store.read_all().await, expected_entries());

    // phone-a is lost: recover with phone-b and rotate it out.
    h.set_offline("phone-a");
    h.call("desktop", |c| {
        c.request_recovery(KEY_REF, ids(&["phone-a"])).map(|(_, e)| e)
    })
    .unwrap();
    h.pump();
    assert!(h.rejections.is_empty(), "{:?}", h.rejections);
    let effects = h.take("desktop");
    assert_eq!(session_ready(&effects), vec![1]);
    assert_eq!(established(&effects), vec![(2, Some(1), ThresholdPolicy::new(2, 2).unwrap())]);
    store.apply(&effects).await;

    let record = store.gate.registry().get("my-list").unwrap().unwrap();
    assert_eq!(record.epoch, 2);
    assert_eq!(record.threshold_policy, Some(ThresholdPolicy::new(2, 2).unwrap()));
    assert_eq!(store.read_all().await, expected_entries());

    let key = h.device("desktop").ledger().key(KEY_REF).unwrap();
    assert_eq!(key.epoch, 2);
    assert!(key.revoked_epochs.contains(&1));
    assert!(key.revoked_devices.contains("phone-a"));
    assert!(!key.members.contains_key("phone-a"));
    assert_eq!(h.device("phone-b").share_epoch(KEY_REF), Some(2));

    // The old epoch is gone for good.
    match h.device_mut("desktop").request_unlock(KEY_REF, Some(1)) {
        Err(ThresholdError::EpochRevoked { epoch, current, .. }) => {
            assert_eq!(epoch, 1);
            assert_eq!(current, 2);
        }
        other => panic!("expected EpochRevoked, got {other:?}"),
    }
    match store
        .gate
        .install_session("my-list", SecretKey::random(), 1, None)
    {
        Err(GateError::StaleSession { held, current }) => {
            assert_eq!(held, 1);
            assert_eq!(current, 2);
        }
        other => panic!("expected StaleSession, got {other:?}"),
    }

    // phone-a comes back, catches up and finds itself revoked.
    h.set_online("phone-a");
    h.pump();
    assert_eq!(h.device("phone-a").ledger(), h.device("desktop").ledger());
    assert_eq!(h.device("phone-a").share_epoch(KEY_REF), None);
    assert!(matches!(
        h.device_mut("phone-a").request_unlock(KEY_REF, None),
        Err(ThresholdError::NotMember { .. })
    ));
    assert!(matches!(
        h.device_mut("phone-a").request_unlock(KEY_REF, Some(1)),
        Err(ThresholdError::EpochRevoked { .. })
    ));

    // Epoch 2 unlocks with the remaining phone.
    let locked = h.device_mut("desktop").lock(KEY_REF);
    store.apply(&locked).await;
    h.call("desktop", |c| c.request_unlock(KEY_REF, None).map(|(_, e)| e)).unwrap();
    h.pump();
    let effects = h.take("desktop");
    assert_eq!(session_ready(&effects), vec![2]);
    store.apply(&effects).await;
    assert_eq!(store.read_all().await, expected_entries());
}

#[test]
fn approval_waits_for_the_user_without_auto_approve() {
    let mut h = Harness::new(&DEVICES, ll_threshold::CeremonyConfig::default());
    enroll(&mut h);
    h.take("desktop");
    h.take("phone-a");

    h.call("desktop", |c| c.request_unlock(KEY_REF, None).map(|(_, e)| e)).unwrap();
    h.pump();
    assert!(session_ready(&h.take("desktop")).is_empty());

    let asked = h.take("phone-a");
    let request_id = asked
        .iter()
        .find_map(|e| match e {
            Effect::ApprovalRequired {
                request_id, recovery, ..
            } => {
                assert!(!recovery);
                Some(request_id.clone())
            }
            _ => None,
        })
        .expect("phone-a should be asked");

    h.call("phone-a", |c| c.approve(KEY_REF, &request_id)).unwrap();
    h.pump();
    assert_eq!(session_ready(&h.take("desktop")), vec![1]);
}

#[test]
fn recovery_needs_enough_survivors() {
    let mut h = Harness::new(&DEVICES, config());
    enroll(&mut h);
    match h
        .device_mut("desktop")
        .request_recovery(KEY_REF, ids(&["phone-a", "phone-b"]))
    {
        Err(ThresholdError::NotEnoughSurvivors { have, need }) => {
            assert_eq!(have, 1);
            assert_eq!(need, 2);
        }
        other => panic!("expected NotEnoughSurvivors, got {other:?}"),
    }
}

#[test]
fn voluntary_rotation_advances_the_epoch() {
    let mut h = Harness::new(&DEVICES, config());
    enroll(&mut h);
    h.take("desktop");

    h.call("phone-b", |c| c.start_rotation(KEY_REF, ids(&["phone-a"]))).unwrap();
    h.pump();
    assert!(h.rejections.is_empty(), "{:?}", h.rejections);

    let effects = h.take("phone-b");
    assert_eq!(established(&effects), vec![(2, Some(1), ThresholdPolicy::new(2, 2).unwrap())]);
    for device in DEVICES {
        let key = h.device(device).ledger().key(KEY_REF).unwrap();
        assert_eq!(key.epoch, 2);
        assert!(key.is_revoked(1));
    }
    assert_eq!(h.device("phone-a").share_epoch(KEY_REF), None);
    assert_eq!(h.device("desktop").share_epoch(KEY_REF), Some(2));
    assert_eq!(h.events_of_type("threshold.rotate.commit"), 1);
}
