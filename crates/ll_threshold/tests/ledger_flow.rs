//! The durable reducer on hand-signed event streams.

use chrono::{DateTime, Duration, Utc};
use ll_crypto::{DeviceIdentity, DevicePublicKeys, Sealed, SealedBox, DEFAULT_ALG};
use ll_proto::ceremony::approval_signing_bytes;
use ll_proto::{
    CeremonyEvent, CeremonyFinalize, CeremonyInit, CeremonyJoin, CeremonyKind, CeremonyPhase, DeviceStatus,
    RotateCommit, ShareAck, ShareEnvelope, ShareReject, SignedEvent, ThresholdPolicy, UnlockApproval,
    UnlockRequest,
};
use ll_threshold::{Ledger, ThresholdError};

const KEY_REF: &str = "db:my-list";

struct Device {
    identity: DeviceIdentity,
    counter: u64,
}

impl Device {
    fn new(id: &str) -> Self {
        Self {
            identity: DeviceIdentity::generate(id),
            counter: 0,
        }
    }

    fn id(&self) -> String {
        self.identity.device_id().to_string()
    }

    fn sign(&mut self, event: CeremonyEvent) -> SignedEvent {
        self.counter += 1;
        SignedEvent::sign(&self.identity, self.counter, event).unwrap()
    }

    fn join(&mut self, ceremony: &str, epoch: u64) -> SignedEvent {
        let device = self.identity.public_keys();
        self.sign(CeremonyEvent::Join(CeremonyJoin {
            ceremony_id: ceremony.into(),
            key_ref: KEY_REF.into(),
            epoch,
            device,
        }))
    }

    fn ack(&mut self, ceremony: &str, epoch: u64, commitment: &str) -> SignedEvent {
        let device_id = self.id();
        self.sign(CeremonyEvent::ShareAck(ShareAck {
            ceremony_id: ceremony.into(),
            key_ref: KEY_REF.into(),
            epoch,
            device_id,
            share_commitment: commitment.into(),
        }))
    }

    fn unlock_request(&mut self, request_id: &str, epoch: u64, at: DateTime<Utc>) -> SignedEvent {
        let requester = self.id();
        self.counter += 1;
        let event = CeremonyEvent::UnlockRequest(UnlockRequest {
            request_id: request_id.into(),
            key_ref: KEY_REF.into(),
            epoch,
            requester,
            ttl_secs: 60,
        });
        SignedEvent::sign_at(&self.identity, self.counter, at, event).unwrap()
    }

    fn approval(&mut self, request_id: &str, epoch: u64) -> SignedEvent {
        let approver = self.id();
        let contribution = SealedBox {
            ephemeral_pub: [0; 32],
            sealed: Sealed {
                alg: DEFAULT_ALG.into(),
                nonce: vec![0; 24],
                ciphertext: vec![1, 2, 3],
            },
        };
        let signing = approval_signing_bytes(request_id, KEY_REF, epoch, &approver, &contribution).unwrap();
        let signature = self.identity.sign(&signing);
        self.sign(CeremonyEvent::UnlockApproval(UnlockApproval {
            request_id: request_id.into(),
            key_ref: KEY_REF.into(),
            epoch,
            approver,
            contribution,
            signature,
        }))
    }
}

fn init(ceremony: &str, epoch: u64, initiator: &Device, policy: ThresholdPolicy, devices: &[&Device]) -> CeremonyEvent {
    CeremonyEvent::Init(CeremonyInit {
        ceremony_id: ceremony.into(),
        key_ref: KEY_REF.into(),
        epoch,
        policy,
        devices: devices.iter().map(|d| d.id()).collect(),
        initiator: initiator.identity.public_keys(),
        kind: CeremonyKind::Enrollment,
    })
}

fn envelope(ceremony: &str, epoch: u64, from: &Device, to: &Device) -> CeremonyEvent {
    CeremonyEvent::ShareEnvelope(ShareEnvelope {
        ceremony_id: ceremony.into(),
        to: to.id(),
        from: from.id(),
        key_ref: KEY_REF.into(),
        epoch,
        ephemeral_pub: [7; 32],
        wrapped_share: vec![1, 2, 3],
        nonce: vec![0; 24],
        alg: "xchacha20poly1305".into(),
        share_commitment: commitment_for(to),
    })
}

fn commitment_for(device: &Device) -> String {
    format!("commitment-{}", device.id())
}

fn apply_all(ledger: &mut Ledger, events: &[SignedEvent]) {
    for event in events {
        ledger.apply(event).unwrap();
    }
}

/// Everything up to the point where every share has been answered, with phone-b rejecting.
fn dealt_with_one_reject(desktop: &mut Device, phone_a: &mut Device, phone_b: &mut Device) -> Vec<SignedEvent> {
    let policy = ThresholdPolicy::new(2, 3).unwrap();
    let start = init("c1", 1, desktop, policy, &[&*desktop, &*phone_a, &*phone_b]);
    let mut events = vec![desktop.sign(start)];
    events.push(phone_a.join("c1", 1));
    events.push(phone_b.join("c1", 1));
    let envelopes: Vec<CeremonyEvent> = [&*desktop, &*phone_a, &*phone_b]
        .into_iter()
        .map(|to| envelope("c1", 1, &*desktop, to))
        .collect();
    for env in envelopes {
        events.push(desktop.sign(env));
    }
    let desktop_commitment = commitment_for(desktop);
    events.push(desktop.ack("c1", 1, &desktop_commitment));
    let phone_a_commitment = commitment_for(phone_a);
    events.push(phone_a.ack("c1", 1, &phone_a_commitment));
    let reason = "commitment mismatch".to_string();
    let phone_b_id = phone_b.id();
    events.push(phone_b.sign(CeremonyEvent::ShareReject(ShareReject {
        ceremony_id: "c1".into(),
        key_ref: KEY_REF.into(),
        epoch: 1,
        device_id: phone_b_id,
        reason,
    })));
    events
}

fn finalize(
    desktop: &mut Device,
    ceremony: &str,
    epoch: u64,
    policy: ThresholdPolicy,
    members: &[DevicePublicKeys],
) -> SignedEvent {
    let devices = members.to_vec();
    desktop.sign(CeremonyEvent::Finalize(CeremonyFinalize {
        ceremony_id: ceremony.into(),
        key_ref: KEY_REF.into(),
        epoch,
        policy,
        devices,
        secret_commitment: "secret".into(),
    }))
}

/// Envelopes to both devices, then both acknowledge.
fn deal_and_settle(ceremony: &str, epoch: u64, desktop: &mut Device, phone_a: &mut Device) -> Vec<SignedEvent> {
    let envelopes: Vec<CeremonyEvent> = [&*desktop, &*phone_a]
        .into_iter()
        .map(|to| envelope(ceremony, epoch, &*desktop, to))
        .collect();
    let mut events: Vec<SignedEvent> = envelopes.into_iter().map(|env| desktop.sign(env)).collect();
    let desktop_commitment = commitment_for(desktop);
    events.push(desktop.ack(ceremony, epoch, &desktop_commitment));
    let phone_a_commitment = commitment_for(phone_a);
    events.push(phone_a.ack(ceremony, epoch, &phone_a_commitment));
    events
}

/// A finished 2-of-2 enrollment at epoch 1.
fn enroll_pair(desktop: &mut Device, phone_a: &mut Device) -> Vec<SignedEvent> {
    let policy = ThresholdPolicy::new(2, 2).unwrap();
    let start = init("c1", 1, desktop, policy, &[&*desktop, &*phone_a]);
    let mut events = vec![desktop.sign(start)];
    events.push(phone_a.join("c1", 1));
    events.extend(deal_and_settle("c1", 1, desktop, phone_a));
    let members = [desktop.identity.public_keys(), phone_a.identity.public_keys()];
    events.push(finalize(desktop, "c1", 1, policy, &members));
    events
}

/// Rotation of the same pair to epoch 2, committed.
fn rotate_pair(desktop: &mut Device, phone_a: &mut Device) -> Vec<SignedEvent> {
    let policy = ThresholdPolicy::new(2, 2).unwrap();
    let start = CeremonyEvent::Init(CeremonyInit {
        ceremony_id: "c2".into(),
        key_ref: KEY_REF.into(),
        epoch: 2,
        policy,
        devices: vec![desktop.id(), phone_a.id()],
        initiator: desktop.identity.public_keys(),
        kind: CeremonyKind::Rotation {
            previous_epoch: 1,
            revoked_devices: vec![],
        },
    });
    let mut events = vec![desktop.sign(start)];
    events.push(phone_a.join("c2", 2));
    events.extend(deal_and_settle("c2", 2, desktop, phone_a));
    let members = [desktop.identity.public_keys(), phone_a.identity.public_keys()];
    events.push(finalize(desktop, "c2", 2, policy, &members));
    events.push(desktop.sign(CeremonyEvent::RotateCommit(RotateCommit {
        ceremony_id: "c2".into(),
        key_ref: KEY_REF.into(),
        old_epoch: 1,
        new_epoch: 2,
        revoked_devices: vec![],
    })));
    events
}

fn open_requests(ledger: &Ledger) -> Vec<String> {
    ledger.key(KEY_REF).unwrap().requests.keys().cloned().collect()
}

#[test]
fn a_reject_marks_only_the_rejecting_device() {
    let (mut desktop, mut phone_a, mut phone_b) = (Device::new("desktop"), Device::new("phone-a"), Device::new("phone-b"));
    let events = dealt_with_one_reject(&mut desktop, &mut phone_a, &mut phone_b);
    let mut ledger = Ledger::new();
    apply_all(&mut ledger, &events);

    let ceremony = ledger.key(KEY_REF).unwrap().active_ceremony().unwrap();
    assert_eq!(ceremony.phase, CeremonyPhase::VerifyingShares);
    assert_eq!(ceremony.status("desktop"), Some(DeviceStatus::Verified));
    assert_eq!(ceremony.status("phone-a"), Some(DeviceStatus::Verified));
    assert_eq!(ceremony.status("phone-b"), Some(DeviceStatus::Error));
    assert!(ceremony.all_settled());
}

#[test]
fn finalize_keeps_the_verified_devices() {
    let (mut desktop, mut phone_a, mut phone_b) = (Device::new("desktop"), Device::new("phone-a"), Device::new("phone-b"));
    let mut events = dealt_with_one_reject(&mut desktop, &mut phone_a, &mut phone_b);

    // Naming the rejecting device is refused.
    let mut ledger = Ledger::new();
    apply_all(&mut ledger, &events);
    let all = [desktop.identity.public_keys(), phone_a.identity.public_keys(), phone_b.identity.public_keys()];
    let too_many = finalize(&mut desktop, "c1", 1, ThresholdPolicy::new(2, 3).unwrap(), &all);
    assert!(matches!(
        ledger.apply(&too_many),
        Err(ThresholdError::InvalidTransition { .. })
    ));

    events.push(finalize(&mut desktop, "c1", 1, ThresholdPolicy::new(2, 2).unwrap(), &all[..2]));
    let mut ledger = Ledger::new();
    apply_all(&mut ledger, &events);

    let key = ledger.key(KEY_REF).unwrap();
    assert_eq!(key.epoch, 1);
    assert_eq!(key.policy, Some(ThresholdPolicy::new(2, 2).unwrap()));
    assert_eq!(key.members.keys().cloned().collect::<Vec<_>>(), vec!["desktop", "phone-a"]);
    assert_eq!(key.members["phone-a"].share_index, 2);
    assert_eq!(key.members["phone-a"].share_commitment, "commitment-phone-a");
    assert!(key.active_ceremony().is_none());

    // Every replica that folds the same stream ends up identical.
    let mut replica = Ledger::new();
    apply_all(&mut replica, &events);
    assert_eq!(replica, ledger);
}

#[test]
fn mismatched_ack_fails_that_device() {
    let (mut desktop, mut phone_a) = (Device::new("desktop"), Device::new("phone-a"));
    let policy = ThresholdPolicy::new(2, 2).unwrap();
    let mut ledger = Ledger::new();
    let init_event = init("c1", 1, &desktop, policy, &[&desktop, &phone_a]);
    let init_event = desktop.sign(init_event);
    let join = phone_a.join("c1", 1);
    let to_desktop = envelope("c1", 1, &desktop, &desktop);
    let to_desktop = desktop.sign(to_desktop);
    let to_phone = envelope("c1", 1, &desktop, &phone_a);
    let to_phone = desktop.sign(to_phone);
    apply_all(&mut ledger, &[init_event, join, to_desktop, to_phone]);

    ledger.apply(&phone_a.ack("c1", 1, "something-else")).unwrap();
    let ceremony = ledger.key(KEY_REF).unwrap().active_ceremony().unwrap();
    assert_eq!(ceremony.status("phone-a"), Some(DeviceStatus::Error));
    assert_eq!(ceremony.status("desktop"), Some(DeviceStatus::ShareReceived));
}

#[test]
fn epochs_only_move_forward() {
    let (mut desktop, mut phone_a, mut phone_b) = (Device::new("desktop"), Device::new("phone-a"), Device::new("phone-b"));
    let mut events = dealt_with_one_reject(&mut desktop, &mut phone_a, &mut phone_b);
    let members = [desktop.identity.public_keys(), phone_a.identity.public_keys()];
    events.push(finalize(&mut desktop, "c1", 1, ThresholdPolicy::new(2, 2).unwrap(), &members));
    let mut ledger = Ledger::new();
    apply_all(&mut ledger, &events);

    let policy = ThresholdPolicy::new(2, 2).unwrap();
    let again = init("c2", 1, &desktop, policy, &[&desktop, &phone_a]);
    let again = desktop.sign(again);
    assert!(matches!(ledger.apply(&again), Err(ThresholdError::EpochRevoked { .. })));

    let skipped = init("c3", 3, &desktop, policy, &[&desktop, &phone_a]);
    let skipped = desktop.sign(skipped);
    assert!(ledger.apply(&skipped).is_err());

    // A second enrollment is refused even at the next epoch; rotation is the only way forward.
    let re_enroll = init("c4", 2, &desktop, policy, &[&desktop, &phone_a]);
    let re_enroll = desktop.sign(re_enroll);
    assert!(ledger.apply(&re_enroll).is_err());
    assert_eq!(ledger.key(KEY_REF).unwrap().epoch, 1);
}

#[test]
fn counters_are_tracked_per_sender() {
    let (mut desktop, mut phone_a) = (Device::new("desktop"), Device::new("phone-a"));
    let policy = ThresholdPolicy::new(2, 2).unwrap();
    let mut ledger = Ledger::new();
    let first = init("c1", 1, &desktop, policy, &[&desktop, &phone_a]);
    let first = desktop.sign(first);
    ledger.apply(&first).unwrap();
    let join = phone_a.join("c1", 1);
    ledger.apply(&join).unwrap();
    assert_eq!(ledger.last_counter("desktop"), 1);
    assert_eq!(ledger.last_counter("phone-a"), 1);

    match ledger.apply(&join) {
        Err(ThresholdError::Replay { sender, counter, last }) => {
            assert_eq!(sender, "phone-a");
            assert_eq!(counter, 1);
            assert_eq!(last, 1);
        }
        other => panic!("expected Replay, got {other:?}"),
    }
}

#[test]
fn approvals_for_a_rotated_out_epoch_are_refused() {
    let (mut desktop, mut phone_a) = (Device::new("desktop"), Device::new("phone-a"));
    let mut ledger = Ledger::new();
    let enrolled = enroll_pair(&mut desktop, &mut phone_a);
    apply_all(&mut ledger, &enrolled);
    let request = desktop.unlock_request("r1", 1, Utc::now());
    ledger.apply(&request).unwrap();

    let rotated = rotate_pair(&mut desktop, &mut phone_a);
    apply_all(&mut ledger, &rotated);
    let key = ledger.key(KEY_REF).unwrap();
    assert_eq!(key.epoch, 2);
    assert!(key.revoked_epochs.contains(&1));

    let late = phone_a.approval("r1", 1);
    match ledger.apply(&late) {
        Err(ThresholdError::EpochRevoked { epoch, current, .. }) => {
            assert_eq!(epoch, 1);
            assert_eq!(current, 2);
        }
        other => panic!("expected EpochRevoked, got {other:?}"),
    }

    // The current epoch still works.
    let fresh = desktop.unlock_request("r2", 2, Utc::now());
    ledger.apply(&fresh).unwrap();
    ledger.apply(&phone_a.approval("r2", 2)).unwrap();
}

#[test]
fn answered_requests_leave_the_ledger() {
    let (mut desktop, mut phone_a) = (Device::new("desktop"), Device::new("phone-a"));
    let mut ledger = Ledger::new();
    let enrolled = enroll_pair(&mut desktop, &mut phone_a);
    apply_all(&mut ledger, &enrolled);

    let request = desktop.unlock_request("r1", 1, Utc::now());
    ledger.apply(&request).unwrap();
    assert_eq!(open_requests(&ledger), vec!["r1"]);

    ledger.apply(&phone_a.approval("r1", 1)).unwrap();
    assert!(open_requests(&ledger).is_empty());
}

#[test]
fn old_requests_are_dropped_when_new_ones_open() {
    let (mut desktop, mut phone_a) = (Device::new("desktop"), Device::new("phone-a"));
    let mut ledger = Ledger::new();
    let enrolled = enroll_pair(&mut desktop, &mut phone_a);
    apply_all(&mut ledger, &enrolled);

    let start = Utc::now();
    let first = desktop.unlock_request("r1", 1, start);
    let second = phone_a.unlock_request("r2", 1, start + Duration::minutes(30));
    apply_all(&mut ledger, &[first, second]);
    assert_eq!(open_requests(&ledger), vec!["r1", "r2"]);

    let third = desktop.unlock_request("r3", 1, start + Duration::minutes(61));
    ledger.apply(&third).unwrap();
    assert_eq!(open_requests(&ledger), vec!["r2", "r3"]);
}
