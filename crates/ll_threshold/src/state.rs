//! Deterministic reducer over the durable event stream.
//!
//! `Ledger::apply` is a pure function of the events it has seen: no clocks, no randomness,
//! no local secrets. Every participant feeding the same ordered stream ends up with an
//! identical ledger, which is what lets devices agree on phase, membership and epoch
//! without a coordinator of record.
//!
//! Authentication happens here too. Each event is checked against the sender's pinned
//! public keys and its counter must be strictly greater than the last one accepted from
//! that sender. Keys are pinned the first time a device introduces itself (`init` for the
//! initiator, `join` for everyone else) and never change afterwards. Neither the pin nor the
//! counter moves for an event the reducer rejects.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use ll_crypto::DevicePublicKeys;
use ll_proto::{
    AbortReason, CeremonyAbort, CeremonyEvent, CeremonyFinalize, CeremonyInit, CeremonyJoin, CeremonyKind,
    CeremonyPhase, DeviceId, DeviceStatus, RecoveryRequest, RotateCommit, ShareAck, ShareEnvelope, ShareReject,
    SignedEvent, ThresholdPolicy, UnlockApproval, UnlockRequest,
};

use crate::error::ThresholdError;

/// Requests older than this, measured against the `sent_at` of a newer request, are dropped.
const REQUEST_RETENTION_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub status: DeviceStatus,
    pub keys: Option<DevicePublicKeys>,
    pub share_commitment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CeremonyState {
    pub ceremony_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub policy: ThresholdPolicy,
    pub phase: CeremonyPhase,
    pub kind: CeremonyKind,
    pub initiator: DeviceId,
    /// Participants in `init` order; share index = position + 1.
    pub order: Vec<DeviceId>,
    pub devices: BTreeMap<DeviceId, DeviceState>,
    /// `sent_at` of the event that moved the ceremony into its current phase.
    pub phase_since: DateTime<Utc>,
    pub abort_reason: Option<AbortReason>,
    /// Phase the ceremony was in when it was aborted.
    pub failed_in: Option<CeremonyPhase>,
}

impl CeremonyState {
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, CeremonyPhase::Ready | CeremonyPhase::Error)
    }

    /// `Some(epoch)` once ready, `None` while running, the abort reason as an error otherwise.
    pub fn outcome(&self) -> Result<Option<u64>, ThresholdError> {
        match self.phase {
            CeremonyPhase::Ready => Ok(Some(self.epoch)),
            CeremonyPhase::Error => Err(match &self.abort_reason {
                Some(AbortReason::ShareVerificationFailed { device_id }) => ThresholdError::ShareVerificationFailed {
                    device: device_id.clone(),
                },
                Some(AbortReason::Cancelled) => ThresholdError::CeremonyCancelled {
                    key_ref: self.key_ref.clone(),
                },
                Some(AbortReason::Timeout) | None => ThresholdError::CeremonyTimeout {
                    phase: self.failed_in.unwrap_or(self.phase),
                },
            }),
            _ => Ok(None),
        }
    }

    pub fn share_index(&self, device: &str) -> Option<u8> {
        self.order
            .iter()
            .position(|d| d == device)
            .and_then(|i| u8::try_from(i + 1).ok())
    }

    pub fn status(&self, device: &str) -> Option<DeviceStatus> {
        self.devices.get(device).map(|d| d.status)
    }

    fn all(&self, pred: impl Fn(DeviceStatus) -> bool) -> bool {
        self.devices.values().all(|d| pred(d.status))
    }

    /// Devices that verified their share, in share-index order.
    pub fn verified(&self) -> Vec<&DevicePublicKeys> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id))
            .filter(|d| d.status == DeviceStatus::Verified)
            .filter_map(|d| d.keys.as_ref())
            .collect()
    }

    /// Every participant has either verified its share or failed.
    pub fn all_settled(&self) -> bool {
        self.all(|s| matches!(s, DeviceStatus::Verified | DeviceStatus::Error))
    }

    fn set_phase(&mut self, to: CeremonyPhase, at: DateTime<Utc>, out: &mut Vec<Transition>) {
        if self.phase == to {
            return;
        }
        out.push(Transition::PhaseChanged {
            key_ref: self.key_ref.clone(),
            ceremony_id: self.ceremony_id.clone(),
            from: self.phase,
            to,
        });
        self.phase = to;
        self.phase_since = at;
    }

    fn set_status(&mut self, device: &str, status: DeviceStatus, out: &mut Vec<Transition>) {
        if let Some(d) = self.devices.get_mut(device) {
            d.status = status;
            out.push(Transition::DeviceChanged {
                key_ref: self.key_ref.clone(),
                device: device.to_string(),
                status,
            });
        }
    }

    fn advance(&mut self, at: DateTime<Utc>, out: &mut Vec<Transition>) {
        if self.phase == CeremonyPhase::CollectingJoins && self.all(|s| s == DeviceStatus::Joined) {
            self.set_phase(CeremonyPhase::DistributingShares, at, out);
        }
        if self.phase == CeremonyPhase::DistributingShares
            && self.all(|s| {
                matches!(
                    s,
                    DeviceStatus::ShareReceived | DeviceStatus::Verified | DeviceStatus::Error
                )
            })
        {
            self.set_phase(CeremonyPhase::VerifyingShares, at, out);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub keys: DevicePublicKeys,
    pub share_index: u8,
    pub share_commitment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Unlock { ttl_secs: u64 },
    Recovery { lost_devices: BTreeSet<DeviceId> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestState {
    pub request_id: String,
    pub epoch: u64,
    pub requester: DeviceId,
    pub kind: RequestKind,
    pub approvals: BTreeSet<DeviceId>,
    pub opened_at: DateTime<Utc>,
}

/// Everything agreed about one threshold key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyState {
    pub key_ref: String,
    /// Latest finalized epoch; 0 until the first enrollment completes.
    pub epoch: u64,
    pub policy: Option<ThresholdPolicy>,
    pub members: BTreeMap<DeviceId, Member>,
    pub secret_commitment: Option<String>,
    pub revoked_epochs: BTreeSet<u64>,
    pub revoked_devices: BTreeSet<DeviceId>,
    pub ceremony: Option<CeremonyState>,
    pub requests: BTreeMap<String, RequestState>,
}

impl KeyState {
    fn new(key_ref: &str) -> Self {
        Self {
            key_ref: key_ref.to_string(),
            epoch: 0,
            policy: None,
            members: BTreeMap::new(),
            secret_commitment: None,
            revoked_epochs: BTreeSet::new(),
            revoked_devices: BTreeSet::new(),
            ceremony: None,
            requests: BTreeMap::new(),
        }
    }

    /// Epochs below the current one are revoked as soon as a newer epoch is finalized.
    pub fn is_revoked(&self, epoch: u64) -> bool {
        epoch < self.epoch || self.revoked_epochs.contains(&epoch)
    }

    pub fn active_ceremony(&self) -> Option<&CeremonyState> {
        self.ceremony.as_ref().filter(|c| c.is_active())
    }

    /// Resolve an epoch for a new request, failing closed on revoked or unknown epochs.
    pub fn check_epoch(&self, epoch: u64) -> Result<(), ThresholdError> {
        if self.is_revoked(epoch) {
            return Err(ThresholdError::EpochRevoked {
                key_ref: self.key_ref.clone(),
                epoch,
                current: self.epoch,
            });
        }
        if self.epoch == 0 || epoch != self.epoch {
            return Err(ThresholdError::UnknownEpoch {
                key_ref: self.key_ref.clone(),
                epoch,
            });
        }
        Ok(())
    }

    fn member(&self, device: &str) -> Result<&Member, ThresholdError> {
        if self.revoked_devices.contains(device) {
            return Err(self.not_member(device));
        }
        self.members.get(device).ok_or_else(|| self.not_member(device))
    }

    fn not_member(&self, device: &str) -> ThresholdError {
        ThresholdError::NotMember {
            device: device.to_string(),
            key_ref: self.key_ref.clone(),
        }
    }

    fn ceremony_for(&mut self, ceremony_id: &str, epoch: u64, event: &'static str) -> Result<&mut CeremonyState, ThresholdError> {
        match self.ceremony.as_mut() {
            Some(c) if c.ceremony_id == ceremony_id && c.epoch == epoch => Ok(c),
            _ => Err(ThresholdError::invalid(event, format!("unknown ceremony {ceremony_id}"))),
        }
    }
}

/// Observable effect of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    CeremonyStarted {
        key_ref: String,
        ceremony_id: String,
    },
    PhaseChanged {
        key_ref: String,
        ceremony_id: String,
        from: CeremonyPhase,
        to: CeremonyPhase,
    },
    DeviceChanged {
        key_ref: String,
        device: DeviceId,
        status: DeviceStatus,
    },
    Finalized {
        key_ref: String,
        ceremony_id: String,
        epoch: u64,
    },
    Aborted {
        key_ref: String,
        ceremony_id: String,
        phase: CeremonyPhase,
        reason: AbortReason,
    },
    RequestOpened {
        key_ref: String,
        request_id: String,
    },
    ApprovalRecorded {
        key_ref: String,
        request_id: String,
        approver: DeviceId,
    },
    RotationCommitted {
        key_ref: String,
        old_epoch: u64,
        new_epoch: u64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    keys: BTreeMap<String, KeyState>,
    directory: HashMap<DeviceId, DevicePublicKeys>,
    counters: HashMap<DeviceId, u64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self, key_ref: &str) -> Option<&KeyState> {
        self.keys.get(key_ref)
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyState> {
        self.keys.values()
    }

    /// Pinned public keys of a device, if it has introduced itself.
    pub fn device(&self, device: &str) -> Option<&DevicePublicKeys> {
        self.directory.get(device)
    }

    /// Last accepted counter from `device` (0 if none).
    pub fn last_counter(&self, device: &str) -> u64 {
        self.counters.get(device).copied().unwrap_or(0)
    }

    pub fn apply(&mut self, signed: &SignedEvent) -> Result<Vec<Transition>, ThresholdError> {
        let keys = self.authenticate(signed)?;
        let at = signed.sent_at;
        let sender = signed.sender.as_str();
        let key_ref = signed.event.key_ref();
        let fresh_key = !self.keys.contains_key(key_ref);
        let applied = match &signed.event {
            CeremonyEvent::Init(e) => self.on_init(sender, at, e),
            CeremonyEvent::Join(e) => self.on_join(sender, at, e),
            CeremonyEvent::ShareEnvelope(e) => self.on_envelope(sender, at, e),
            CeremonyEvent::ShareAck(e) => self.on_ack(sender, at, e),
            CeremonyEvent::ShareReject(e) => self.on_reject(sender, at, e),
            CeremonyEvent::Finalize(e) => self.on_finalize(sender, at, e),
            CeremonyEvent::Abort(e) => self.on_abort(sender, at, e),
            CeremonyEvent::UnlockRequest(e) => self.on_unlock_request(sender, at, e),
            CeremonyEvent::RecoveryRequest(e) => self.on_recovery_request(sender, at, e),
            CeremonyEvent::UnlockApproval(e) => self.on_approval(sender, e),
            CeremonyEvent::RotateCommit(e) => self.on_rotate_commit(sender, e),
        };
        match applied {
            Ok(out) => {
                self.counters.insert(signed.sender.clone(), signed.counter);
                self.directory.entry(signed.sender.clone()).or_insert(keys);
                Ok(out)
            }
            Err(e) => {
                if fresh_key {
                    self.keys.remove(key_ref);
                }
                Err(e)
            }
        }
    }

    /// Signature and counter checks. Returns the keys to pin if the event is accepted.
    fn authenticate(&self, signed: &SignedEvent) -> Result<DevicePublicKeys, ThresholdError> {
        let introduced = match &signed.event {
            CeremonyEvent::Init(e) => Some(&e.initiator),
            CeremonyEvent::Join(e) => Some(&e.device),
            _ => None,
        };
        let keys = match (self.directory.get(&signed.sender), introduced) {
            (Some(pinned), Some(presented)) if pinned != presented => {
                return Err(ThresholdError::KeyConflict {
                    device: signed.sender.clone(),
                })
            }
            (Some(pinned), _) => pinned.clone(),
            (None, Some(presented)) => presented.clone(),
            (None, None) => return Err(ThresholdError::UnknownSender(signed.sender.clone())),
        };
        signed
            .verify(&keys)
            .map_err(|e| ThresholdError::BadSignature(e.to_string()))?;

        let last = self.last_counter(&signed.sender);
        if signed.counter <= last {
            return Err(ThresholdError::Replay {
                sender: signed.sender.clone(),
                counter: signed.counter,
                last,
            });
        }
        Ok(keys)
    }

    fn on_init(&mut self, sender: &str, at: DateTime<Utc>, e: &CeremonyInit) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.ceremony.init";
        e.policy.validate()?;
        if e.devices.len() != usize::from(e.policy.n) {
            return Err(ThresholdError::invalid(EV, format!("{} devices for policy {}", e.devices.len(), e.policy)));
        }
        let distinct: BTreeSet<&DeviceId> = e.devices.iter().collect();
        if distinct.len() != e.devices.len() {
            return Err(ThresholdError::invalid(EV, "duplicate device"));
        }
        if e.initiator.device_id != sender || !e.devices.iter().any(|d| d == sender) {
            return Err(ThresholdError::invalid(EV, "initiator must be a participant"));
        }

        let key = self
            .keys
            .entry(e.key_ref.clone())
            .or_insert_with(|| KeyState::new(&e.key_ref));
        if key.active_ceremony().is_some() {
            return Err(ThresholdError::CeremonyBusy {
                key_ref: e.key_ref.clone(),
            });
        }
        if e.epoch <= key.epoch {
            return Err(ThresholdError::EpochRevoked {
                key_ref: e.key_ref.clone(),
                epoch: e.epoch,
                current: key.epoch,
            });
        }
        if e.epoch != key.epoch + 1 {
            return Err(ThresholdError::invalid(EV, format!("epoch {} skips {}", e.epoch, key.epoch + 1)));
        }
        match &e.kind {
            CeremonyKind::Enrollment => {
                if key.epoch != 0 {
                    return Err(ThresholdError::invalid(EV, "already enrolled; rotate instead"));
                }
            }
            CeremonyKind::Rotation {
                previous_epoch,
                revoked_devices,
            } => {
                if *previous_epoch != key.epoch {
                    return Err(ThresholdError::invalid(EV, format!("rotation from stale epoch {previous_epoch}")));
                }
                key.member(sender)?;
                for d in &e.devices {
                    if revoked_devices.contains(d) {
                        return Err(ThresholdError::invalid(EV, format!("{d} is being revoked")));
                    }
                    key.member(d)?;
                }
            }
        }

        let devices = e
            .devices
            .iter()
            .map(|d| {
                let state = if d == sender {
                    DeviceState {
                        status: DeviceStatus::Joined,
                        keys: Some(e.initiator.clone()),
                        share_commitment: None,
                    }
                } else {
                    DeviceState {
                        status: DeviceStatus::Discovered,
                        keys: None,
                        share_commitment: None,
                    }
                };
                (d.clone(), state)
            })
            .collect();
        let mut ceremony = CeremonyState {
            ceremony_id: e.ceremony_id.clone(),
            key_ref: e.key_ref.clone(),
            epoch: e.epoch,
            policy: e.policy,
            phase: CeremonyPhase::Init,
            kind: e.kind.clone(),
            initiator: sender.to_string(),
            order: e.devices.clone(),
            devices,
            phase_since: at,
            abort_reason: None,
            failed_in: None,
        };
        let mut out = vec![Transition::CeremonyStarted {
            key_ref: e.key_ref.clone(),
            ceremony_id: e.ceremony_id.clone(),
        }];
        ceremony.set_phase(CeremonyPhase::CollectingJoins, at, &mut out);
        ceremony.advance(at, &mut out);
        key.ceremony = Some(ceremony);
        Ok(out)
    }

    fn on_join(&mut self, sender: &str, at: DateTime<Utc>, e: &CeremonyJoin) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.ceremony.join";
        let ceremony = self.key_mut(&e.key_ref)?.ceremony_for(&e.ceremony_id, e.epoch, EV)?;
        if ceremony.phase != CeremonyPhase::CollectingJoins {
            return Err(ThresholdError::invalid(EV, format!("ceremony is {}", ceremony.phase)));
        }
        if e.device.device_id != sender || ceremony.status(sender) != Some(DeviceStatus::Discovered) {
            return Err(ThresholdError::invalid(EV, format!("{sender} cannot join")));
        }
        let mut out = Vec::new();
        if let Some(d) = ceremony.devices.get_mut(sender) {
            d.keys = Some(e.device.clone());
        }
        ceremony.set_status(sender, DeviceStatus::Joined, &mut out);
        ceremony.advance(at, &mut out);
        Ok(out)
    }

    fn on_envelope(&mut self, sender: &str, at: DateTime<Utc>, e: &ShareEnvelope) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.share.envelope";
        let ceremony = self.key_mut(&e.key_ref)?.ceremony_for(&e.ceremony_id, e.epoch, EV)?;
        if ceremony.phase != CeremonyPhase::DistributingShares {
            return Err(ThresholdError::invalid(EV, format!("ceremony is {}", ceremony.phase)));
        }
        if sender != ceremony.initiator || e.from != sender {
            return Err(ThresholdError::invalid(EV, "only the initiator deals shares"));
        }
        if ceremony.status(&e.to) != Some(DeviceStatus::Joined) {
            return Err(ThresholdError::invalid(EV, format!("no pending share for {}", e.to)));
        }
        let mut out = Vec::new();
        if let Some(d) = ceremony.devices.get_mut(&e.to) {
            d.share_commitment = Some(e.share_commitment.clone());
        }
        ceremony.set_status(&e.to, DeviceStatus::ShareReceived, &mut out);
        ceremony.advance(at, &mut out);
        Ok(out)
    }

    fn on_ack(&mut self, sender: &str, at: DateTime<Utc>, e: &ShareAck) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.share.ack";
        let ceremony = self.key_mut(&e.key_ref)?.ceremony_for(&e.ceremony_id, e.epoch, EV)?;
        if !ceremony.is_active() || e.device_id != sender {
            return Err(ThresholdError::invalid(EV, format!("unexpected ack from {sender}")));
        }
        if ceremony.status(sender) != Some(DeviceStatus::ShareReceived) {
            return Err(ThresholdError::invalid(EV, format!("{sender} has no share to acknowledge")));
        }
        let recorded = ceremony
            .devices
            .get(sender)
            .and_then(|d| d.share_commitment.as_deref());
        let status = if recorded == Some(e.share_commitment.as_str()) {
            DeviceStatus::Verified
        } else {
            DeviceStatus::Error
        };
        let mut out = Vec::new();
        ceremony.set_status(sender, status, &mut out);
        ceremony.advance(at, &mut out);
        Ok(out)
    }

    fn on_reject(&mut self, sender: &str, at: DateTime<Utc>, e: &ShareReject) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.share.reject";
        let ceremony = self.key_mut(&e.key_ref)?.ceremony_for(&e.ceremony_id, e.epoch, EV)?;
        if !ceremony.is_active() || e.device_id != sender {
            return Err(ThresholdError::invalid(EV, format!("unexpected reject from {sender}")));
        }
        if !matches!(
            ceremony.status(sender),
            Some(DeviceStatus::Joined | DeviceStatus::ShareReceived)
        ) {
            return Err(ThresholdError::invalid(EV, format!("{sender} cannot reject now")));
        }
        let mut out = Vec::new();
        ceremony.set_status(sender, DeviceStatus::Error, &mut out);
        ceremony.advance(at, &mut out);
        Ok(out)
    }

    fn on_finalize(&mut self, sender: &str, at: DateTime<Utc>, e: &CeremonyFinalize) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.ceremony.finalize";
        let key = self.key_mut(&e.key_ref)?;
        let ceremony = key.ceremony_for(&e.ceremony_id, e.epoch, EV)?;
        if sender != ceremony.initiator {
            return Err(ThresholdError::invalid(EV, "only the initiator finalizes"));
        }
        if ceremony.phase != CeremonyPhase::VerifyingShares || !ceremony.all_settled() {
            return Err(ThresholdError::invalid(EV, format!("ceremony is {} with unsettled shares", ceremony.phase)));
        }
        let verified: Vec<DevicePublicKeys> = ceremony.verified().into_iter().cloned().collect();
        if verified.len() < usize::from(ceremony.policy.t) {
            return Err(ThresholdError::invalid(
                EV,
                format!("{} verified shares, {} required", verified.len(), ceremony.policy.t),
            ));
        }
        let expected_n = u8::try_from(verified.len()).map_err(|_| ThresholdError::invalid(EV, "too many devices"))?;
        if e.policy.t != ceremony.policy.t || e.policy.n != expected_n || e.devices != verified {
            return Err(ThresholdError::invalid(EV, "device set does not match verified shares"));
        }

        let mut out = Vec::new();
        for keys in &verified {
            ceremony.set_status(&keys.device_id, DeviceStatus::Ready, &mut out);
        }
        ceremony.set_phase(CeremonyPhase::Ready, at, &mut out);
        let members = ceremony
            .order
            .iter()
            .filter_map(|id| {
                let state = ceremony.devices.get(id)?;
                if state.status != DeviceStatus::Ready {
                    return None;
                }
                Some((
                    id.clone(),
                    Member {
                        keys: state.keys.clone()?,
                        share_index: ceremony.share_index(id)?,
                        share_commitment: state.share_commitment.clone()?,
                    },
                ))
            })
            .collect();

        key.members = members;
        key.epoch = e.epoch;
        key.policy = Some(e.policy);
        key.secret_commitment = Some(e.secret_commitment.clone());
        // Requests against the previous epoch can no longer be answered.
        key.requests.clear();
        out.push(Transition::Finalized {
            key_ref: e.key_ref.clone(),
            ceremony_id: e.ceremony_id.clone(),
            epoch: e.epoch,
        });
        Ok(out)
    }

    fn on_abort(&mut self, sender: &str, at: DateTime<Utc>, e: &CeremonyAbort) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.ceremony.abort";
        let ceremony = self.key_mut(&e.key_ref)?.ceremony_for(&e.ceremony_id, e.epoch, EV)?;
        if !ceremony.devices.contains_key(sender) {
            return Err(ThresholdError::invalid(EV, format!("{sender} is not a participant")));
        }
        // An abort observed in an earlier phase is stale once the ceremony moved on.
        if !ceremony.is_active() || ceremony.phase != e.phase {
            return Err(ThresholdError::invalid(EV, format!("stale abort for phase {}", e.phase)));
        }
        let mut out = Vec::new();
        let from = ceremony.phase;
        ceremony.set_phase(CeremonyPhase::Error, at, &mut out);
        ceremony.abort_reason = Some(e.reason.clone());
        ceremony.failed_in = Some(from);
        out.push(Transition::Aborted {
            key_ref: e.key_ref.clone(),
            ceremony_id: e.ceremony_id.clone(),
            phase: from,
            reason: e.reason.clone(),
        });
        Ok(out)
    }

    fn on_unlock_request(
        &mut self,
        sender: &str,
        at: DateTime<Utc>,
        e: &UnlockRequest,
    ) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.unlock.request";
        if e.requester != sender {
            return Err(ThresholdError::invalid(EV, "requester must sign its own request"));
        }
        let key = self.key_mut(&e.key_ref)?;
        key.check_epoch(e.epoch)?;
        key.member(sender)?;
        open_request(
            key,
            RequestState {
                request_id: e.request_id.clone(),
                epoch: e.epoch,
                requester: sender.to_string(),
                kind: RequestKind::Unlock { ttl_secs: e.ttl_secs },
                approvals: BTreeSet::new(),
                opened_at: at,
            },
            at,
            EV,
        )
    }

    fn on_recovery_request(
        &mut self,
        sender: &str,
        at: DateTime<Utc>,
        e: &RecoveryRequest,
    ) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.recovery.request";
        if e.requester != sender {
            return Err(ThresholdError::invalid(EV, "requester must sign its own request"));
        }
        let key = self.key_mut(&e.key_ref)?;
        key.check_epoch(e.epoch)?;
        key.member(sender)?;
        let lost: BTreeSet<DeviceId> = e.lost_devices.iter().cloned().collect();
        if lost.contains(sender) {
            return Err(ThresholdError::invalid(EV, "requester cannot be lost"));
        }
        for d in &lost {
            key.member(d)?;
        }
        let survivors = key.members.len() - lost.len();
        let need = key.policy.map(|p| usize::from(p.t)).unwrap_or(usize::MAX);
        if survivors < need {
            return Err(ThresholdError::NotEnoughSurvivors { have: survivors, need });
        }
        open_request(
            key,
            RequestState {
                request_id: e.request_id.clone(),
                epoch: e.epoch,
                requester: sender.to_string(),
                kind: RequestKind::Recovery { lost_devices: lost },
                approvals: BTreeSet::new(),
                opened_at: at,
            },
            at,
            EV,
        )
    }

    fn on_approval(&mut self, sender: &str, e: &UnlockApproval) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.unlock.approval";
        if e.approver != sender {
            return Err(ThresholdError::invalid(EV, "approver must sign its own approval"));
        }
        let key = self.key_mut(&e.key_ref)?;
        if key.is_revoked(e.epoch) {
            return Err(ThresholdError::EpochRevoked {
                key_ref: e.key_ref.clone(),
                epoch: e.epoch,
                current: key.epoch,
            });
        }
        let member = key.member(sender)?;
        member
            .keys
            .verify(&e.signing_bytes()?, &e.signature)
            .map_err(|err| ThresholdError::BadSignature(err.to_string()))?;
        let request = key
            .requests
            .get_mut(&e.request_id)
            .ok_or_else(|| ThresholdError::invalid(EV, format!("unknown request {}", e.request_id)))?;
        if request.epoch != e.epoch || request.requester == sender {
            return Err(ThresholdError::invalid(EV, "approval does not match request"));
        }
        if let RequestKind::Recovery { lost_devices } = &request.kind {
            if lost_devices.contains(sender) {
                return Err(ThresholdError::invalid(EV, format!("{sender} is reported lost")));
            }
        }
        if !request.approvals.insert(sender.to_string()) {
            return Err(ThresholdError::invalid(EV, format!("duplicate approval from {sender}")));
        }
        let lost = match &request.kind {
            RequestKind::Recovery { lost_devices } => Some(lost_devices),
            RequestKind::Unlock { .. } => None,
        };
        let outstanding = key.members.keys().any(|d| {
            d != &request.requester
                && !key.revoked_devices.contains(d)
                && !lost.is_some_and(|l| l.contains(d))
                && !request.approvals.contains(d)
        });
        // Nobody is left to answer.
        if !outstanding {
            key.requests.remove(&e.request_id);
        }
        Ok(vec![Transition::ApprovalRecorded {
            key_ref: e.key_ref.clone(),
            request_id: e.request_id.clone(),
            approver: sender.to_string(),
        }])
    }

    fn on_rotate_commit(&mut self, sender: &str, e: &RotateCommit) -> Result<Vec<Transition>, ThresholdError> {
        const EV: &str = "threshold.rotate.commit";
        let key = self.key_mut(&e.key_ref)?;
        let ceremony = key
            .ceremony
            .as_ref()
            .filter(|c| c.ceremony_id == e.ceremony_id && c.epoch == e.new_epoch)
            .ok_or_else(|| ThresholdError::invalid(EV, format!("unknown ceremony {}", e.ceremony_id)))?;
        if sender != ceremony.initiator || ceremony.phase != CeremonyPhase::Ready {
            return Err(ThresholdError::invalid(EV, "rotation is not finalized"));
        }
        match &ceremony.kind {
            CeremonyKind::Rotation {
                previous_epoch,
                revoked_devices,
            } if *previous_epoch == e.old_epoch && *revoked_devices == e.revoked_devices => {}
            _ => return Err(ThresholdError::invalid(EV, "commit does not match the rotation")),
        }
        key.revoked_epochs.insert(e.old_epoch);
        key.revoked_devices.extend(e.revoked_devices.iter().cloned());
        Ok(vec![Transition::RotationCommitted {
            key_ref: e.key_ref.clone(),
            old_epoch: e.old_epoch,
            new_epoch: e.new_epoch,
        }])
    }

    fn key_mut(&mut self, key_ref: &str) -> Result<&mut KeyState, ThresholdError> {
        self.keys
            .get_mut(key_ref)
            .ok_or_else(|| ThresholdError::UnknownKey(key_ref.to_string()))
    }
}

fn open_request(
    key: &mut KeyState,
    request: RequestState,
    at: DateTime<Utc>,
    event: &'static str,
) -> Result<Vec<Transition>, ThresholdError> {
    let retention = Duration::seconds(REQUEST_RETENTION_SECS);
    key.requests.retain(|_, r| at.signed_duration_since(r.opened_at) <= retention);
    if key.requests.contains_key(&request.request_id) {
        return Err(ThresholdError::invalid(event, format!("duplicate request {}", request.request_id)));
    }
    let out = vec![Transition::RequestOpened {
        key_ref: key.key_ref.clone(),
        request_id: request.request_id.clone(),
    }];
    key.requests.insert(request.request_id.clone(), request);
    Ok(out)
}
