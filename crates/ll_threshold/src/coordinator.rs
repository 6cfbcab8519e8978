//! Per-device ceremony driver.
//!
//! The `Coordinator` folds durable events into its `Ledger` and then reacts according to
//! this device's role: join ceremonies it is named in, deal and finalize the ones it
//! initiated, check and acknowledge shares addressed to it, answer unlock and recovery
//! requests, and reconstruct session keys for its own requests.
//!
//! Nothing here blocks or sleeps. Every call returns a list of `Effect`s for the caller
//! (the runner, or a test harness) to carry out: events to publish, liveness messages to
//! broadcast, and key material to hand to the store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ll_crypto::shamir::{self, RawShare};
use ll_crypto::wrap::{open_with, seal_to};
use ll_crypto::{CryptoError, DeviceIdentity, DevicePublicKeys, SecretKey};
use ll_proto::ceremony::{approval_signing_bytes, contribution_aad, share_aad};
use ll_proto::{
    AbortReason, CeremonyAbort, CeremonyEvent, CeremonyFinalize, CeremonyInit, CeremonyJoin, CeremonyKind,
    CeremonyPhase, DeviceId, DeviceStatus, LivenessMessage, RecoveryRequest, RotateCommit, ShareAck, ShareEnvelope,
    ShareEnvelopeHeader, ShareReject, SignedEvent, ThresholdPolicy, UnlockApproval, UnlockRequest,
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::CeremonyConfig;
use crate::error::ThresholdError;
use crate::liveness::LivenessTracker;
use crate::session::{derive_session_key, secret_commitment, share_context};
use crate::state::{CeremonyState, KeyState, Ledger, RequestKind, Transition};

/// Work for the caller to carry out, in order.
#[derive(Debug, Clone)]
pub enum Effect {
    Publish(SignedEvent),
    Broadcast(LivenessMessage),
    /// An envelope addressed to this device passed verification; keep it for restarts.
    PersistEnvelope(ShareEnvelope),
    /// This device initiated a ceremony that finalized; `key` is the new epoch's session key.
    KeyEstablished {
        key_ref: String,
        epoch: u64,
        key: SecretKey,
        policy: ThresholdPolicy,
        previous_epoch: Option<u64>,
    },
    /// An unlock or recovery request of this device collected enough shares.
    SessionReady {
        key_ref: String,
        epoch: u64,
        key: SecretKey,
        ttl: Duration,
    },
    SessionExpired {
        key_ref: String,
    },
    /// Another device asked for this device's share; the user has to approve.
    ApprovalRequired {
        key_ref: String,
        request_id: String,
        requester: DeviceId,
        epoch: u64,
        recovery: bool,
    },
    CeremonyFailed {
        key_ref: String,
        phase: CeremonyPhase,
        reason: AbortReason,
    },
    RequestExpired {
        key_ref: String,
        request_id: String,
    },
}

struct Dealing {
    key_ref: String,
    secret: Zeroizing<Vec<u8>>,
    dealt: bool,
    concluded: bool,
}

struct HeldShare {
    epoch: u64,
    share: RawShare,
}

struct OwnRequest {
    key_ref: String,
    epoch: u64,
    lost_devices: Option<Vec<DeviceId>>,
    contributions: BTreeMap<u8, RawShare>,
    opened_at: DateTime<Utc>,
}

struct SessionInfo {
    epoch: u64,
    expires_at: DateTime<Utc>,
}

pub struct Coordinator {
    identity: DeviceIdentity,
    config: CeremonyConfig,
    ledger: Ledger,
    liveness: LivenessTracker,
    counter: u64,
    replaying: bool,
    dealings: HashMap<String, Dealing>,
    pending_shares: HashMap<String, RawShare>,
    shares: HashMap<String, HeldShare>,
    requests: HashMap<String, OwnRequest>,
    sessions: HashMap<String, SessionInfo>,
    aborts_sent: HashSet<String>,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl Coordinator {
    pub fn new(identity: DeviceIdentity, config: CeremonyConfig) -> Self {
        let liveness = LivenessTracker::new(identity.device_id(), config.offline_after());
        Self {
            identity,
            config,
            ledger: Ledger::new(),
            liveness,
            counter: 0,
            replaying: false,
            dealings: HashMap::new(),
            pending_shares: HashMap::new(),
            shares: HashMap::new(),
            requests: HashMap::new(),
            sessions: HashMap::new(),
            aborts_sent: HashSet::new(),
            last_heartbeat: None,
        }
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn public_keys(&self) -> DevicePublicKeys {
        self.identity.public_keys()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &CeremonyConfig {
        &self.config
    }

    /// Epoch of the share this device holds for `key_ref`, if any.
    pub fn share_epoch(&self, key_ref: &str) -> Option<u64> {
        self.shares.get(key_ref).map(|h| h.epoch)
    }

    pub fn session_epoch(&self, key_ref: &str) -> Option<u64> {
        self.sessions.get(key_ref).map(|s| s.epoch)
    }

    /// Durable status with liveness layered on, for display.
    pub fn device_statuses(&self, key_ref: &str, now: DateTime<Utc>) -> Option<BTreeMap<DeviceId, DeviceStatus>> {
        let ceremony = self.ledger.key(key_ref)?.ceremony.as_ref()?;
        Some(self.liveness.overlay(ceremony, now))
    }

    /// Outcome of the latest ceremony for `key_ref`: the epoch it established, `None` while it
    /// is still running, or why it failed (`CeremonyTimeout` names the phase that ran out).
    pub fn ceremony_result(&self, key_ref: &str) -> Result<Option<u64>, ThresholdError> {
        match self.key(key_ref)?.ceremony.as_ref() {
            Some(ceremony) => ceremony.outcome(),
            None => Ok(None),
        }
    }

    // ── Local operations ─────────────────────────────────────────────────────

    /// Start the first ceremony for `key_ref`, dealing `policy` across `devices`.
    pub fn start_enrollment(
        &mut self,
        key_ref: &str,
        policy: ThresholdPolicy,
        devices: Vec<DeviceId>,
    ) -> Result<Vec<Effect>, ThresholdError> {
        policy.validate()?;
        if !devices.iter().any(|d| d == self.device_id()) {
            return Err(ThresholdError::invalid("threshold.ceremony.init", "initiator must be a participant"));
        }
        if devices.len() != usize::from(policy.n) {
            return Err(ThresholdError::invalid(
                "threshold.ceremony.init",
                format!("{} devices for policy {policy}", devices.len()),
            ));
        }
        let epoch = match self.ledger.key(key_ref) {
            Some(key) if key.epoch != 0 => {
                return Err(ThresholdError::invalid("threshold.ceremony.init", "already enrolled; rotate instead"))
            }
            Some(key) => key.epoch + 1,
            None => 1,
        };
        self.begin_ceremony(key_ref, epoch, policy, devices, CeremonyKind::Enrollment)
    }

    /// Re-key `key_ref` to a new epoch without the `revoke`d devices.
    ///
    /// The store migration that follows needs the current epoch's session to be open.
    pub fn start_rotation(&mut self, key_ref: &str, revoke: Vec<DeviceId>) -> Result<Vec<Effect>, ThresholdError> {
        let key = self.key(key_ref)?;
        let policy = key.policy.ok_or_else(|| ThresholdError::UnknownEpoch {
            key_ref: key_ref.to_string(),
            epoch: key.epoch,
        })?;
        self.ensure_member(key)?;
        let survivors: Vec<DeviceId> = members_in_order(key)
            .into_iter()
            .filter(|d| !revoke.contains(d))
            .collect();
        if !survivors.iter().any(|d| d == self.device_id()) {
            return Err(ThresholdError::invalid("threshold.ceremony.init", "cannot revoke the initiator"));
        }
        let rotated = survivor_policy(policy, survivors.len())?;
        let kind = CeremonyKind::Rotation {
            previous_epoch: key.epoch,
            revoked_devices: revoke,
        };
        let epoch = key.epoch + 1;
        self.begin_ceremony(key_ref, epoch, rotated, survivors, kind)
    }

    /// Ask the other members for their shares of the current (or given) epoch.
    pub fn request_unlock(
        &mut self,
        key_ref: &str,
        epoch: Option<u64>,
    ) -> Result<(String, Vec<Effect>), ThresholdError> {
        let key = self.key(key_ref)?;
        let epoch = epoch.unwrap_or(key.epoch);
        key.check_epoch(epoch)?;
        self.ensure_member(key)?;
        let request_id = Uuid::new_v4().to_string();
        self.open_own_request(key_ref, epoch, &request_id, None)?;

        let mut effects = Vec::new();
        self.emit(
            &mut effects,
            CeremonyEvent::UnlockRequest(UnlockRequest {
                request_id: request_id.clone(),
                key_ref: key_ref.to_string(),
                epoch,
                requester: self.device_id().to_string(),
                ttl_secs: self.config.session_ttl_secs,
            }),
        )?;
        self.try_complete(&request_id, &mut effects)?;
        info!(key_ref, epoch, request = %request_id, "unlock requested");
        Ok((request_id, effects))
    }

    /// Reconstruct the key with the surviving members, then rotate the lost devices out.
    pub fn request_recovery(
        &mut self,
        key_ref: &str,
        lost_devices: Vec<DeviceId>,
    ) -> Result<(String, Vec<Effect>), ThresholdError> {
        let key = self.key(key_ref)?;
        let epoch = key.epoch;
        key.check_epoch(epoch)?;
        self.ensure_member(key)?;
        if lost_devices.iter().any(|d| d == self.device_id()) {
            return Err(ThresholdError::invalid("threshold.recovery.request", "requester cannot be lost"));
        }
        for d in &lost_devices {
            if !key.members.contains_key(d) {
                return Err(ThresholdError::NotMember {
                    device: d.clone(),
                    key_ref: key_ref.to_string(),
                });
            }
        }
        let survivors = key.members.len() - lost_devices.len();
        let need = key.policy.map(|p| usize::from(p.t)).unwrap_or(usize::MAX);
        if survivors < need {
            return Err(ThresholdError::NotEnoughSurvivors { have: survivors, need });
        }

        let request_id = Uuid::new_v4().to_string();
        self.open_own_request(key_ref, epoch, &request_id, Some(lost_devices.clone()))?;
        let mut effects = Vec::new();
        self.emit(
            &mut effects,
            CeremonyEvent::RecoveryRequest(RecoveryRequest {
                request_id: request_id.clone(),
                key_ref: key_ref.to_string(),
                epoch,
                requester: self.device_id().to_string(),
                lost_devices,
            }),
        )?;
        self.try_complete(&request_id, &mut effects)?;
        info!(key_ref, epoch, request = %request_id, "recovery requested");
        Ok((request_id, effects))
    }

    /// Answer another device's open request with this device's share, sealed to the requester.
    pub fn approve(&mut self, key_ref: &str, request_id: &str) -> Result<Vec<Effect>, ThresholdError> {
        const EV: &str = "threshold.unlock.approval";
        let me = self.device_id().to_string();
        let key = self.key(key_ref)?;
        let request = key
            .requests
            .get(request_id)
            .ok_or_else(|| ThresholdError::invalid(EV, format!("unknown request {request_id}")))?;
        key.check_epoch(request.epoch)?;
        self.ensure_member(key)?;
        if request.requester == me {
            return Err(ThresholdError::invalid(EV, "cannot approve own request"));
        }
        if let RequestKind::Recovery { lost_devices } = &request.kind {
            if lost_devices.contains(&me) {
                return Err(ThresholdError::invalid(EV, "this device is reported lost"));
            }
        }
        let requester = key
            .members
            .get(&request.requester)
            .map(|m| m.keys.clone())
            .ok_or_else(|| ThresholdError::UnknownSender(request.requester.clone()))?;
        let epoch = request.epoch;
        let held = self
            .shares
            .get(key_ref)
            .filter(|h| h.epoch == epoch)
            .ok_or_else(|| ThresholdError::NoShare {
                key_ref: key_ref.to_string(),
                epoch,
            })?;

        let aad = contribution_aad(key_ref, epoch, request_id, &requester.device_id);
        let contribution = seal_to(&requester.enc_pub, &held.share.to_bytes(), &aad)?;
        let signature = self
            .identity
            .sign(&approval_signing_bytes(request_id, key_ref, epoch, &me, &contribution)?);
        let mut effects = Vec::new();
        self.emit(
            &mut effects,
            CeremonyEvent::UnlockApproval(UnlockApproval {
                request_id: request_id.to_string(),
                key_ref: key_ref.to_string(),
                epoch,
                approver: me,
                contribution,
                signature,
            }),
        )?;
        info!(key_ref, epoch, request = request_id, requester = %requester.device_id, "request approved");
        Ok(effects)
    }

    /// Forget the session for `key_ref`.
    pub fn lock(&mut self, key_ref: &str) -> Vec<Effect> {
        self.sessions.remove(key_ref);
        vec![Effect::SessionExpired {
            key_ref: key_ref.to_string(),
        }]
    }

    /// Load a share envelope kept from an earlier run.
    pub fn restore_envelope(&mut self, envelope: &ShareEnvelope) -> Result<bool, ThresholdError> {
        let me = self.device_id().to_string();
        let Some(member) = self
            .ledger
            .key(&envelope.key_ref)
            .filter(|k| k.epoch == envelope.epoch && !k.is_revoked(envelope.epoch))
            .and_then(|k| k.members.get(&me))
            .cloned()
        else {
            return Ok(false);
        };
        let share = open_share(&self.identity, envelope, member.share_index)?;
        if share.commitment(&share_context(&envelope.key_ref, envelope.epoch, &me)) != member.share_commitment {
            return Err(ThresholdError::ShareVerificationFailed { device: me });
        }
        self.shares.insert(
            envelope.key_ref.clone(),
            HeldShare {
                epoch: envelope.epoch,
                share,
            },
        );
        Ok(true)
    }

    // ── Inputs ───────────────────────────────────────────────────────────────

    /// Rebuild state from an earlier stream without publishing anything.
    pub fn replay<'a>(&mut self, events: impl IntoIterator<Item = &'a SignedEvent>) -> usize {
        self.replaying = true;
        let mut applied = 0;
        for event in events {
            // Rejected events still used up their counter.
            if event.sender == self.identity.device_id() {
                self.counter = self.counter.max(event.counter);
            }
            match self.handle_durable(event) {
                Ok(_) => applied += 1,
                Err(e) => debug!(sender = %event.sender, counter = event.counter, error = %e, "replay skipped event"),
            }
        }
        self.replaying = false;
        self.counter = self.counter.max(self.ledger.last_counter(self.identity.device_id()));
        applied
    }

    /// Joins this device still owes after a replay: ceremonies it is named in that are
    /// collecting joins and have not heard from it yet.
    pub fn resume(&mut self) -> Result<Vec<Effect>, ThresholdError> {
        let me = self.device_id().to_string();
        let owed: Vec<CeremonyState> = self
            .ledger
            .keys()
            .filter_map(|k| k.active_ceremony())
            .filter(|c| c.phase == CeremonyPhase::CollectingJoins && c.status(&me) == Some(DeviceStatus::Discovered))
            .cloned()
            .collect();
        let mut effects = Vec::new();
        for ceremony in owed {
            info!(key_ref = %ceremony.key_ref, epoch = ceremony.epoch, "joining ceremony missed while away");
            self.emit(
                &mut effects,
                CeremonyEvent::Join(CeremonyJoin {
                    ceremony_id: ceremony.ceremony_id.clone(),
                    key_ref: ceremony.key_ref.clone(),
                    epoch: ceremony.epoch,
                    device: self.identity.public_keys(),
                }),
            )?;
        }
        Ok(effects)
    }

    pub fn handle_durable(&mut self, signed: &SignedEvent) -> Result<Vec<Effect>, ThresholdError> {
        let transitions = self.ledger.apply(signed)?;
        if signed.sender == self.device_id() {
            self.counter = self.counter.max(signed.counter);
        }
        debug!(
            event = signed.event.type_name(),
            sender = %signed.sender,
            counter = signed.counter,
            transitions = transitions.len(),
            "durable event applied"
        );

        let mut effects = Vec::new();
        let key_ref = signed.event.key_ref().to_string();
        match &signed.event {
            CeremonyEvent::Init(init) => self.on_init(init, &mut effects)?,
            CeremonyEvent::ShareEnvelope(env) if env.to == self.device_id() => {
                self.on_own_envelope(env, &mut effects)?
            }
            CeremonyEvent::UnlockApproval(approval) => self.on_approval(approval, &mut effects)?,
            _ => {}
        }
        for transition in &transitions {
            match transition {
                Transition::PhaseChanged { to, from, .. } => {
                    info!(key_ref = %key_ref, %from, %to, "ceremony phase changed");
                }
                Transition::Finalized { ceremony_id, epoch, .. } => {
                    self.on_finalized(&key_ref, ceremony_id, *epoch, &mut effects)?
                }
                Transition::Aborted {
                    ceremony_id,
                    phase,
                    reason,
                    ..
                } => self.on_aborted(&key_ref, ceremony_id, *phase, reason, &mut effects),
                Transition::RequestOpened { request_id, .. } => {
                    self.on_request_opened(&key_ref, request_id, &mut effects)?
                }
                Transition::RotationCommitted { old_epoch, new_epoch, .. } => {
                    info!(key_ref = %key_ref, old_epoch, new_epoch, "epoch revoked");
                }
                _ => {}
            }
        }
        self.drive_initiator(&key_ref, &mut effects)?;
        Ok(effects)
    }

    pub fn handle_liveness(&mut self, message: &LivenessMessage, now: DateTime<Utc>) {
        self.liveness.observe(message, now);
    }

    /// Periodic work: heartbeats, phase timeouts, request and session expiry.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>, ThresholdError> {
        let mut effects = Vec::new();
        let me = self.device_id().to_string();

        let heartbeat_due = self
            .last_heartbeat
            .map(|last| elapsed(last, now) >= self.config.heartbeat_interval())
            .unwrap_or(true);
        if heartbeat_due {
            for key in self.ledger.keys() {
                let involved = key.members.contains_key(&me)
                    || key.active_ceremony().is_some_and(|c| c.devices.contains_key(&me));
                if involved {
                    effects.push(Effect::Broadcast(LivenessMessage::Heartbeat {
                        device_id: me.clone(),
                        key_ref: key.key_ref.clone(),
                        sent_at: now,
                    }));
                }
            }
            self.last_heartbeat = Some(now);
        }

        let mut timeouts = Vec::new();
        for key in self.ledger.keys() {
            let Some(ceremony) = key.active_ceremony() else { continue };
            if !ceremony.devices.contains_key(&me) {
                continue;
            }
            let Some(limit) = self.config.phase_timeout(ceremony.phase) else { continue };
            let marker = format!("{}/{}", ceremony.ceremony_id, ceremony.phase);
            if elapsed(ceremony.phase_since, now) > limit && !self.aborts_sent.contains(&marker) {
                let silent = self.liveness.silent_peers(ceremony.devices.keys(), now);
                warn!(key_ref = %key.key_ref, phase = %ceremony.phase, ?silent, "ceremony phase timed out");
                timeouts.push((marker, abort_for(ceremony, AbortReason::Timeout)));
            }
        }
        for (marker, abort) in timeouts {
            self.aborts_sent.insert(marker);
            self.emit(&mut effects, CeremonyEvent::Abort(abort))?;
        }

        let request_timeout = self.config.request_timeout();
        let expired: Vec<String> = self
            .requests
            .iter()
            .filter(|(_, r)| elapsed(r.opened_at, now) > request_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in expired {
            if let Some(request) = self.requests.remove(&request_id) {
                warn!(key_ref = %request.key_ref, request = %request_id, "request expired without enough approvals");
                effects.push(Effect::RequestExpired {
                    key_ref: request.key_ref,
                    request_id,
                });
            }
        }

        let ended: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key_ref in ended {
            self.sessions.remove(&key_ref);
            debug!(key_ref = %key_ref, "session expired");
            effects.push(Effect::SessionExpired { key_ref });
        }
        Ok(effects)
    }

    // ── Reactions ────────────────────────────────────────────────────────────

    fn on_init(&mut self, init: &CeremonyInit, effects: &mut Vec<Effect>) -> Result<(), ThresholdError> {
        let me = self.device_id().to_string();
        if init.initiator.device_id == me || !init.devices.contains(&me) {
            return Ok(());
        }
        info!(key_ref = %init.key_ref, epoch = init.epoch, initiator = %init.initiator.device_id, "joining ceremony");
        self.emit(
            effects,
            CeremonyEvent::Join(CeremonyJoin {
                ceremony_id: init.ceremony_id.clone(),
                key_ref: init.key_ref.clone(),
                epoch: init.epoch,
                device: self.identity.public_keys(),
            }),
        )
    }

    fn on_own_envelope(&mut self, env: &ShareEnvelope, effects: &mut Vec<Effect>) -> Result<(), ThresholdError> {
        let me = self.device_id().to_string();
        let index = self
            .ledger
            .key(&env.key_ref)
            .and_then(|k| k.ceremony.as_ref())
            .and_then(|c| c.share_index(&me))
            .unwrap_or(0);
        let checked = open_share(&self.identity, env, index).and_then(|share| {
            if share.commitment(&share_context(&env.key_ref, env.epoch, &me)) == env.share_commitment {
                Ok(share)
            } else {
                Err(CryptoError::InvalidShare("commitment mismatch".into()))
            }
        });
        match checked {
            Ok(share) => {
                self.pending_shares.insert(env.ceremony_id.clone(), share);
                if !self.replaying {
                    effects.push(Effect::PersistEnvelope(env.clone()));
                }
                self.emit(
                    effects,
                    CeremonyEvent::ShareAck(ShareAck {
                        ceremony_id: env.ceremony_id.clone(),
                        key_ref: env.key_ref.clone(),
                        epoch: env.epoch,
                        device_id: me,
                        share_commitment: env.share_commitment.clone(),
                    }),
                )
            }
            Err(e) => {
                warn!(key_ref = %env.key_ref, epoch = env.epoch, error = %e, "rejecting share");
                self.emit(
                    effects,
                    CeremonyEvent::ShareReject(ShareReject {
                        ceremony_id: env.ceremony_id.clone(),
                        key_ref: env.key_ref.clone(),
                        epoch: env.epoch,
                        device_id: me,
                        reason: e.to_string(),
                    }),
                )
            }
        }
    }

    fn on_finalized(
        &mut self,
        key_ref: &str,
        ceremony_id: &str,
        epoch: u64,
        effects: &mut Vec<Effect>,
    ) -> Result<(), ThresholdError> {
        let me = self.device_id().to_string();
        let key = self.key(key_ref)?;
        let is_member = key.members.contains_key(&me);
        let policy = key.policy;
        let kind = key.ceremony.as_ref().map(|c| c.kind.clone());

        if let Some(share) = self.pending_shares.remove(ceremony_id) {
            if is_member {
                self.shares.insert(key_ref.to_string(), HeldShare { epoch, share });
            }
        }
        if !is_member {
            self.shares.remove(key_ref);
        }
        info!(key_ref, epoch, member = is_member, "ceremony finalized");

        let Some(dealing) = self.dealings.remove(ceremony_id) else {
            return Ok(());
        };
        let (Some(policy), Some(kind)) = (policy, kind) else {
            return Ok(());
        };
        let session_key = derive_session_key(&dealing.secret, key_ref, epoch)?;
        let previous_epoch = match &kind {
            CeremonyKind::Rotation { previous_epoch, .. } => Some(*previous_epoch),
            CeremonyKind::Enrollment => None,
        };
        self.sessions.insert(
            key_ref.to_string(),
            SessionInfo {
                epoch,
                expires_at: Utc::now() + to_chrono(self.config.session_ttl()),
            },
        );
        effects.push(Effect::KeyEstablished {
            key_ref: key_ref.to_string(),
            epoch,
            key: session_key,
            policy,
            previous_epoch,
        });
        if let CeremonyKind::Rotation {
            previous_epoch,
            revoked_devices,
        } = kind
        {
            self.emit(
                effects,
                CeremonyEvent::RotateCommit(RotateCommit {
                    ceremony_id: ceremony_id.to_string(),
                    key_ref: key_ref.to_string(),
                    old_epoch: previous_epoch,
                    new_epoch: epoch,
                    revoked_devices,
                }),
            )?;
        }
        Ok(())
    }

    fn on_aborted(
        &mut self,
        key_ref: &str,
        ceremony_id: &str,
        phase: CeremonyPhase,
        reason: &AbortReason,
        effects: &mut Vec<Effect>,
    ) {
        self.dealings.remove(ceremony_id);
        self.pending_shares.remove(ceremony_id);
        warn!(key_ref, %phase, ?reason, "ceremony aborted");
        if !self.replaying {
            effects.push(Effect::CeremonyFailed {
                key_ref: key_ref.to_string(),
                phase,
                reason: reason.clone(),
            });
        }
    }

    fn on_request_opened(
        &mut self,
        key_ref: &str,
        request_id: &str,
        effects: &mut Vec<Effect>,
    ) -> Result<(), ThresholdError> {
        if self.replaying {
            return Ok(());
        }
        let me = self.device_id().to_string();
        let key = self.key(key_ref)?;
        let Some(request) = key.requests.get(request_id) else {
            return Ok(());
        };
        if request.requester == me || !key.members.contains_key(&me) || key.revoked_devices.contains(&me) {
            return Ok(());
        }
        let recovery = match &request.kind {
            RequestKind::Recovery { lost_devices } if lost_devices.contains(&me) => return Ok(()),
            RequestKind::Recovery { .. } => true,
            RequestKind::Unlock { .. } => false,
        };
        if self.shares.get(key_ref).map(|h| h.epoch) != Some(request.epoch) {
            debug!(key_ref, request = request_id, "no share for the requested epoch");
            return Ok(());
        }
        if self.config.auto_approve {
            let approved = self.approve(key_ref, request_id)?;
            effects.extend(approved);
        } else {
            effects.push(Effect::ApprovalRequired {
                key_ref: key_ref.to_string(),
                request_id: request_id.to_string(),
                requester: request.requester.clone(),
                epoch: request.epoch,
                recovery,
            });
        }
        Ok(())
    }

    fn on_approval(&mut self, approval: &UnlockApproval, effects: &mut Vec<Effect>) -> Result<(), ThresholdError> {
        let me = self.device_id().to_string();
        if !self.requests.contains_key(&approval.request_id) {
            return Ok(());
        }
        let Some(member) = self
            .ledger
            .key(&approval.key_ref)
            .and_then(|k| k.members.get(&approval.approver))
            .cloned()
        else {
            return Ok(());
        };
        let aad = contribution_aad(&approval.key_ref, approval.epoch, &approval.request_id, &me);
        let checked = open_with(&self.identity, &approval.contribution, &aad)
            .and_then(|bytes| RawShare::from_bytes(&bytes))
            .and_then(|share| {
                let context = share_context(&approval.key_ref, approval.epoch, &approval.approver);
                if share.index() == member.share_index && share.commitment(&context) == member.share_commitment {
                    Ok(share)
                } else {
                    Err(CryptoError::InvalidShare("contribution does not match commitment".into()))
                }
            });
        match checked {
            Ok(share) => {
                if let Some(request) = self.requests.get_mut(&approval.request_id) {
                    request.contributions.insert(share.index(), share);
                }
                self.try_complete(&approval.request_id, effects)
            }
            Err(e) => {
                warn!(approver = %approval.approver, error = %e, "ignoring bad contribution");
                Ok(())
            }
        }
    }

    /// Initiator duties that depend only on the ledger: deal once everyone joined, then
    /// finalize or abort once every share is settled.
    fn drive_initiator(&mut self, key_ref: &str, effects: &mut Vec<Effect>) -> Result<(), ThresholdError> {
        let Some(ceremony) = self
            .ledger
            .key(key_ref)
            .and_then(|k| k.active_ceremony())
            .filter(|c| c.initiator == self.identity.device_id())
            .cloned()
        else {
            return Ok(());
        };
        let Some(dealing) = self.dealings.get_mut(&ceremony.ceremony_id) else {
            return Ok(());
        };

        if ceremony.phase == CeremonyPhase::DistributingShares && !dealing.dealt {
            dealing.dealt = true;
            let envelopes = deal(&dealing.secret, &ceremony, self.identity.device_id())?;
            info!(key_ref, epoch = ceremony.epoch, shares = envelopes.len(), "dealing shares");
            for envelope in envelopes {
                self.emit(effects, CeremonyEvent::ShareEnvelope(envelope))?;
            }
            return Ok(());
        }

        if ceremony.phase == CeremonyPhase::VerifyingShares && ceremony.all_settled() && !dealing.concluded {
            dealing.concluded = true;
            let verified: Vec<DevicePublicKeys> = ceremony.verified().into_iter().cloned().collect();
            if verified.len() >= usize::from(ceremony.policy.t) {
                let n = u8::try_from(verified.len())
                    .map_err(|_| ThresholdError::invalid("threshold.ceremony.finalize", "too many devices"))?;
                let finalize = CeremonyFinalize {
                    ceremony_id: ceremony.ceremony_id.clone(),
                    key_ref: key_ref.to_string(),
                    epoch: ceremony.epoch,
                    policy: ThresholdPolicy {
                        t: ceremony.policy.t,
                        n,
                    },
                    devices: verified,
                    secret_commitment: secret_commitment(&dealing.secret, key_ref, ceremony.epoch),
                };
                self.emit(effects, CeremonyEvent::Finalize(finalize))?;
            } else {
                let failed = ceremony
                    .devices
                    .iter()
                    .find(|(_, d)| d.status == DeviceStatus::Error)
                    .map(|(id, _)| id.clone())
                    .unwrap_or_default();
                warn!(key_ref, device = %failed, "too few verified shares; aborting");
                let abort = abort_for(&ceremony, AbortReason::ShareVerificationFailed { device_id: failed });
                self.emit(effects, CeremonyEvent::Abort(abort))?;
            }
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn begin_ceremony(
        &mut self,
        key_ref: &str,
        epoch: u64,
        policy: ThresholdPolicy,
        devices: Vec<DeviceId>,
        kind: CeremonyKind,
    ) -> Result<Vec<Effect>, ThresholdError> {
        if self.ledger.key(key_ref).and_then(|k| k.active_ceremony()).is_some() {
            return Err(ThresholdError::CeremonyBusy {
                key_ref: key_ref.to_string(),
            });
        }
        let ceremony_id = Uuid::new_v4().to_string();
        let secret = Zeroizing::new(SecretKey::random().expose().to_vec());
        self.dealings.insert(
            ceremony_id.clone(),
            Dealing {
                key_ref: key_ref.to_string(),
                secret,
                dealt: false,
                concluded: false,
            },
        );
        info!(key_ref, epoch, %policy, ?kind, "starting ceremony");
        let mut effects = Vec::new();
        self.emit(
            &mut effects,
            CeremonyEvent::Init(CeremonyInit {
                ceremony_id,
                key_ref: key_ref.to_string(),
                epoch,
                policy,
                devices,
                initiator: self.identity.public_keys(),
                kind,
            }),
        )?;
        Ok(effects)
    }

    fn open_own_request(
        &mut self,
        key_ref: &str,
        epoch: u64,
        request_id: &str,
        lost_devices: Option<Vec<DeviceId>>,
    ) -> Result<(), ThresholdError> {
        let held = self
            .shares
            .get(key_ref)
            .filter(|h| h.epoch == epoch)
            .ok_or_else(|| ThresholdError::NoShare {
                key_ref: key_ref.to_string(),
                epoch,
            })?;
        let mut contributions = BTreeMap::new();
        contributions.insert(held.share.index(), held.share.clone());
        self.requests.insert(
            request_id.to_string(),
            OwnRequest {
                key_ref: key_ref.to_string(),
                epoch,
                lost_devices,
                contributions,
                opened_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn try_complete(&mut self, request_id: &str, effects: &mut Vec<Effect>) -> Result<(), ThresholdError> {
        let Some(request) = self.requests.get(request_id) else {
            return Ok(());
        };
        let key = self.key(&request.key_ref)?;
        let (Some(policy), Some(commitment)) = (key.policy, key.secret_commitment.clone()) else {
            return Ok(());
        };
        if request.contributions.len() < usize::from(policy.t) {
            return Ok(());
        }
        let survivors = request.lost_devices.as_ref().map(|lost| {
            members_in_order(key)
                .into_iter()
                .filter(|d| !lost.contains(d))
                .collect::<Vec<_>>()
        });
        let Some(request) = self.requests.remove(request_id) else {
            return Ok(());
        };

        let picked: Vec<RawShare> = request
            .contributions
            .values()
            .take(usize::from(policy.t))
            .cloned()
            .collect();
        let secret = shamir::combine(&picked)?;
        if secret_commitment(&secret, &request.key_ref, request.epoch) != commitment {
            warn!(key_ref = %request.key_ref, "reconstructed secret does not match commitment");
            return Err(ThresholdError::ShareVerificationFailed {
                device: self.device_id().to_string(),
            });
        }
        let session_key = derive_session_key(&secret, &request.key_ref, request.epoch)?;
        let ttl = self.config.session_ttl();
        self.sessions.insert(
            request.key_ref.clone(),
            SessionInfo {
                epoch: request.epoch,
                expires_at: Utc::now() + to_chrono(ttl),
            },
        );
        info!(key_ref = %request.key_ref, epoch = request.epoch, "session key reconstructed");
        effects.push(Effect::SessionReady {
            key_ref: request.key_ref.clone(),
            epoch: request.epoch,
            key: session_key,
            ttl,
        });

        if let (Some(lost), Some(survivors)) = (request.lost_devices, survivors) {
            let rotated = survivor_policy(policy, survivors.len())?;
            let rotation = self.begin_ceremony(
                &request.key_ref,
                request.epoch + 1,
                rotated,
                survivors,
                CeremonyKind::Rotation {
                    previous_epoch: request.epoch,
                    revoked_devices: lost,
                },
            )?;
            effects.extend(rotation);
        }
        Ok(())
    }

    /// Sign and queue `event`. Suppressed while replaying.
    fn emit(&mut self, effects: &mut Vec<Effect>, event: CeremonyEvent) -> Result<(), ThresholdError> {
        if self.replaying {
            return Ok(());
        }
        self.counter += 1;
        effects.push(Effect::Publish(SignedEvent::sign(&self.identity, self.counter, event)?));
        Ok(())
    }

    fn key(&self, key_ref: &str) -> Result<&KeyState, ThresholdError> {
        self.ledger
            .key(key_ref)
            .ok_or_else(|| ThresholdError::UnknownKey(key_ref.to_string()))
    }

    fn ensure_member(&self, key: &KeyState) -> Result<(), ThresholdError> {
        let me = self.device_id();
        if key.members.contains_key(me) && !key.revoked_devices.contains(me) {
            Ok(())
        } else {
            Err(ThresholdError::NotMember {
                device: me.to_string(),
                key_ref: key.key_ref.clone(),
            })
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("device_id", &self.device_id())
            .field("counter", &self.counter)
            .field("dealings", &self.dealings.values().map(|d| &d.key_ref).collect::<Vec<_>>())
            .field("shares", &self.shares.len())
            .finish_non_exhaustive()
    }
}

fn deal(secret: &[u8], ceremony: &CeremonyState, from: &str) -> Result<Vec<ShareEnvelope>, ThresholdError> {
    let shares = shamir::split(secret, ceremony.policy.t, ceremony.policy.n)?;
    let mut envelopes = Vec::with_capacity(shares.len());
    for (device, share) in ceremony.order.iter().zip(shares) {
        let keys = ceremony
            .devices
            .get(device)
            .and_then(|d| d.keys.as_ref())
            .ok_or_else(|| ThresholdError::UnknownSender(device.clone()))?;
        let aad = share_aad(&ceremony.key_ref, ceremony.epoch, device);
        let sealed = seal_to(&keys.enc_pub, &share.to_bytes(), &aad)?;
        let commitment = share.commitment(&share_context(&ceremony.key_ref, ceremony.epoch, device));
        envelopes.push(ShareEnvelope::from_sealed_box(
            ShareEnvelopeHeader {
                ceremony_id: ceremony.ceremony_id.clone(),
                to: device.clone(),
                from: from.to_string(),
                key_ref: ceremony.key_ref.clone(),
                epoch: ceremony.epoch,
            },
            commitment,
            sealed,
        ));
    }
    Ok(envelopes)
}

fn open_share(identity: &DeviceIdentity, env: &ShareEnvelope, expected_index: u8) -> Result<RawShare, CryptoError> {
    let bytes = open_with(identity, &env.sealed_box(), &share_aad(&env.key_ref, env.epoch, &env.to))?;
    let share = RawShare::from_bytes(&bytes)?;
    if share.index() != expected_index {
        return Err(CryptoError::InvalidShare(format!(
            "share index {} where {expected_index} was expected",
            share.index()
        )));
    }
    Ok(share)
}

fn abort_for(ceremony: &CeremonyState, reason: AbortReason) -> CeremonyAbort {
    CeremonyAbort {
        ceremony_id: ceremony.ceremony_id.clone(),
        key_ref: ceremony.key_ref.clone(),
        epoch: ceremony.epoch,
        phase: ceremony.phase,
        reason,
    }
}

/// Current members ordered by share index.
fn members_in_order(key: &KeyState) -> Vec<DeviceId> {
    let mut members: Vec<(&DeviceId, u8)> = key.members.iter().map(|(id, m)| (id, m.share_index)).collect();
    members.sort_by_key(|(_, index)| *index);
    members.into_iter().map(|(id, _)| id.clone()).collect()
}

fn survivor_policy(policy: ThresholdPolicy, survivors: usize) -> Result<ThresholdPolicy, ThresholdError> {
    let need = usize::from(policy.t);
    if survivors < need {
        return Err(ThresholdError::NotEnoughSurvivors { have: survivors, need });
    }
    let n = u8::try_from(survivors).map_err(|_| ThresholdError::NotEnoughSurvivors { have: survivors, need })?;
    Ok(ThresholdPolicy::new(policy.t, n)?)
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since).to_std().unwrap_or(Duration::ZERO)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}
