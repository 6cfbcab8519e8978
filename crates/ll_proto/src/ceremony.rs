//! Durable coordination events for threshold ceremonies.
//!
//! Every event is bound to a `key_ref` and `epoch` and travels inside a `SignedEvent`
//! carrying the sender's monotonic counter, a timestamp and an Ed25519 signature over the
//! canonical bytes. Participants fold the same ordered stream into identical state, so
//! these types are the whole protocol: nothing else is authoritative.
//!
//! Shares only ever appear sealed to a single recipient (`ShareEnvelope`,
//! `UnlockApproval::contribution`).

use chrono::{DateTime, Utc};
use ll_crypto::{DeviceIdentity, DevicePublicKeys, Sealed, SealedBox};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::record::ThresholdPolicy;

pub type DeviceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyPhase {
    Init,
    CollectingJoins,
    DistributingShares,
    VerifyingShares,
    Ready,
    Error,
}

impl std::fmt::Display for CeremonyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CeremonyPhase::Init => "init",
            CeremonyPhase::CollectingJoins => "collecting_joins",
            CeremonyPhase::DistributingShares => "distributing_shares",
            CeremonyPhase::VerifyingShares => "verifying_shares",
            CeremonyPhase::Ready => "ready",
            CeremonyPhase::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Discovered,
    Joined,
    ShareReceived,
    Verified,
    Ready,
    Offline,
    TimedOut,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CeremonyKind {
    Enrollment,
    Rotation {
        previous_epoch: u64,
        revoked_devices: Vec<DeviceId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyInit {
    pub ceremony_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub policy: ThresholdPolicy,
    pub devices: Vec<DeviceId>,
    pub initiator: DevicePublicKeys,
    pub kind: CeremonyKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyJoin {
    pub ceremony_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub device: DevicePublicKeys,
}

/// A share sealed to one recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEnvelope {
    pub ceremony_id: String,
    pub to: DeviceId,
    pub from: DeviceId,
    pub key_ref: String,
    pub epoch: u64,
    #[serde(with = "ll_crypto::encoding::b64_32")]
    pub ephemeral_pub: [u8; 32],
    #[serde(with = "ll_crypto::encoding::b64")]
    pub wrapped_share: Vec<u8>,
    #[serde(with = "ll_crypto::encoding::b64")]
    pub nonce: Vec<u8>,
    pub alg: String,
    /// Commitment to the unwrapped share, checked by the recipient.
    pub share_commitment: String,
}

impl ShareEnvelope {
    pub fn sealed_box(&self) -> SealedBox {
        SealedBox {
            ephemeral_pub: self.ephemeral_pub,
            sealed: Sealed {
                alg: self.alg.clone(),
                nonce: self.nonce.clone(),
                ciphertext: self.wrapped_share.clone(),
            },
        }
    }

    pub fn from_sealed_box(header: ShareEnvelopeHeader, commitment: String, sealed: SealedBox) -> Self {
        Self {
            ceremony_id: header.ceremony_id,
            to: header.to,
            from: header.from,
            key_ref: header.key_ref,
            epoch: header.epoch,
            ephemeral_pub: sealed.ephemeral_pub,
            wrapped_share: sealed.sealed.ciphertext,
            nonce: sealed.sealed.nonce,
            alg: sealed.sealed.alg,
            share_commitment: commitment,
        }
    }
}

/// Routing part of a `ShareEnvelope`.
#[derive(Debug, Clone)]
pub struct ShareEnvelopeHeader {
    pub ceremony_id: String,
    pub to: DeviceId,
    pub from: DeviceId,
    pub key_ref: String,
    pub epoch: u64,
}

/// AEAD associated data binding a sealed share to its ceremony context.
pub fn share_aad(key_ref: &str, epoch: u64, to: &str) -> Vec<u8> {
    format!("ll-share|{key_ref}|{epoch}|{to}").into_bytes()
}

/// AEAD associated data binding an unlock contribution to one request.
pub fn contribution_aad(key_ref: &str, epoch: u64, request_id: &str, requester: &str) -> Vec<u8> {
    format!("ll-contribution|{key_ref}|{epoch}|{request_id}|{requester}").into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareAck {
    pub ceremony_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub device_id: DeviceId,
    pub share_commitment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareReject {
    pub ceremony_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub device_id: DeviceId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyFinalize {
    pub ceremony_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub policy: ThresholdPolicy,
    pub devices: Vec<DevicePublicKeys>,
    /// Commitment to the shared secret; reconstructions are checked against it.
    pub secret_commitment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    Timeout,
    ShareVerificationFailed { device_id: DeviceId },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyAbort {
    pub ceremony_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub phase: CeremonyPhase,
    pub reason: AbortReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub request_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub requester: DeviceId,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub request_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub requester: DeviceId,
    pub lost_devices: Vec<DeviceId>,
}

/// A share contribution sealed to the requester, answering an unlock or recovery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockApproval {
    pub request_id: String,
    pub key_ref: String,
    pub epoch: u64,
    pub approver: DeviceId,
    pub contribution: SealedBox,
    /// Approver's signature over `approval_signing_bytes`.
    #[serde(with = "ll_crypto::encoding::b64")]
    pub signature: Vec<u8>,
}

impl UnlockApproval {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        approval_signing_bytes(
            &self.request_id,
            &self.key_ref,
            self.epoch,
            &self.approver,
            &self.contribution,
        )
    }
}

pub fn approval_signing_bytes(
    request_id: &str,
    key_ref: &str,
    epoch: u64,
    approver: &str,
    contribution: &SealedBox,
) -> Result<Vec<u8>, ProtoError> {
    let canonical = serde_json::json!({
        "approver": approver,
        "contribution": contribution,
        "epoch": epoch,
        "key_ref": key_ref,
        "request_id": request_id,
    });
    Ok(serde_json::to_vec(&canonical)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateCommit {
    pub ceremony_id: String,
    pub key_ref: String,
    pub old_epoch: u64,
    pub new_epoch: u64,
    pub revoked_devices: Vec<DeviceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CeremonyEvent {
    #[serde(rename = "threshold.ceremony.init")]
    Init(CeremonyInit),
    #[serde(rename = "threshold.ceremony.join")]
    Join(CeremonyJoin),
    #[serde(rename = "threshold.share.envelope")]
    ShareEnvelope(ShareEnvelope),
    #[serde(rename = "threshold.share.ack")]
    ShareAck(ShareAck),
    #[serde(rename = "threshold.share.reject")]
    ShareReject(ShareReject),
    #[serde(rename = "threshold.ceremony.finalize")]
    Finalize(CeremonyFinalize),
    #[serde(rename = "threshold.ceremony.abort")]
    Abort(CeremonyAbort),
    #[serde(rename = "threshold.unlock.request")]
    UnlockRequest(UnlockRequest),
    #[serde(rename = "threshold.unlock.approval")]
    UnlockApproval(UnlockApproval),
    #[serde(rename = "threshold.recovery.request")]
    RecoveryRequest(RecoveryRequest),
    #[serde(rename = "threshold.rotate.commit")]
    RotateCommit(RotateCommit),
}

impl CeremonyEvent {
    pub fn key_ref(&self) -> &str {
        match self {
            CeremonyEvent::Init(e) => &e.key_ref,
            CeremonyEvent::Join(e) => &e.key_ref,
            CeremonyEvent::ShareEnvelope(e) => &e.key_ref,
            CeremonyEvent::ShareAck(e) => &e.key_ref,
            CeremonyEvent::ShareReject(e) => &e.key_ref,
            CeremonyEvent::Finalize(e) => &e.key_ref,
            CeremonyEvent::Abort(e) => &e.key_ref,
            CeremonyEvent::UnlockRequest(e) => &e.key_ref,
            CeremonyEvent::UnlockApproval(e) => &e.key_ref,
            CeremonyEvent::RecoveryRequest(e) => &e.key_ref,
            CeremonyEvent::RotateCommit(e) => &e.key_ref,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            CeremonyEvent::Init(e) => e.epoch,
            CeremonyEvent::Join(e) => e.epoch,
            CeremonyEvent::ShareEnvelope(e) => e.epoch,
            CeremonyEvent::ShareAck(e) => e.epoch,
            CeremonyEvent::ShareReject(e) => e.epoch,
            CeremonyEvent::Finalize(e) => e.epoch,
            CeremonyEvent::Abort(e) => e.epoch,
            CeremonyEvent::UnlockRequest(e) => e.epoch,
            CeremonyEvent::UnlockApproval(e) => e.epoch,
            CeremonyEvent::RecoveryRequest(e) => e.epoch,
            CeremonyEvent::RotateCommit(e) => e.new_epoch,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CeremonyEvent::Init(_) => "threshold.ceremony.init",
            CeremonyEvent::Join(_) => "threshold.ceremony.join",
            CeremonyEvent::ShareEnvelope(_) => "threshold.share.envelope",
            CeremonyEvent::ShareAck(_) => "threshold.share.ack",
            CeremonyEvent::ShareReject(_) => "threshold.share.reject",
            CeremonyEvent::Finalize(_) => "threshold.ceremony.finalize",
            CeremonyEvent::Abort(_) => "threshold.ceremony.abort",
            CeremonyEvent::UnlockRequest(_) => "threshold.unlock.request",
            CeremonyEvent::UnlockApproval(_) => "threshold.unlock.approval",
            CeremonyEvent::RecoveryRequest(_) => "threshold.recovery.request",
            CeremonyEvent::RotateCommit(_) => "threshold.rotate.commit",
        }
    }
}

/// Envelope for every event on the durable channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    /// Per-sender monotonic counter; non-increasing counters are replays.
    pub counter: u64,
    pub sent_at: DateTime<Utc>,
    pub sender: DeviceId,
    pub event: CeremonyEvent,
    #[serde(with = "ll_crypto::encoding::b64")]
    pub signature: Vec<u8>,
}

impl SignedEvent {
    pub fn sign(identity: &DeviceIdentity, counter: u64, event: CeremonyEvent) -> Result<Self, ProtoError> {
        Self::sign_at(identity, counter, Utc::now(), event)
    }

    pub fn sign_at(
        identity: &DeviceIdentity,
        counter: u64,
        sent_at: DateTime<Utc>,
        event: CeremonyEvent,
    ) -> Result<Self, ProtoError> {
        let sender = identity.device_id().to_string();
        let bytes = canonical_event_bytes(counter, &sent_at, &sender, &event)?;
        Ok(Self {
            counter,
            sent_at,
            sender,
            event,
            signature: identity.sign(&bytes),
        })
    }

    pub fn verify(&self, sender_keys: &DevicePublicKeys) -> Result<(), ProtoError> {
        if sender_keys.device_id != self.sender {
            return Err(ProtoError::MalformedEvent(format!(
                "sender {} does not match key owner {}",
                self.sender, sender_keys.device_id
            )));
        }
        let bytes = canonical_event_bytes(self.counter, &self.sent_at, &self.sender, &self.event)?;
        sender_keys.verify(&bytes, &self.signature)?;
        Ok(())
    }
}

/// Canonical bytes for signing a durable event.
pub fn canonical_event_bytes(
    counter: u64,
    sent_at: &DateTime<Utc>,
    sender: &str,
    event: &CeremonyEvent,
) -> Result<Vec<u8>, ProtoError> {
    let canonical = serde_json::json!({
        "counter": counter,
        "event": event,
        "sender": sender,
        "sent_at": sent_at.to_rfc3339(),
    });
    Ok(serde_json::to_vec(&canonical)?)
}
