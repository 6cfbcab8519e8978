//! Ephemeral liveness messages.
//!
//! Best-effort, unordered, unsigned. They drive UI state (`offline`, `timed_out`) and
//! timeout detection, never a cryptographic decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ceremony::DeviceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LivenessMessage {
    #[serde(rename = "threshold.heartbeat")]
    Heartbeat {
        device_id: DeviceId,
        key_ref: String,
        sent_at: DateTime<Utc>,
    },
    #[serde(rename = "threshold.presence")]
    Presence {
        device_id: DeviceId,
        online: bool,
        sent_at: DateTime<Utc>,
    },
    #[serde(rename = "threshold.peer.offline")]
    PeerOffline {
        device_id: DeviceId,
        observed_by: DeviceId,
        sent_at: DateTime<Utc>,
    },
}

impl LivenessMessage {
    pub fn heartbeat(device_id: impl Into<String>, key_ref: impl Into<String>) -> Self {
        LivenessMessage::Heartbeat {
            device_id: device_id.into(),
            key_ref: key_ref.into(),
            sent_at: Utc::now(),
        }
    }

    /// The device the message is about.
    pub fn subject(&self) -> &str {
        match self {
            LivenessMessage::Heartbeat { device_id, .. } => device_id,
            LivenessMessage::Presence { device_id, .. } => device_id,
            LivenessMessage::PeerOffline { device_id, .. } => device_id,
        }
    }
}
