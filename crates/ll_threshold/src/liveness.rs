//! Presence overlay fed by the ephemeral channel.
//!
//! Nothing here touches the ledger. A device that never sends a heartbeat still completes a
//! ceremony if its durable events arrive; a device that heartbeats happily but never
//! publishes its join does not.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use ll_proto::{AbortReason, CeremonyPhase, DeviceId, DeviceStatus, LivenessMessage};

use crate::state::CeremonyState;

#[derive(Debug)]
pub struct LivenessTracker {
    me: DeviceId,
    offline_after: Duration,
    last_seen: HashMap<DeviceId, DateTime<Utc>>,
    reported_offline: HashSet<DeviceId>,
}

impl LivenessTracker {
    pub fn new(me: impl Into<DeviceId>, offline_after: std::time::Duration) -> Self {
        Self {
            me: me.into(),
            offline_after: Duration::from_std(offline_after).unwrap_or_else(|_| Duration::seconds(30)),
            last_seen: HashMap::new(),
            reported_offline: HashSet::new(),
        }
    }

    /// Record a liveness message received at `now` (local clock, not the sender's).
    pub fn observe(&mut self, message: &LivenessMessage, now: DateTime<Utc>) {
        match message {
            LivenessMessage::Heartbeat { device_id, .. }
            | LivenessMessage::Presence {
                device_id,
                online: true,
                ..
            } => {
                self.last_seen.insert(device_id.clone(), now);
                self.reported_offline.remove(device_id);
            }
            LivenessMessage::Presence {
                device_id,
                online: false,
                ..
            }
            | LivenessMessage::PeerOffline { device_id, .. } => {
                self.reported_offline.insert(device_id.clone());
            }
        }
    }

    pub fn is_online(&self, device: &str, now: DateTime<Utc>) -> bool {
        if device == self.me {
            return true;
        }
        if self.reported_offline.contains(device) {
            return false;
        }
        self.last_seen
            .get(device)
            .map(|seen| now.signed_duration_since(*seen) <= self.offline_after)
            .unwrap_or(false)
    }

    /// Peers whose silence crossed the offline threshold.
    pub fn silent_peers<'a>(&self, devices: impl IntoIterator<Item = &'a DeviceId>, now: DateTime<Utc>) -> Vec<DeviceId> {
        devices
            .into_iter()
            .filter(|d| !self.is_online(d, now))
            .cloned()
            .collect()
    }

    /// Per-device status for display: durable status, with `offline` and `timed_out` layered on.
    pub fn overlay(&self, ceremony: &CeremonyState, now: DateTime<Utc>) -> BTreeMap<DeviceId, DeviceStatus> {
        let timed_out = ceremony.phase == CeremonyPhase::Error
            && matches!(ceremony.abort_reason, Some(AbortReason::Timeout));
        ceremony
            .devices
            .iter()
            .map(|(id, state)| {
                let status = match state.status {
                    DeviceStatus::Error => DeviceStatus::Error,
                    DeviceStatus::Discovered | DeviceStatus::Joined | DeviceStatus::ShareReceived if timed_out => {
                        DeviceStatus::TimedOut
                    }
                    _ if !self.is_online(id, now) => DeviceStatus::Offline,
                    other => other,
                };
                (id.clone(), status)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_keeps_a_peer_online_until_it_goes_quiet() {
        let mut tracker = LivenessTracker::new("desktop", std::time::Duration::from_secs(30));
        let t0 = Utc::now();
        assert!(!tracker.is_online("phone-a", t0));
        assert!(tracker.is_online("desktop", t0));

        tracker.observe(&LivenessMessage::heartbeat("phone-a", "db:my-list"), t0);
        assert!(tracker.is_online("phone-a", t0 + Duration::seconds(10)));
        assert!(!tracker.is_online("phone-a", t0 + Duration::seconds(31)));
    }

    #[test]
    fn peer_offline_report_wins_until_next_heartbeat() {
        let mut tracker = LivenessTracker::new("desktop", std::time::Duration::from_secs(30));
        let t0 = Utc::now();
        tracker.observe(&LivenessMessage::heartbeat("phone-b", "db:my-list"), t0);
        tracker.observe(
            &LivenessMessage::PeerOffline {
                device_id: "phone-b".into(),
                observed_by: "phone-a".into(),
                sent_at: t0,
            },
            t0,
        );
        assert!(!tracker.is_online("phone-b", t0));
        tracker.observe(&LivenessMessage::heartbeat("phone-b", "db:my-list"), t0);
        assert!(tracker.is_online("phone-b", t0));
    }
}
