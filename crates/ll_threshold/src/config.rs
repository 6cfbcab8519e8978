use std::time::Duration;

use ll_proto::CeremonyPhase;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CeremonyConfig {
    pub join_timeout_secs: u64,
    pub distribute_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    /// How long an unlock or recovery request waits for approvals.
    pub request_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Silence after which a peer is shown offline.
    pub offline_after_secs: u64,
    /// Lifetime of a reconstructed session key.
    pub session_ttl_secs: u64,
    /// Answer unlock and recovery requests without asking the user.
    #[serde(default)]
    pub auto_approve: bool,
    pub tick_interval_ms: u64,
}

impl Default for CeremonyConfig {
    fn default() -> Self {
        Self {
            join_timeout_secs: 300,
            distribute_timeout_secs: 60,
            verify_timeout_secs: 120,
            request_timeout_secs: 120,
            heartbeat_interval_secs: 10,
            offline_after_secs: 30,
            session_ttl_secs: 15 * 60,
            auto_approve: false,
            tick_interval_ms: 500,
        }
    }
}

impl CeremonyConfig {
    /// Bound on how long a ceremony may sit in `phase`; `None` for terminal phases.
    pub fn phase_timeout(&self, phase: CeremonyPhase) -> Option<Duration> {
        let secs = match phase {
            CeremonyPhase::Init | CeremonyPhase::CollectingJoins => self.join_timeout_secs,
            CeremonyPhase::DistributingShares => self.distribute_timeout_secs,
            CeremonyPhase::VerifyingShares => self.verify_timeout_secs,
            CeremonyPhase::Ready | CeremonyPhase::Error => return None,
        };
        Some(Duration::from_secs(secs))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_after_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
