use crate::feed::{FailurePhase, FetchError};

/// Thresholds applied to consecutive feed failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Connection-phase failures tolerated before the client is recreated.
    pub client_reset_after: u32,
    /// Consecutive failures of any kind before discovery is re-run. 0 disables.
    pub rediscover_after: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            client_reset_after: 5,
            rediscover_after: 10,
        }
    }
}

/// What the poller should do after a failed fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureAction {
    pub reset_client: bool,
    pub rediscover: bool,
}

/// Tracks consecutive fetch failures and decides on client resets and rediscovery.
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    policy: FailurePolicy,
    consecutive: u32,
    connect_streak: u32,
}

impl FailureTracker {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
            connect_streak: 0,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Record a failure.
    pub fn mark_failure(&mut self, err: &FetchError) -> FailureAction {
        self.consecutive = self.consecutive.saturating_add(1);
        let reset_client = match err.phase() {
            FailurePhase::Connection => {
                self.connect_streak += 1;
                if self.connect_streak >= self.policy.client_reset_after.max(1) {
                    self.connect_streak = 0;
                    true
                } else {
                    false
                }
            }
            FailurePhase::Protocol => {
                self.connect_streak = 0;
                true
            }
            FailurePhase::Response => false,
        };
        let rediscover =
            self.policy.rediscover_after > 0 && self.consecutive >= self.policy.rediscover_after;
        FailureAction {
            reset_client,
            rediscover,
        }
    }

    /// Reset counters after a good fetch.
    pub fn mark_success(&mut self) {
        self.consecutive = 0;
        self.connect_streak = 0;
    }
}
