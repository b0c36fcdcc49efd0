//! Time-limited per-agent trust grants

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::Clock;

/// Tracks which agents may skip confirmation for non-dangerous operations.
/// Expired grants are dropped the next time they are looked at.
pub struct TrustManager {
    clock: Arc<dyn Clock>,
    default_duration: Duration,
    grants: HashMap<String, Duration>,
}

impl TrustManager {
    pub fn new(clock: Arc<dyn Clock>, default_minutes: u64) -> Self {
        Self {
            clock,
            default_duration: minutes_to_duration(default_minutes),
            grants: HashMap::new(),
        }
    }

    /// Grant trust for `minutes`, or the configured default
    pub fn trust(&mut self, agent: &str, minutes: Option<u64>) -> Duration {
        let duration = minutes
            .map(minutes_to_duration)
            .unwrap_or(self.default_duration);
        let expires = self.clock.now().saturating_add(duration);
        self.grants.insert(agent.to_string(), expires);
        info!("Trusted @{} for {}s", agent, duration.as_secs());
        duration
    }

    /// Revoke immediately. Returns whether a grant existed.
    pub fn untrust(&mut self, agent: &str) -> bool {
        let existed = self.grants.remove(agent).is_some();
        if existed {
            info!("Revoked trust for @{}", agent);
        }
        existed
    }

    pub fn is_trusted(&mut self, agent: &str) -> bool {
        let Some(expires) = self.grants.get(agent).copied() else {
            return false;
        };
        if self.clock.now() >= expires {
            debug!("Trust for @{} expired", agent);
            self.grants.remove(agent);
            return false;
        }
        true
    }

    /// Time left on a grant, zero when absent or expired
    pub fn remaining(&self, agent: &str) -> Duration {
        self.grants
            .get(agent)
            .map(|expires| expires.saturating_sub(self.clock.now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Agents with an unexpired grant, sorted
    pub fn trusted_agents(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut agents: Vec<String> = self
            .grants
            .iter()
            .filter(|(_, expires)| **expires > now)
            .map(|(agent, _)| agent.clone())
            .collect();
        agents.sort();
        agents
    }
}

fn minutes_to_duration(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> (Arc<ManualClock>, TrustManager) {
        let clock = Arc::new(ManualClock::new());
        let trust = TrustManager::new(clock.clone(), 30);
        (clock, trust)
    }

    #[test]
    fn test_trust_expires() {
        let (clock, mut trust) = manager();
        assert!(!trust.is_trusted("Coder"));
        trust.trust("Coder", Some(5));
        assert!(trust.is_trusted("Coder"));
        assert_eq!(trust.remaining("Coder"), Duration::from_secs(300));

        clock.advance(Duration::from_secs(299));
        assert!(trust.is_trusted("Coder"));
        clock.advance(Duration::from_secs(1));
        assert!(!trust.is_trusted("Coder"));
        assert_eq!(trust.remaining("Coder"), Duration::ZERO);
    }

    #[test]
    fn test_default_duration() {
        let (_clock, mut trust) = manager();
        assert_eq!(trust.trust("Architect", None), Duration::from_secs(1800));
    }

    #[test]
    fn test_huge_grant_saturates() {
        let (clock, mut trust) = manager();
        clock.advance(Duration::from_secs(10));
        let granted = trust.trust("Coder", Some(u64::MAX));
        assert_eq!(granted, Duration::from_secs(u64::MAX));
        assert!(trust.is_trusted("Coder"));
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(trust.is_trusted("Coder"));
    }

    #[test]
    fn test_untrust() {
        let (_clock, mut trust) = manager();
        trust.trust("Coder", None);
        trust.trust("Architect", None);
        assert_eq!(trust.trusted_agents(), vec!["Architect", "Coder"]);
        assert!(trust.untrust("Coder"));
        assert!(!trust.untrust("Coder"));
        assert!(!trust.is_trusted("Coder"));
        assert!(trust.is_trusted("Architect"));
    }
}
