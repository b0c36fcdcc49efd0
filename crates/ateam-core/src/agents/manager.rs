//! Agent manager: name lookup, default agent and nearest-name suggestions

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::profile::AgentProfile;

/// Holds every configured agent plus the room default
#[derive(Debug, Clone)]
pub struct AgentManager {
    profiles: HashMap<String, AgentProfile>,
    default_agent: String,
}

impl AgentManager {
    /// Create a manager whose default agent is `default_profile`
    pub fn new(default_profile: AgentProfile) -> Self {
        let default_agent = default_profile.name.clone();
        let mut profiles = HashMap::new();
        profiles.insert(default_agent.clone(), default_profile);
        info!("AgentManager: initialized with default agent '{}'", default_agent);
        Self {
            profiles,
            default_agent,
        }
    }

    /// Build from a list of profiles; `default` must name one of them
    pub fn from_profiles(profiles: Vec<AgentProfile>, default: &str) -> Option<Self> {
        let default_profile = profiles.iter().find(|p| p.name == default)?.clone();
        let mut manager = Self::new(default_profile);
        for profile in profiles {
            if profile.name != default {
                manager.add_profile(profile);
            }
        }
        Some(manager)
    }

    pub fn add_profile(&mut self, profile: AgentProfile) {
        info!(
            "AgentManager: added agent '{}' ({}/{})",
            profile.name, profile.provider, profile.model
        );
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    /// Switch the default agent. Returns false if `name` is unknown.
    pub fn set_default(&mut self, name: &str) -> bool {
        if !self.contains(name) {
            warn!("AgentManager: cannot make unknown agent '{}' the default", name);
            return false;
        }
        self.default_agent = name.to_string();
        true
    }

    /// Closest configured name by case-insensitive edit distance.
    /// Ties go to the alphabetically first name.
    pub fn suggest(&self, name: &str) -> Option<String> {
        let needle = name.to_lowercase();
        let best = self
            .profiles
            .keys()
            .map(|candidate| (levenshtein(&needle, &candidate.to_lowercase()), candidate))
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(_, candidate)| candidate.clone());
        debug!("AgentManager: suggestion for '{}' is {:?}", name, best);
        best
    }

    /// Agent names, sorted
    pub fn list_agents(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn count(&self) -> usize {
        self.profiles.len()
    }
}

/// Classic two-row Levenshtein distance over chars
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
