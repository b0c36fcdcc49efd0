//! Permission engine: decides whether a tool request runs, is refused, or
//! needs the user's confirmation.
//!
//! Decisions are made in a fixed order:
//! - path containment (outside the allowed roots is always denied)
//! - dangerous operations always need confirmation, even under a trust grant
//! - reads are allowed in every mode
//! - an unexpired trust grant allows the rest
//! - finally the mode table (always_ask, trusted, selective)

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::tools::{Operation, ToolRequest};

pub mod batch;
pub mod paths;
pub mod trust;

pub use batch::{BatchChoice, BatchItemResult, BatchItemStatus, BatchReport, PendingOperation};
pub use paths::{is_sensitive, resolve_path};
pub use trust::TrustManager;

/// How much the user is asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    AlwaysAsk,
    #[default]
    Selective,
    Trusted,
}

impl PermissionMode {
    fn strictness(self) -> u8 {
        match self {
            Self::Trusted => 0,
            Self::Selective => 1,
            Self::AlwaysAsk => 2,
        }
    }

    /// The more restrictive of two modes
    pub fn stricter(self, other: Self) -> Self {
        if other.strictness() > self.strictness() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlwaysAsk => write!(f, "always_ask"),
            Self::Selective => write!(f, "selective"),
            Self::Trusted => write!(f, "trusted"),
        }
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always_ask" => Ok(Self::AlwaysAsk),
            "selective" => Ok(Self::Selective),
            "trusted" => Ok(Self::Trusted),
            other => Err(format!(
                "unknown permission mode '{other}' (expected always_ask, selective or trusted)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    Allow,
    Deny,
    NeedsConfirmation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionDecision {
    pub outcome: PermissionOutcome,
    pub reason: String,
}

impl PermissionDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            outcome: PermissionOutcome::Allow,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            outcome: PermissionOutcome::Deny,
            reason: reason.into(),
        }
    }

    pub fn ask(reason: impl Into<String>) -> Self {
        Self {
            outcome: PermissionOutcome::NeedsConfirmation,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == PermissionOutcome::Allow
    }
}

fn default_dangerous() -> Vec<Operation> {
    vec![Operation::Delete, Operation::Chmod, Operation::Move]
}

fn default_trust_minutes() -> u64 {
    30
}

/// Permission settings from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default)]
    pub mode: PermissionMode,
    /// Empty means the session's base directory
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default = "default_dangerous")]
    pub dangerous_operations: Vec<Operation>,
    #[serde(default = "default_trust_minutes")]
    pub trust_minutes: u64,
    #[serde(default)]
    pub batch_mode: bool,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            mode: PermissionMode::default(),
            allowed_paths: Vec::new(),
            dangerous_operations: default_dangerous(),
            trust_minutes: default_trust_minutes(),
            batch_mode: false,
        }
    }
}

/// Asks the user about a request the engine could not decide alone
#[async_trait]
pub trait ConfirmationPort: Send + Sync {
    async fn confirm(&self, agent: &str, request: &ToolRequest, reason: &str) -> bool;
}

/// Approves everything. For tests and non-interactive runs.
pub struct AutoApprove;

#[async_trait]
impl ConfirmationPort for AutoApprove {
    async fn confirm(&self, _agent: &str, _request: &ToolRequest, _reason: &str) -> bool {
        true
    }
}

/// Refuses everything
pub struct AutoDeny;

#[async_trait]
impl ConfirmationPort for AutoDeny {
    async fn confirm(&self, _agent: &str, _request: &ToolRequest, _reason: &str) -> bool {
        false
    }
}

/// Per-session permission state. Owns the trust grants and the pending batch.
pub struct PermissionEngine {
    mode: PermissionMode,
    base_dir: PathBuf,
    allowed_roots: Vec<PathBuf>,
    dangerous: HashSet<Operation>,
    agent_ceilings: HashMap<String, PermissionMode>,
    trust: TrustManager,
    pending: Vec<PendingOperation>,
    batch_mode: bool,
}

impl PermissionEngine {
    pub fn new(config: &PermissionConfig, base_dir: &Path, clock: Arc<dyn Clock>) -> Self {
        let base_dir = base_dir
            .canonicalize()
            .unwrap_or_else(|_| base_dir.to_path_buf());
        let mut engine = Self {
            mode: config.mode,
            base_dir: base_dir.clone(),
            allowed_roots: Vec::new(),
            dangerous: config.dangerous_operations.iter().cloned().collect(),
            agent_ceilings: HashMap::new(),
            trust: TrustManager::new(clock, config.trust_minutes),
            pending: Vec::new(),
            batch_mode: config.batch_mode,
        };
        if config.allowed_paths.is_empty() {
            engine.allowed_roots.push(base_dir);
        } else {
            for path in &config.allowed_paths {
                engine.allow_path(path);
            }
        }
        info!(
            "PermissionEngine: mode={}, roots={:?}",
            engine.mode, engine.allowed_roots
        );
        engine
    }

    /// Add an allowed root. Returns false if it cannot be resolved.
    pub fn allow_path(&mut self, path: &Path) -> bool {
        match resolve_path(path, &self.base_dir) {
            Some(root) => {
                debug!("Allowed root: {}", root.display());
                self.allowed_roots.push(root);
                true
            }
            None => {
                warn!("Ignoring unresolvable allowed path: {}", path.display());
                false
            }
        }
    }

    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PermissionMode) {
        info!("Permission mode: {} -> {}", self.mode, mode);
        self.mode = mode;
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    /// Cap an agent at `mode`; the room mode still applies when stricter
    pub fn set_agent_ceiling(&mut self, agent: &str, mode: Option<PermissionMode>) {
        match mode {
            Some(mode) => {
                self.agent_ceilings.insert(agent.to_string(), mode);
            }
            None => {
                self.agent_ceilings.remove(agent);
            }
        }
    }

    pub fn effective_mode(&self, agent: &str) -> PermissionMode {
        match self.agent_ceilings.get(agent) {
            Some(ceiling) => self.mode.stricter(*ceiling),
            None => self.mode,
        }
    }

    pub fn is_dangerous(&self, operation: &Operation) -> bool {
        self.dangerous.contains(operation)
    }

    pub fn trust(&mut self, agent: &str, minutes: Option<u64>) -> std::time::Duration {
        self.trust.trust(agent, minutes)
    }

    pub fn untrust(&mut self, agent: &str) -> bool {
        self.trust.untrust(agent)
    }

    pub fn is_trusted(&mut self, agent: &str) -> bool {
        self.trust.is_trusted(agent)
    }

    pub fn trust_remaining(&self, agent: &str) -> std::time::Duration {
        self.trust.remaining(agent)
    }

    pub fn trusted_agents(&self) -> Vec<String> {
        self.trust.trusted_agents()
    }

    pub fn batch_mode(&self) -> bool {
        self.batch_mode
    }

    pub fn set_batch_mode(&mut self, on: bool) {
        self.batch_mode = on;
    }

    /// Resolve the request's path (and a move's destination) inside the
    /// allowed roots
    fn contain(&self, request: &ToolRequest) -> Result<PathBuf, PermissionDecision> {
        let resolved = self.contain_path(&request.path)?;
        if request.operation == Operation::Move {
            let dest = request
                .content
                .as_deref()
                .ok_or_else(|| PermissionDecision::deny("move without a destination"))?;
            self.contain_path(Path::new(dest))?;
        }
        Ok(resolved)
    }

    fn contain_path(&self, path: &Path) -> Result<PathBuf, PermissionDecision> {
        let resolved = resolve_path(path, &self.base_dir).ok_or_else(|| {
            PermissionDecision::deny(format!("cannot resolve path '{}'", path.display()))
        })?;
        if !paths::is_within(&resolved, &self.allowed_roots) {
            return Err(PermissionDecision::deny(format!(
                "'{}' is outside the allowed paths",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    /// Decide on one request from `agent`
    pub fn authorize(&mut self, agent: &str, request: &ToolRequest) -> PermissionDecision {
        let decision = self.decide(agent, request);
        match decision.outcome {
            PermissionOutcome::Deny => {
                info!("Denied @{} {}: {}", agent, request, decision.reason)
            }
            _ => debug!(
                "@{} {} -> {:?} ({})",
                agent, request, decision.outcome, decision.reason
            ),
        }
        decision
    }

    fn decide(&mut self, agent: &str, request: &ToolRequest) -> PermissionDecision {
        let resolved = match self.contain(request) {
            Ok(path) => path,
            Err(denied) => return denied,
        };

        if self.is_dangerous(&request.operation) {
            return PermissionDecision::ask(format!(
                "'{}' is a dangerous operation",
                request.operation
            ));
        }

        let exists = resolved.exists();
        let operation = match &request.operation {
            Operation::List | Operation::Search => Operation::Read,
            Operation::Create if exists => Operation::Write,
            Operation::Write if !exists => Operation::Create,
            other => other.clone(),
        };

        if operation == Operation::Read {
            return PermissionDecision::allow("read inside allowed paths");
        }

        if self.trust.is_trusted(agent) {
            return PermissionDecision::allow(format!("@{agent} is trusted"));
        }

        match self.effective_mode(agent) {
            PermissionMode::AlwaysAsk => PermissionDecision::ask("always_ask mode"),
            PermissionMode::Trusted => PermissionDecision::allow("trusted mode"),
            PermissionMode::Selective => match operation {
                Operation::Create => PermissionDecision::allow("new file"),
                Operation::Write if is_sensitive(&resolved) => {
                    PermissionDecision::ask("write to a sensitive file")
                }
                Operation::Write => PermissionDecision::allow("write to an existing file"),
                other => PermissionDecision::ask(format!("'{other}' needs confirmation")),
            },
        }
    }
}
