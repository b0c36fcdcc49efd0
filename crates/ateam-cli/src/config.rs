use anyhow::{Context, Result, bail};
use ateam_core::{AgentManager, AgentProfile, DispatcherConfig, PermissionConfig, RateLimit};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AteamConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub permissions: PermissionConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Per-provider limits, merged over the built-in defaults
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_agent")]
    pub default_agent: String,
    #[serde(default = "default_rooms_dir")]
    pub rooms_dir: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

fn default_agent() -> String {
    "Architect".to_string()
}

fn default_rooms_dir() -> String {
    "~/.ateam/rooms".to_string()
}

fn default_workspace() -> String {
    ".".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_agent: default_agent(),
            rooms_dir: default_rooms_dir(),
            workspace: default_workspace(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ateam")
}

impl AteamConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Refuse group/other-readable config files (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    bail!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    );
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `ateam init` first.",
                path.display()
            )
        })?;

        Self::parse(&content).with_context(|| format!("Invalid config at {}", path.display()))
    }

    /// Expand allowlisted `${VAR}` references, parse and validate
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            bail!("No agents configured; add at least one [[agents]] table");
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !AgentProfile::is_valid_name(&agent.name) {
                bail!(
                    "Invalid agent name '{}': use letters, digits, '-' and '_'",
                    agent.name
                );
            }
            if !seen.insert(agent.name.as_str()) {
                bail!("Agent '{}' is configured twice", agent.name);
            }
        }
        if !seen.contains(self.general.default_agent.as_str()) {
            bail!(
                "default_agent '{}' is not one of the configured agents",
                self.general.default_agent
            );
        }
        for (key, limit) in &self.rate_limits {
            if limit.limit == 0 || limit.window_secs == 0 {
                bail!("Rate limit for '{}' needs a non-zero limit and window", key);
            }
        }
        Ok(())
    }

    pub fn agent_manager(&self) -> Result<AgentManager> {
        AgentManager::from_profiles(self.agents.clone(), &self.general.default_agent)
            .with_context(|| format!("Unknown default agent '{}'", self.general.default_agent))
    }

    pub fn rooms_dir(&self) -> PathBuf {
        shellexpand(&self.general.rooms_dir)
    }

    pub fn workspace(&self) -> PathBuf {
        shellexpand(&self.general.workspace)
    }
}

pub fn shellexpand(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(s)
}

/// Environment variables that may be expanded in config files
const ALLOWED_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GOOGLE_API_KEY",
    "GEMINI_API_KEY",
    "OLLAMA_HOST",
    "ATEAM_HOME",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while let Some(start) = result[pos..].find("${") {
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}
