//! Configuration.
//!
//! One TOML file, looked up as `./wilson.toml` then
//! `<config_dir>/wilson/config.toml`. Every section has defaults; an absent
//! file is a fully-defaulted config, and unknown keys are ignored so old
//! configs survive upgrades.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::agent::compactor::CompactionConfig;
use crate::agent::controller::{LoopConfig, MAX_ITERATIONS};
use crate::agent::hooks::UserHook;
use crate::swarm::orchestrator::SwarmConfig;
use crate::tools::permissions::{PermissionPolicy, PermissionRule};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WilsonConfig {
    pub model: String,
    pub backend_url: String,
    /// Usually left unset; the `WILSON_API_KEY` env var wins.
    pub api_key: Option<String>,
    pub agent: AgentSection,
    pub permissions: PermissionsSection,
    pub hooks: Vec<UserHook>,
    pub swarm: SwarmSection,
}

impl Default for WilsonConfig {
    fn default() -> Self {
        Self {
            model: "wilson-large".to_string(),
            backend_url: "http://localhost:8787/v1/chat".to_string(),
            api_key: None,
            agent: AgentSection::default(),
            permissions: PermissionsSection::default(),
            hooks: Vec::new(),
            swarm: SwarmSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    pub history_window: usize,
    pub compaction_threshold_tokens: usize,
    pub keep_recent_turns: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        let compaction = CompactionConfig::default();
        Self {
            max_iterations: MAX_ITERATIONS,
            history_window: 40,
            compaction_threshold_tokens: compaction.threshold_tokens,
            keep_recent_turns: compaction.keep_recent_turns,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PermissionsSection {
    pub default: PermissionRule,
    pub rules: Vec<PermissionPattern>,
}

impl Default for PermissionsSection {
    fn default() -> Self {
        Self {
            default: PermissionRule::Allow,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionPattern {
    pub pattern: String,
    pub rule: PermissionRule,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwarmSection {
    pub dir_name: String,
    pub workers: usize,
    pub max_retries: u32,
}

impl Default for SwarmSection {
    fn default() -> Self {
        let config = SwarmConfig::default();
        Self {
            dir_name: config.dir_name,
            workers: config.workers,
            max_retries: config.max_retries,
        }
    }
}

impl WilsonConfig {
    /// `./wilson.toml`, then the user config dir, then defaults.
    pub fn load(working_dir: &Path) -> Result<Self> {
        let local = working_dir.join("wilson.toml");
        if local.exists() {
            return Self::from_file(&local);
        }
        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("wilson").join("config.toml");
            if user.exists() {
                return Self::from_file(&user);
            }
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var("WILSON_API_KEY")
            .ok()
            .or_else(|| self.api_key.clone())
    }

    pub fn loop_config(&self, working_dir: PathBuf) -> LoopConfig {
        LoopConfig {
            max_iterations: self.agent.max_iterations,
            history_window: self.agent.history_window,
            working_dir,
            compaction: CompactionConfig {
                threshold_tokens: self.agent.compaction_threshold_tokens,
                keep_recent_turns: self.agent.keep_recent_turns,
            },
        }
    }

    pub fn permission_policy(&self) -> Result<PermissionPolicy> {
        let patterns: Vec<(String, PermissionRule)> = self
            .permissions
            .rules
            .iter()
            .map(|r| (r.pattern.clone(), r.rule))
            .collect();
        PermissionPolicy::new(&patterns, self.permissions.default)
    }

    pub fn swarm_config(&self) -> SwarmConfig {
        SwarmConfig {
            dir_name: self.swarm.dir_name.clone(),
            workers: self.swarm.workers,
            max_retries: self.swarm.max_retries,
        }
    }
}
