//! Configuration loading, validation, and management for agentchain.
//!
//! Loads configuration from `~/.agentchain/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.agentchain/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Entity store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Scheduler and tick tuning
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Agents registered at startup
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConfig>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .field("orchestrator", &self.orchestrator)
            .field("providers", &self.providers)
            .field("agents", &self.agents)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `sqlite` or `memory`
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// SQLite database file (relative paths resolve against the config dir)
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_backend() -> String {
    "sqlite".into()
}
fn default_store_path() -> String {
    "chains.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// The sqlx connection string for the configured path.
    pub fn database_url(&self) -> String {
        if self.path.starts_with("sqlite:") {
            return self.path.clone();
        }
        let path = Path::new(&self.path);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            AppConfig::config_dir().join(path)
        };
        format!("sqlite://{}", resolved.display())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    4002
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay between ticks
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Completion requests in flight at once during dispatch
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,

    /// Upper bound on a single completion request
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,

    /// A chain left in `llm_processing` longer than this is reclaimed
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,

    /// Consecutive completion failures before a chain is given up on
    #[serde(default = "default_max_dispatch_attempts")]
    pub max_dispatch_attempts: u32,

    /// First retry delay; doubles per failure
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Deepest allowed delegation chain (root = 0)
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,
}

fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_max_concurrent_dispatches() -> usize {
    4
}
fn default_completion_timeout_secs() -> u64 {
    120
}
fn default_claim_timeout_secs() -> u64 {
    300
}
fn default_max_dispatch_attempts() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    2000
}
fn default_max_delegation_depth() -> usize {
    8
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            completion_timeout_secs: default_completion_timeout_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
            max_dispatch_attempts: default_max_dispatch_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_delegation_depth: default_max_delegation_depth(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,

    pub system_prompt: String,

    /// Local tools by name
    #[serde(default)]
    pub tools: Vec<String>,

    /// Agents this one may delegate to
    #[serde(default)]
    pub delegates: Vec<String>,

    /// Shown to agents delegating to this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The built-in pair: a calculator operator and a manager that delegates to it.
pub fn default_agents() -> Vec<AgentConfig> {
    vec![
        AgentConfig {
            name: "calculator_operator".into(),
            system_prompt: "You are a skilled calculator operator".into(),
            tools: vec!["add".into()],
            delegates: vec![],
            description: Some(
                "a skilled calculator operator that can perform various arithmetic operations"
                    .into(),
            ),
        },
        AgentConfig {
            name: "project_manager".into(),
            system_prompt: "You are a project manager and assistant that can delegate tasks to other agents to accomplish a goal.\n\nalways keep delegated tasks as small as possible".into(),
            tools: vec![],
            delegates: vec!["calculator_operator".into()],
            description: Some(
                "a project manager that can delegate tasks to other agents to accomplish a goal"
                    .into(),
            ),
        },
    ]
}

impl AppConfig {
    /// Load configuration from the default path (~/.agentchain/config.toml).
    ///
    /// Environment overrides:
    /// - `AGENTCHAIN_API_KEY`, then `OPENAI_API_KEY`
    /// - `AGENTCHAIN_PROVIDER`, `AGENTCHAIN_MODEL`, `AGENTCHAIN_DB`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = var("AGENTCHAIN_API_KEY").or_else(|| var("OPENAI_API_KEY"));
        }
        if let Some(provider) = var("AGENTCHAIN_PROVIDER") {
            self.default_provider = provider;
        }
        if let Some(model) = var("AGENTCHAIN_MODEL") {
            self.default_model = model;
        }
        if let Some(path) = var("AGENTCHAIN_DB") {
            self.store.path = path;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".agentchain")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if !matches!(self.store.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "unknown store backend '{}' (expected sqlite or memory)",
                self.store.backend
            )));
        }

        let orch = &self.orchestrator;
        if orch.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.tick_interval_ms must be > 0".into(),
            ));
        }
        if orch.max_concurrent_dispatches == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_concurrent_dispatches must be >= 1".into(),
            ));
        }
        if orch.max_dispatch_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_dispatch_attempts must be >= 1".into(),
            ));
        }

        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(ConfigError::ValidationError("agent name must not be empty".into()));
            }
            if !names.insert(agent.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate agent '{}'",
                    agent.name
                )));
            }
        }
        for agent in &self.agents {
            if let Some(missing) = agent.delegates.iter().find(|d| !names.contains(d.as_str())) {
                return Err(ConfigError::ValidationError(format!(
                    "agent '{}' delegates to unknown agent '{missing}'",
                    agent.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            providers: HashMap::new(),
            agents: default_agents(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
