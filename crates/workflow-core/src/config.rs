//! Daemon configuration parsing: the `key=value` file read from
//! `<repo>/.kanban-orchestrator/config` plus `WORKFLOW_`-prefixed env overrides.
//!
//! Precedence: env override > config file > defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Controls how much of the skill-session surface is faked out for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    None,
    Selective,
    Full,
}

/// External services `mock_mode=full` fakes out for every session regardless
/// of `mock_services`; `selective` fakes out only the ones named there.
const KNOWN_MOCK_SERVICES: &[&str] = &["CODE_HOST", "JIRA"];

/// `MOCK_<SERVICE>=true` entries for the given mode/chosen-service set,
/// shared by `DaemonConfig::mock_env_vars` and the orchestrator's own spawn
/// path (which carries `mock_mode`/`mock_services` without a whole `DaemonConfig`).
pub fn mock_env_vars_for(mode: MockMode, services: &[String]) -> Vec<(String, String)> {
    let services: Vec<&str> = match mode {
        MockMode::None => return Vec::new(),
        MockMode::Full => KNOWN_MOCK_SERVICES.to_vec(),
        MockMode::Selective => services.iter().map(String::as_str).collect(),
    };
    services
        .into_iter()
        .map(|service| (format!("MOCK_{service}"), "true".to_string()))
        .collect()
}

/// Daemon-level orchestrator settings (distinct from the pipeline config, which
/// is loaded separately from `.kanban-workflow.yaml` via `workflow_core::pipeline`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub repo_path: PathBuf,
    pub max_parallel: u32,
    pub idle_seconds: u32,
    pub log_dir: PathBuf,
    pub model: String,
    pub verbose: bool,
    pub once: bool,
    pub mock_mode: MockMode,
    /// Services to fake out when `mock_mode=selective` (uppercased service
    /// names, e.g. `CODE_HOST`). Ignored when `mock_mode` is `none` or `full`.
    pub mock_services: Vec<String>,
    pub drain_timeout_ms: u64,
    pub graceful_kill_timeout_ms: u64,
    pub db_path: PathBuf,
    /// The worker CLI the session executor spawns for each actor-phase stage.
    pub session_binary: String,
    /// `0` disables the per-session timeout.
    pub session_timeout_sec: u32,
    pub base_branch: String,
    /// Platform tag passed to the code-host adapter factory (e.g. `"github"`,
    /// `"gitlab"`). Unrecognized or empty falls back to a null-object host.
    pub code_host_platform: String,
    /// Variables with this prefix are forwarded verbatim into worker sessions.
    /// Only `WORKFLOW_`-prefixed vars cross this boundary.
    pub workflow_env: BTreeMap<String, String>,
    pub jira_confirm: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            max_parallel: 1,
            idle_seconds: 10,
            log_dir: PathBuf::from(".kanban-logs"),
            model: "opus".to_string(),
            verbose: false,
            once: false,
            mock_mode: MockMode::None,
            mock_services: Vec::new(),
            drain_timeout_ms: 60_000,
            graceful_kill_timeout_ms: 5_000,
            db_path: PathBuf::from(".kanban-orchestrator/store.sqlite"),
            session_binary: "kanban-session".to_string(),
            session_timeout_sec: 1800,
            base_branch: "main".to_string(),
            code_host_platform: String::new(),
            workflow_env: BTreeMap::new(),
            jira_confirm: false,
        }
    }
}

const ENV_PREFIX: &str = "WORKFLOW_";

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            self.apply_value(key.trim(), &Self::unquote(value.trim()))?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "repo_path" => self.repo_path = PathBuf::from(value),
            "max_parallel" => self.max_parallel = Self::parse_int(key, value)?,
            "idle_seconds" => self.idle_seconds = Self::parse_int(key, value)?,
            "log_dir" => self.log_dir = PathBuf::from(value),
            "model" => self.model = value.to_string(),
            "verbose" => self.verbose = Self::parse_bool(key, value)?,
            "once" => self.once = Self::parse_bool(key, value)?,
            "mock_mode" => {
                self.mock_mode = match value {
                    "none" => MockMode::None,
                    "selective" => MockMode::Selective,
                    "full" => MockMode::Full,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "mock_mode must be 'none', 'selective', or 'full', got '{value}'"
                        )))
                    }
                }
            }
            "mock_services" => {
                self.mock_services = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_uppercase())
                    .collect();
            }
            "drain_timeout_ms" => self.drain_timeout_ms = Self::parse_int(key, value)?,
            "graceful_kill_timeout_ms" => {
                self.graceful_kill_timeout_ms = Self::parse_int(key, value)?;
            }
            "db_path" => self.db_path = PathBuf::from(value),
            "session_binary" => self.session_binary = value.to_string(),
            "session_timeout_sec" => self.session_timeout_sec = Self::parse_int(key, value)?,
            "base_branch" => self.base_branch = value.to_string(),
            "jira_confirm" => self.jira_confirm = Self::parse_bool(key, value)?,
            _ => {
                eprintln!("warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Apply `WORKFLOW_`-prefixed env vars: capture everything into
    /// `workflow_env` (forwarded verbatim into worker sessions), and additionally
    /// honor the two orchestrator-special names.
    pub fn apply_env<I: IntoIterator<Item = (String, String)>>(&mut self, env: I) {
        for (key, value) in env {
            if let Some(suffix) = key.strip_prefix(ENV_PREFIX) {
                self.workflow_env.insert(key.clone(), value.clone());
                match suffix {
                    "MAX_PARALLEL" => {
                        if let Ok(n) = value.parse() {
                            self.max_parallel = n;
                        }
                    }
                    "JIRA_CONFIRM" => {
                        if let Ok(b) = Self::parse_bool("WORKFLOW_JIRA_CONFIRM", &value) {
                            self.jira_confirm = b;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// `MOCK_<SERVICE>=true` entries to forward into a spawned session's
    /// environment per spec Section 6: `full` mocks every known service,
    /// `selective` mocks only the chosen ones, `none` yields nothing.
    pub fn mock_env_vars(&self) -> Vec<(String, String)> {
        mock_env_vars_for(self.mock_mode, &self.mock_services)
    }

    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.log_dir.is_relative() {
            self.log_dir = workspace_root.join(&self.log_dir);
        }
        if self.db_path.is_relative() {
            self.db_path = workspace_root.join(&self.db_path);
        }
    }
}
