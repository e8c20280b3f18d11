use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::executor::RetryPolicy;
use crate::orchestrator::OrchestratorOptions;
use crate::outcome::MissingMarker;
use crate::transport::StdioTransport;

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_RETRIES: u32 = 4;
pub const DEFAULT_RETRY_BACKOFF_SECS: f64 = 2.0;
pub const DEFAULT_WORKERS: usize = 4;
pub const SANDBOX_SERVER_BIN: &str = "kb-sandbox-server";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub base_instructions: String,
    pub workers: usize,
    pub missing_marker: MissingMarker,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_instructions: String::new(),
            workers: DEFAULT_WORKERS,
            missing_marker: MissingMarker::Error,
            llm: LlmConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_secs: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_secs: DEFAULT_RETRY_BACKOFF_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub root: PathBuf,
    /// Defaults to the sandbox server binary installed next to this one.
    pub server_command: Option<PathBuf>,
    pub server_args: Vec<String>,
    pub command_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("sandbox"),
            server_command: None,
            server_args: Vec::new(),
            command_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl OrchestratorConfig {
    /// Reads `path` when given and present, then applies `KB_*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            _ => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies overrides from `lookup`; unparsable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("KB_API_KEY") {
            self.llm.api_key = value;
        }
        if let Some(value) = lookup("KB_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = lookup("KB_BASE_INSTRUCTIONS") {
            self.base_instructions = value;
        }
        if let Some(value) = lookup("KB_SANDBOX_DIR").filter(|v| !v.trim().is_empty()) {
            self.sandbox.root = PathBuf::from(value);
        }
        if let Some(value) = parse_override(&lookup, "KB_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = value;
        }
        if let Some(value) = parse_override(&lookup, "KB_LLM_MAX_RETRIES") {
            self.llm.max_retries = value;
        }
        if let Some(value) = parse_override::<f64>(&lookup, "KB_LLM_RETRY_BACKOFF_SECS") {
            self.llm.retry_backoff_secs = value;
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = Duration::try_from_secs_f64(self.llm.retry_backoff_secs.max(0.0))
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_RETRY_BACKOFF_SECS));
        RetryPolicy {
            timeout: Duration::from_secs(self.llm.timeout_secs.max(1)),
            max_retries: self.llm.max_retries,
            backoff,
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            workers: self.workers.max(1),
            missing_marker: self.missing_marker,
            api_key: self.llm.api_key.clone(),
            model: self.llm.model.clone(),
        }
    }

    pub fn server_command(&self) -> PathBuf {
        if let Some(command) = &self.sandbox.server_command {
            return command.clone();
        }
        env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(SANDBOX_SERVER_BIN)))
            .filter(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from(SANDBOX_SERVER_BIN))
    }

    pub fn transport(&self) -> StdioTransport {
        let mut args = self.sandbox.server_args.clone();
        args.push("--root".into());
        args.push(self.sandbox.root.display().to_string());
        args.push("--command-timeout-secs".into());
        args.push(self.sandbox.command_timeout_secs.to_string());
        StdioTransport::new(self.server_command(), args)
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid numeric override");
            None
        }
    }
}
