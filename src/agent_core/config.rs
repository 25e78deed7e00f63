//! Agent configuration loading and validation.
//!
//! Reads `toolstream.yaml` and resolves environment variables. Every section
//! is optional; a missing file means all defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::AgentError;
use super::governor::GovernorConfig;
use crate::stream::config::TransportConfig;

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "toolstream.yaml";

/// Env var holding an explicit config file path.
pub const CONFIG_ENV_VAR: &str = "TOOLSTREAM_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `toolstream.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub turn: TurnLoopConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Turn loop limits.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnLoopConfig {
    /// Maximum request/tool round trips for one user turn.
    #[serde(default = "default_max_round_trips")]
    pub max_round_trips: usize,
    /// Retries for a request that failed before its first event.
    #[serde(default = "default_max_transport_retries")]
    pub max_transport_retries: u32,
    /// When `false`, requests go out without asking the rate governor.
    #[serde(default = "default_true")]
    pub honor_admission: bool,
}

/// Tool execution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// How long a cancelled tool may take to wind down.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Tool output beyond this many bytes is truncated before it reaches the model.
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    /// Optional allowlist of tool names to expose to the model.
    ///
    /// Default: `None` (every registered tool is exposed).
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
    /// Log file path; logs go to stderr when unset.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_max_round_trips() -> usize {
    25
}
fn default_max_transport_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_call_timeout_secs() -> u64 {
    120
}
fn default_cancel_grace_ms() -> u64 {
    2_000
}
fn default_max_result_chars() -> usize {
    30_000
}
fn default_log_filter() -> String {
    "toolstream=info,warn".into()
}

impl Default for TurnLoopConfig {
    fn default() -> Self {
        Self {
            max_round_trips: default_max_round_trips(),
            max_transport_retries: default_max_transport_retries(),
            honor_admission: true,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
            max_result_chars: default_max_result_chars(),
            enabled_tools: None,
        }
    }
}

impl ToolsConfig {
    /// The allowlist as a set, if one is configured.
    pub fn enabled_set(&self) -> Option<HashSet<String>> {
        self.enabled_tools
            .as_ref()
            .map(|names| names.iter().cloned().collect())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Log file path with a leading `~` expanded.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.file.as_deref().map(|f| PathBuf::from(expand_tilde(f)))
    }
}

impl AgentConfig {
    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<(), AgentError> {
        self.transport.validate()?;
        self.governor.validate()?;
        if self.turn.max_round_trips == 0 {
            return Err(AgentError::Config {
                reason: "turn.max_round_trips must be at least 1".into(),
            });
        }
        if self.tools.call_timeout_secs == 0 {
            return Err(AgentError::Config {
                reason: "tools.call_timeout_secs must be positive".into(),
            });
        }
        if self.tools.max_result_chars == 0 {
            return Err(AgentError::Config {
                reason: "tools.max_result_chars must be positive".into(),
            });
        }
        if self.logging.filter.trim().is_empty() {
            return Err(AgentError::Config {
                reason: "logging.filter must not be empty".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `TOOLSTREAM_CONFIG` wins when it names an existing file; otherwise searches
/// upward from `start` for `toolstream.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, AgentError> {
    let explicit = std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from);
    find_config_path_from(start, explicit)
}

fn find_config_path_from(start: &Path, explicit: Option<PathBuf>) -> Result<PathBuf, AgentError> {
    // 1. Explicit path
    if let Some(candidate) = explicit {
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not name a file, searching instead");
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(AgentError::Config {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load, interpolate, parse and validate a config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<AgentConfig, AgentError> {
    let raw = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);
    let config: AgentConfig = if interpolated.trim().is_empty() {
        AgentConfig::default()
    } else {
        serde_yaml::from_str(&interpolated)?
    };

    config.validate()?;
    tracing::info!(path = %path.display(), model = %config.transport.model, "loaded config");
    Ok(config)
}

/// Find and load the config, falling back to defaults when there is no file.
pub fn discover_config(start: &Path) -> Result<AgentConfig, AgentError> {
    match find_config_path(start) {
        Ok(path) => load_config(&path),
        Err(_) => {
            tracing::info!(start = %start.display(), "no {CONFIG_FILE_NAME} found, using defaults");
            Ok(AgentConfig::default())
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. An empty value counts as unset.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
