//! Runtime knobs and the persisted settings file
//!
//! Two layers, both read once at boot:
//! - `RuntimeConfig` - process-environment knobs (`MAX_TURNS`, `CTX_MSG_SIZE`,
//!   `STREAM_OUTPUT`, `DEBUG_MODE`, `SANDBOX_PROFILE`, `PROXY_URL`)
//! - `Settings` - TOML file with provider tables, defaults, and MCP servers

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::mcp::McpServerConfig;

pub const DEFAULT_MAX_TURNS: usize = 25;
pub const DEFAULT_CTX_MSG_SIZE: usize = 100;
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-environment knobs.
///
/// Only the recognised names are read; anything else in the environment is
/// ignored. Unparseable values fall back to defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_turns: usize,
    pub ctx_msg_size: usize,
    pub stream_output: bool,
    pub debug_mode: bool,
    pub sandbox_profile: Option<String>,
    pub proxy_url: Option<String>,
    /// Bounded timeout for foreground `execute-command` runs.
    pub command_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            ctx_msg_size: DEFAULT_CTX_MSG_SIZE,
            stream_output: true,
            debug_mode: false,
            sandbox_profile: None,
            proxy_url: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    /// Read the recognised knobs from the process environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = read_env("MAX_TURNS") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.max_turns = n;
                }
            }
        }
        if let Some(v) = read_env("CTX_MSG_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.ctx_msg_size = n;
                }
            }
        }
        if let Some(v) = read_env("STREAM_OUTPUT") {
            cfg.stream_output = !v.eq_ignore_ascii_case("no");
        }
        if let Some(v) = read_env("DEBUG_MODE") {
            cfg.debug_mode = v.eq_ignore_ascii_case("yes");
        }
        cfg.sandbox_profile = read_env("SANDBOX_PROFILE");
        cfg.proxy_url = read_env("PROXY_URL");

        cfg
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// One provider table from the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// The `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// Provider name to fall back to when an agent names none (or names one
    /// without an API key).
    #[serde(default)]
    pub use_model: Option<String>,
    /// Identity the runtime announces as itself (complete-tag botname).
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
}

fn default_bot_name() -> String {
    "tandem".to_string()
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            use_model: None,
            bot_name: default_bot_name(),
        }
    }
}

/// Persisted settings (TOML).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub mcp: HashMap<String, McpServerConfig>,
}

impl Settings {
    /// Load settings from an explicit path. A missing file is not an error:
    /// it yields defaults, matching first-run behaviour.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings at {}", path.display()))?;
        let settings = toml::from_str(&raw)
            .with_context(|| format!("invalid settings file at {}", path.display()))?;
        Ok(settings)
    }

    /// Load from the default location under the platform data dir.
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path())
    }

    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tandem")
            .join("settings.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_file_yields_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/tandem/settings.toml"))
            .expect("missing file is not an error");
        assert!(settings.providers.is_empty());
        assert_eq!(settings.defaults.bot_name, "tandem");
    }

    #[test]
    fn settings_parse_providers_and_defaults() {
        let raw = r#"
            [defaults]
            use_model = "local"

            [providers.local]
            base_url = "http://localhost:11434/v1"
            model = "qwen3"

            [providers.openai]
            api_key = "sk-test"
            model = "gpt-4o-mini"
        "#;
        let settings: Settings = toml::from_str(raw).expect("valid settings");
        assert_eq!(settings.defaults.use_model.as_deref(), Some("local"));
        assert_eq!(settings.providers.len(), 2);
        assert_eq!(
            settings.providers["local"].base_url.as_deref(),
            Some("http://localhost:11434/v1")
        );
    }

    #[test]
    fn runtime_config_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_turns, 25);
        assert_eq!(cfg.ctx_msg_size, 100);
        assert!(cfg.stream_output);
        assert!(!cfg.debug_mode);
    }
}
