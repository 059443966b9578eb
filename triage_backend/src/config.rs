use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::prompt::DEFAULT_SYSTEM_PROMPT;

pub const CONFIG_FILE_NAME: &str = "triage_config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageConfig {
    // Model endpoint (OpenAI-compatible)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    /// When false the tool registry is not sent; only `[SEARCH: ...]` works.
    #[serde(default = "default_true")]
    pub supports_tool_calls: bool,
    #[serde(default = "default_true")]
    pub directive_fallback: bool,
    /// Also attach the image inline to the user message.
    #[serde(default)]
    pub inline_image: bool,

    // Remote tool server
    #[serde(default = "default_tool_server_url")]
    pub tool_server_url: String,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "default".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_llm_timeout_secs() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

fn default_tool_server_url() -> String {
    "https://med-mcp.fastmcp.app".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_max_turns() -> usize {
    5
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            llm_timeout_secs: default_llm_timeout_secs(),
            supports_tool_calls: true,
            directive_fallback: true,
            inline_image: false,
            tool_server_url: default_tool_server_url(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_turns: default_max_turns(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}

impl TriageConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Load config from triage_config.toml (next to executable), falling back to defaults + env
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if let Ok(contents) = fs::read_to_string(path) {
            match toml::from_str::<TriageConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` yields for each known key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Some(model) = lookup("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Some(key) = lookup("LLM_API_KEY") {
            if !key.trim().is_empty() {
                config.llm_api_key = Some(key);
            }
        }

        if let Some(temperature) = lookup("LLM_TEMPERATURE") {
            if let Ok(value) = temperature.parse() {
                config.temperature = value;
            }
        }

        if let Some(timeout) = lookup("LLM_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                config.llm_timeout_secs = seconds;
            }
        }

        if let Some(enabled) = lookup("LLM_SUPPORTS_TOOL_CALLS") {
            config.supports_tool_calls = parse_flag(&enabled);
        }

        if let Some(url) = lookup("MCP_SERVER_URL") {
            if !url.trim().is_empty() {
                config.tool_server_url = url;
            }
        }

        if let Some(timeout) = lookup("TOOL_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                config.tool_timeout_secs = seconds;
            }
        }

        if let Some(turns) = lookup("TRIAGE_MAX_TURNS") {
            if let Ok(turns) = turns.parse::<usize>() {
                config.max_turns = turns.max(1);
            }
        }

        config
    }
}
