use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // Story database
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Generation provider endpoints (OpenAI-compatible chat completions)
    #[serde(default = "default_openai_api_url")]
    pub openai_api_url: String,
    #[serde(default = "default_openrouter_api_url")]
    pub openrouter_api_url: String,

    // Provider defaults; the persisted provider_settings row and per-story
    // overrides take precedence over these.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_context_turns")]
    pub context_turns: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8799".to_string()
}

fn default_database_path() -> String {
    "aetheria.db".to_string()
}

fn default_openai_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openrouter_api_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_context_turns() -> u32 {
    20
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            openai_api_url: default_openai_api_url(),
            openrouter_api_url: default_openrouter_api_url(),
            api_key: None,
            default_model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            context_turns: default_context_turns(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl AppConfig {
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

    /// Path to the config file (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("aetheria_config.toml")
    }

    /// Load config from aetheria_config.toml, falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AppConfig>(&contents) {
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

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = env::var("AETHERIA_BIND") {
            if !addr.trim().is_empty() {
                config.bind_addr = addr;
            }
        }

        if let Ok(path) = env::var("AETHERIA_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(url) = env::var("AETHERIA_OPENAI_API_URL") {
            if !url.trim().is_empty() {
                config.openai_api_url = url;
            }
        }

        if let Ok(url) = env::var("AETHERIA_OPENROUTER_API_URL") {
            if !url.trim().is_empty() {
                config.openrouter_api_url = url;
            }
        }

        if let Ok(key) = env::var("AETHERIA_API_KEY") {
            if !key.trim().is_empty() {
                config.api_key = Some(key);
            }
        }

        if let Ok(model) = env::var("AETHERIA_MODEL") {
            if !model.trim().is_empty() {
                config.default_model = model;
            }
        }

        if let Ok(raw) = env::var("AETHERIA_TEMPERATURE") {
            if let Ok(value) = raw.parse() {
                config.temperature = value;
            }
        }

        if let Ok(raw) = env::var("AETHERIA_MAX_TOKENS") {
            if let Ok(value) = raw.parse() {
                config.max_tokens = Some(value);
            }
        }

        if let Ok(raw) = env::var("AETHERIA_CONTEXT_TURNS") {
            if let Ok(value) = raw.parse() {
                config.context_turns = value;
            }
        }

        if let Ok(raw) = env::var("AETHERIA_REQUEST_TIMEOUT_SECS") {
            if let Ok(value) = raw.parse() {
                config.request_timeout_secs = value;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_fills_every_default() {
        let config: AppConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(config.bind_addr, "127.0.0.1:8799");
        assert_eq!(config.database_path, "aetheria.db");
        assert_eq!(config.default_model, "gpt-4o-mini");
        assert_eq!(config.context_turns, 20);
        assert!(config.api_key.is_none());
        assert!(config.max_tokens.is_none());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            default_model = "anthropic/claude-3.5-sonnet"
            context_turns = 8
            "#,
        )
        .expect("partial config parses");
        assert_eq!(config.default_model, "anthropic/claude-3.5-sonnet");
        assert_eq!(config.context_turns, 8);
        assert_eq!(config.openai_api_url, "https://api.openai.com/v1");
        assert_eq!(config.openrouter_api_url, "https://openrouter.ai/api/v1");
    }
}
