use config::{Config as ConfigLoader, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::io::Write;
use std::time::Duration;
use anyhow::{Result, anyhow};
use home::home_dir;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub database_path: String,
    pub log_level: String,
    /// Directory for the rolling log file; `None` means the XDG state dir.
    pub log_dir: Option<String>,
    /// Upper bound on turns handed to the backend as context.
    pub history_context_limit: u32,
    pub heartbeat: HeartbeatConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub threshold_secs: u64,
    pub check_interval_ms: u64,
}

impl HeartbeatConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    /// "provider/model", e.g. "ollama/llama3.2" or "openai/gpt-4o-mini".
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key. Read again on
    /// every client rebuild so rotated credentials are picked up.
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl Config {
    pub fn save(&self) -> Result<()> {
        let config_dir = get_config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        let config_path = config_dir.join("config.toml");
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        let mut file = std::fs::File::create(&config_path)?;
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database_path)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            database_path: "~/.local/share/chatwire/chat.db".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            history_context_limit: 500,
            heartbeat: HeartbeatConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            threshold_secs: 25,
            check_interval_ms: 1000,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model: "ollama/llama3.2".to_string(),
            base_url: "http://localhost:11434".to_string(),
            api_key_env: None,
            temperature: 0.5,
            system_prompt: Some(
                "You are a professional, concise assistant. Prefer step-by-step clarity.".to_string(),
            ),
        }
    }
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir()?;
    std::fs::create_dir_all(&config_dir)?;

    let config_path = config_dir.join("config.toml");

    if !config_path.exists() {
        Config::default().save()?;
        tracing::info!("Created default config at {:?}", config_path);
    }

    let builder = ConfigLoader::builder()
        .add_source(File::from(config_path))
        .add_source(
            Environment::with_prefix("CHATWIRE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = builder.try_deserialize()?;
    Ok(config)
}

pub fn get_config_dir() -> Result<PathBuf> {
    let home = home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".config").join("chatwire"))
}

pub fn expand_path(path: &str) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = home_dir() {
            if path == "~" {
                return home;
            }
            if let Some(rest) = path.strip_prefix("~/") {
                return home.join(rest);
            }
        }
    }
    PathBuf::from(path)
}
