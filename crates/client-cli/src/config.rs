use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use shared::{ConnectionConfig, ConnectionMode, EmailConfig, SslMode};
use std::path::PathBuf;

const DEFAULT_API_BASE: &str = "http://localhost:8000";
const DEFAULT_APP_URL: &str = "http://localhost:5173";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Analysis service base URL, also used to build artifact links
    pub base_url: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Auth project URL (GoTrue + PostgREST)
    pub url: Option<String>,
    pub anon_key: Option<String>,
    /// Web app URL used for email confirmation and password reset links
    pub app_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            app_url: DEFAULT_APP_URL.to_string(),
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "multiagent", "multiagent")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = Self::project_dirs()?;

        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    /// Directory for the persistent key-value store
    pub fn data_dir() -> Result<PathBuf> {
        let proj_dirs = Self::project_dirs()?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        Ok(data_dir.to_path_buf())
    }

    /// Load the effective config: file values with environment overrides applied.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load only what is on disk. Use this before `save` so environment
    /// overrides are never written back.
    pub fn load_file() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Environment variables win over the config file.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("MULTIAGENT_API_BASE_URL") {
            self.service.base_url = url;
        }
        if let Some(url) = var("MULTIAGENT_AUTH_URL") {
            self.auth.url = Some(url);
        }
        if let Some(key) = var("MULTIAGENT_AUTH_ANON_KEY") {
            self.auth.anon_key = Some(key);
        }
        if let Some(url) = var("MULTIAGENT_APP_URL") {
            self.auth.app_url = url;
        }
    }

    /// Set a value by its `config set` key.
    pub fn set(&mut self, key: &str, value: String) -> Result<()> {
        match key {
            "server" => self.service.base_url = value,
            "auth_url" => self.auth.url = Some(value),
            "anon_key" => self.auth.anon_key = Some(value),
            "app_url" => self.auth.app_url = value,
            "use_env" => self.connection.use_env = parse_bool(&value)?,
            "mode" => self.connection.mode = value.parse::<ConnectionMode>().map_err(anyhow::Error::msg)?,
            "dsn" => self.connection.dsn = value,
            "host" => self.connection.host = value,
            "port" => self.connection.port = value,
            "name" => self.connection.name = value,
            "user" => self.connection.user = value,
            "password" => self.connection.password = value,
            "sslmode" => self.connection.sslmode = value.parse::<SslMode>().map_err(anyhow::Error::msg)?,
            "table" => self.connection.table = value,
            "email_use_env" => self.email.use_env = parse_bool(&value)?,
            "email_from" => self.email.from = value,
            "email_to" => self.email.to = value,
            "email_key" => self.email.api_key = value,
            _ => anyhow::bail!("Unknown config key: {}. Valid keys: {}", key, KEYS.join(", ")),
        }
        Ok(())
    }

    /// Display value for a key; secrets are masked.
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "server" => self.service.base_url.clone(),
            "auth_url" => self.auth.url.clone().unwrap_or_default(),
            "anon_key" => mask(self.auth.anon_key.as_deref().unwrap_or_default()),
            "app_url" => self.auth.app_url.clone(),
            "use_env" => self.connection.use_env.to_string(),
            "mode" => format!("{:?}", self.connection.mode).to_lowercase(),
            "dsn" => mask(&self.connection.dsn),
            "host" => self.connection.host.clone(),
            "port" => self.connection.port.clone(),
            "name" => self.connection.name.clone(),
            "user" => self.connection.user.clone(),
            "password" => mask(&self.connection.password),
            "sslmode" => self.connection.sslmode.as_str().to_string(),
            "table" => self.connection.table.clone(),
            "email_use_env" => self.email.use_env.to_string(),
            "email_from" => self.email.from.clone(),
            "email_to" => self.email.to.clone(),
            "email_key" => mask(&self.email.api_key),
            _ => anyhow::bail!("Unknown config key: {}", key),
        };
        Ok(value)
    }
}

pub const KEYS: [&str; 18] = [
    "server",
    "auth_url",
    "anon_key",
    "app_url",
    "use_env",
    "mode",
    "dsn",
    "host",
    "port",
    "name",
    "user",
    "password",
    "sslmode",
    "table",
    "email_use_env",
    "email_from",
    "email_to",
    "email_key",
];

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => anyhow::bail!("Expected a boolean (true/false), got: {}", value),
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "****".to_string()
    }
}
