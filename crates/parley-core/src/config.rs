//! Configuration management for parley.
//!
//! Loads configuration from ${PARLEY_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable that overrides `base_url`.
pub const BASE_URL_ENV: &str = "PARLEY_BASE_URL";
/// Environment variable consulted when `session_token` is unset.
pub const SESSION_TOKEN_ENV: &str = "PARLEY_SESSION_TOKEN";

fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for parley configuration.
    //!
    //! PARLEY_HOME resolution order:
    //! 1. PARLEY_HOME environment variable (if set)
    //! 2. ~/.config/parley (default)
    //! 3. ./.parley when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the parley home directory.
    pub fn parley_home() -> PathBuf {
        if let Ok(home) = std::env::var("PARLEY_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".parley"),
            |h| h.join(".config").join("parley"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        parley_home().join("config.toml")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Origin of the agent backend, e.g. `http://localhost:3000`.
    pub base_url: String,
    pub api_prefix: String,
    /// Cookie that carries `session_token`.
    pub cookie_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            api_prefix: Self::DEFAULT_API_PREFIX.to_string(),
            cookie_name: Self::DEFAULT_COOKIE_NAME.to_string(),
            session_token: None,
        }
    }
}

impl Config {
    const DEFAULT_BASE_URL: &str = "http://localhost:3000";
    const DEFAULT_API_PREFIX: &str = "/api";
    const DEFAULT_COOKIE_NAME: &str = "session";

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    ///
    /// # Errors
    /// Returns an error if the file exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, default_config_template())
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })
    }

    /// Resolves the backend origin with precedence: env > config > default.
    ///
    /// # Errors
    /// Returns an error if the chosen URL is not well-formed.
    pub fn resolve_base_url(&self) -> Result<String> {
        pick_base_url(std::env::var(BASE_URL_ENV).ok().as_deref(), &self.base_url)
    }

    /// Resolves the session credential with precedence: config > env.
    pub fn resolve_session_token(&self) -> Option<String> {
        pick_session_token(
            self.session_token.as_deref(),
            std::env::var(SESSION_TOKEN_ENV).ok().as_deref(),
        )
    }
}

fn pick_base_url(env_url: Option<&str>, config_url: &str) -> Result<String> {
    let chosen = [env_url, Some(config_url)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|url| !url.is_empty())
        .unwrap_or(Config::DEFAULT_BASE_URL);

    url::Url::parse(chosen).with_context(|| format!("Invalid base URL: {chosen}"))?;
    Ok(chosen.to_string())
}

fn pick_session_token(config_token: Option<&str>, env_token: Option<&str>) -> Option<String> {
    [config_token, env_token]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|token| !token.is_empty())
        .map(str::to_string)
}
