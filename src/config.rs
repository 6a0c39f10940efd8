use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BackupError;

/// Main configuration structure for bitbuckup
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory under which `repos/` is created
    #[serde(default = "default_work_directory")]
    pub work_directory: String,

    /// Bitbucket credentials, accounts and endpoints
    #[serde(default)]
    pub bitbucket: BitbucketConfig,

    /// Git subprocess settings
    #[serde(default)]
    pub git: GitConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bitbucket configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BitbucketConfig {
    /// OAuth consumer key
    pub client_id: Option<String>,

    /// OAuth consumer secret
    pub client_secret: Option<String>,

    /// Accounts (users or teams) to mirror, processed in this order
    #[serde(default)]
    pub accounts: Vec<String>,

    /// Client-credentials token endpoint
    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    /// REST API root, ending in a slash
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Host used to build SSH clone URLs
    #[serde(default = "default_ssh_host")]
    pub ssh_host: String,

    /// Timeout for a single HTTP request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

/// Git subprocess configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitConfig {
    /// Executable to run
    #[serde(default = "default_git_program")]
    pub program: String,

    /// Timeout for a single git command in seconds
    #[serde(default = "default_git_timeout")]
    pub timeout: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

/// Validated credentials and account list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub accounts: Vec<String>,
}

// Default value functions
fn default_work_directory() -> String {
    ".".to_string()
}
fn default_auth_url() -> String {
    "https://bitbucket.org/site/oauth2/access_token".to_string()
}
fn default_api_base_url() -> String {
    "https://api.bitbucket.org/2.0/".to_string()
}
fn default_ssh_host() -> String {
    "bitbucket.org".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_git_program() -> String {
    "git".to_string()
}
fn default_git_timeout() -> u64 {
    1800
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for BitbucketConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            accounts: Vec::new(),
            auth_url: default_auth_url(),
            api_base_url: default_api_base_url(),
            ssh_host: default_ssh_host(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            program: default_git_program(),
            timeout: default_git_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_directory: default_work_directory(),
            bitbucket: BitbucketConfig::default(),
            git: GitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!("No configuration file at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("bitbuckup").join("config.yml"))
    }

    /// Expand environment variables and `~` in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.work_directory = shellexpand::full(&self.work_directory)
            .context("Failed to expand work_directory path")?
            .into_owned();

        Ok(())
    }

    /// Apply `CLIENT_ID`, `CLIENT_SECRET` and `USERNAMES` from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("CLIENT_ID").filter(|v| !v.trim().is_empty()) {
            self.bitbucket.client_id = Some(id.trim().to_string());
        }
        if let Some(secret) = lookup("CLIENT_SECRET").filter(|v| !v.trim().is_empty()) {
            self.bitbucket.client_secret = Some(secret.trim().to_string());
        }
        if let Some(names) = lookup("USERNAMES") {
            let accounts = parse_account_list(&names);
            if !accounts.is_empty() {
                self.bitbucket.accounts = accounts;
            }
        }
    }

    /// Validate that everything needed to talk to Bitbucket is present
    pub fn credentials(&self) -> Result<Credentials, BackupError> {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let client_id = non_empty(&self.bitbucket.client_id);
        let client_secret = non_empty(&self.bitbucket.client_secret);
        let accounts: Vec<String> = self
            .bitbucket
            .accounts
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        let mut missing = Vec::new();
        if client_id.is_none() {
            missing.push("CLIENT_ID");
        }
        if client_secret.is_none() {
            missing.push("CLIENT_SECRET");
        }
        if accounts.is_empty() {
            missing.push("USERNAMES");
        }

        match (client_id, client_secret) {
            (Some(client_id), Some(client_secret)) if missing.is_empty() => Ok(Credentials {
                client_id,
                client_secret,
                accounts,
            }),
            _ => Err(BackupError::IncompleteConfig { missing }),
        }
    }

    /// Root of the local mirror: `<work_directory>/repos`
    pub fn repos_root(&self) -> PathBuf {
        PathBuf::from(&self.work_directory).join("repos")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.bitbucket.request_timeout)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git.timeout)
    }
}

/// Split a `USERNAMES` value: commas separate, surrounding whitespace is dropped
pub fn parse_account_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
