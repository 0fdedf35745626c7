//! Server configuration loaded from a TOML file.
//!
//! ```toml
//! name = "scv-dev"
//! bind = "127.0.0.1:12345"
//! activation_password = "..."
//! expiration_seconds = 600
//! max_stream_fails = 10
//!
//! [[users]]
//! id = "alice"
//! token = "..."
//! manager = true
//! ```

use scv_core::{DEFAULT_EXPIRATION_SECONDS, DEFAULT_MAX_STREAM_FAILS};
use scv_session::{SessionConfig, UserCredential};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const REDACTED: &str = "<redacted>";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_bind() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_expiration_seconds() -> u64 {
    DEFAULT_EXPIRATION_SECONDS
}

fn default_max_stream_fails() -> u32 {
    DEFAULT_MAX_STREAM_FAILS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Defaults to `<name>_data` next to the working directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    pub activation_password: String,
    #[serde(default = "default_expiration_seconds")]
    pub expiration_seconds: u64,
    #[serde(default = "default_max_stream_fails")]
    pub max_stream_fails: u32,
    #[serde(default)]
    pub users: Vec<UserCredential>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if self.activation_password.is_empty() {
            return Err(ConfigError::Invalid(
                "activation_password must not be empty".to_string(),
            ));
        }
        if self.expiration_seconds == 0 {
            return Err(ConfigError::Invalid(
                "expiration_seconds must be positive".to_string(),
            ));
        }
        if self.max_stream_fails == 0 {
            return Err(ConfigError::Invalid(
                "max_stream_fails must be positive".to_string(),
            ));
        }
        self.bind_addr()?;

        let mut ids = BTreeSet::new();
        let mut tokens = BTreeSet::new();
        for user in &self.users {
            if user.id.is_empty() || user.token.is_empty() {
                return Err(ConfigError::Invalid(
                    "users need a non-empty id and token".to_string(),
                ));
            }
            if !ids.insert(user.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate user id: {}", user.id)));
            }
            if !tokens.insert(user.token.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate token for user: {}",
                    user.id
                )));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bind {:?}: {e}", self.bind)))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_data", self.name)))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            expiration: Duration::from_secs(self.expiration_seconds),
            max_stream_fails: self.max_stream_fails,
            activation_password: self.activation_password.clone(),
        }
    }

    /// Resolved settings with secrets masked, for printing.
    pub fn redacted(&self) -> Value {
        let users: Vec<Value> = self
            .users
            .iter()
            .map(|user| {
                json!({
                    "id": user.id,
                    "token": REDACTED,
                    "manager": user.manager,
                })
            })
            .collect();
        json!({
            "name": self.name,
            "bind": self.bind,
            "dataDir": self.data_dir().display().to_string(),
            "activationPassword": REDACTED,
            "expirationSeconds": self.expiration_seconds,
            "maxStreamFails": self.max_stream_fails,
            "users": users,
        })
    }
}
