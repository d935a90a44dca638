//! Control client configuration.
//!
//! A small JSON file naming the gateway, the credentials to present, and
//! where device identity and tokens are kept. Command-line flags override
//! individual fields.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::options::{DEFAULT_OPERATOR_SCOPES, GatewayClientOptions};

const APP_DIR: &str = "claw-control";

#[cfg(unix)]
const CONFIG_FILE_MODE: u32 = 0o600;

/// On-disk configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlConfig {
    /// Gateway WebSocket URL.
    pub gateway_url: String,
    /// Explicit gateway token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Shared gateway password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Role to request.
    #[serde(default = "default_role")]
    pub role: String,
    /// Scopes to request.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Directory holding the device identity and token cache.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_role() -> String {
    "operator".to_string()
}

fn default_scopes() -> Vec<String> {
    DEFAULT_OPERATOR_SCOPES.iter().map(|s| (*s).to_string()).collect()
}

fn default_state_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("state")
}

/// Write `content` with owner-only permissions.
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(CONFIG_FILE_MODE);
    }
    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(CONFIG_FILE_MODE))?;
    }
    file.write_all(content)?;
    file.sync_all()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            password: None,
            role: default_role(),
            scopes: default_scopes(),
            state_dir: default_state_dir(),
        }
    }
}

impl ControlConfig {
    /// Default config file location, `<config dir>/claw-control/config.json`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, GatewayError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| GatewayError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GatewayError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GatewayError::Config(format!(
                    "failed to create config directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        write_private(path, content.as_bytes()).map_err(|e| {
            GatewayError::Config(format!(
                "failed to write config file '{}': {e}",
                path.display()
            ))
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let url = url::Url::parse(&self.gateway_url)
            .map_err(|e| GatewayError::Config(format!("invalid gatewayUrl: {e}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(GatewayError::Config(
                "gatewayUrl must start with ws:// or wss://".to_string(),
            ));
        }

        if self.role.trim().is_empty() {
            return Err(GatewayError::Config("role cannot be empty".to_string()));
        }

        if self.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(GatewayError::Config("scopes cannot contain blanks".to_string()));
        }

        if self.state_dir.as_os_str().is_empty() {
            return Err(GatewayError::Config("stateDir cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Client options for this configuration.
    #[must_use]
    pub fn client_options(&self) -> GatewayClientOptions {
        let mut options = GatewayClientOptions::new(self.gateway_url.clone())
            .with_role(self.role.clone())
            .with_scopes(self.scopes.iter().cloned());
        if let Some(token) = &self.token {
            options = options.with_token(token.clone());
        }
        if let Some(password) = &self.password {
            options = options.with_password(password.clone());
        }
        if let Ok(host) = hostname::get() {
            options = options.with_display_name(host.to_string_lossy().to_string());
        }
        options
    }
}
