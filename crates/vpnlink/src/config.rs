//! Agent configuration file
//!
//! ```toml
//! app_id = "desktop-agent"
//! vpn_token = "..."
//! premium = false
//! tunnel_port = 443
//! settings_path = "state/settings.json"
//! catalog_path = "locations.toml"
//!
//! [credentials]
//! token = "..."
//! credentials_hash = "..."
//! prefix = "a1b2"
//! username = "user"
//! password = "pass"
//!
//! [connectivity.backoff]
//! max_delay_ms = 60000
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use vpnlink_control::{ConnectivityConfig, DEFAULT_TUNNEL_PORT};

/// Access credentials as written in the agent file
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsSection {
    pub token: String,
    pub credentials_hash: String,
    pub prefix: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for CredentialsSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsSection")
            .field("prefix", &self.prefix)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub app_id: String,
    pub vpn_token: String,
    pub premium: bool,
    /// Block traffic while the tunnel is down
    pub kill_switch: bool,
    /// Port the tunnel listens on at every endpoint
    pub tunnel_port: u16,
    pub settings_path: PathBuf,
    pub catalog_path: PathBuf,
    pub credentials: CredentialsSection,
    pub connectivity: ConnectivityConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_id: "vpnlink".to_string(),
            vpn_token: String::new(),
            premium: false,
            kill_switch: true,
            tunnel_port: DEFAULT_TUNNEL_PORT,
            settings_path: PathBuf::from("settings.json"),
            catalog_path: PathBuf::from("locations.toml"),
            credentials: CredentialsSection::default(),
            connectivity: ConnectivityConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("invalid agent config")?;
        config.connectivity.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config = Self::from_toml(&content)?;

        if let Some(base) = path.parent() {
            config.settings_path = resolve(base, &config.settings_path);
            config.catalog_path = resolve(base, &config.catalog_path);
        }
        Ok(config)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
