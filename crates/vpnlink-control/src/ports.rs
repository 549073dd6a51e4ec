//! Collaborator Ports
//!
//! Everything the control plane needs from the rest of the client:
//! credentials, proxy configuration, settings persistence and the
//! authoritative location list. Implementations live outside this crate
//! (or in the in-process adapters [`crate::LocalProxy`],
//! [`crate::FileSettingsStore`] and [`crate::StaticLocationsBackend`]).

use crate::location::{Endpoint, Location, LocationData};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;

/// Per-connection secret material
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredentials {
    /// Token presented on the connectivity channel
    pub token: String,
    /// Hash identifying the credentials on the channel URL
    pub credentials_hash: String,
    /// Host prefix of the connectivity channel
    pub prefix: String,
    /// Proxy authentication
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AccessCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredentials")
            .field("prefix", &self.prefix)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Account-level VPN token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnToken {
    pub token: String,
    pub premium: bool,
}

/// Result of pointing the proxy at an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub connection_host: String,
}

/// Result of handing credentials to the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCredentials {
    pub domain_name: String,
}

/// Credentials provider errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialsError {
    #[error("No valid VPN token")]
    NoToken,

    #[error("Credentials request failed: {0}")]
    Request(String),
}

/// Locations backend errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Locations request failed: {0}")]
    Request(String),

    #[error("Malformed locations response: {0}")]
    Malformed(String),
}

/// Source of tokens and access credentials
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Application instance identifier
    fn app_id(&self) -> String;

    /// Current account token
    async fn vpn_token(&self) -> Result<VpnToken, CredentialsError>;

    /// Fresh credentials for one connection attempt
    async fn access_credentials(&self) -> Result<AccessCredentials, CredentialsError>;

    async fn is_premium_token(&self) -> bool;

    /// Force-refresh tokens and credentials
    ///
    /// A successful refresh signals [`Self::tokens_changed`].
    async fn refresh_tokens(&self) -> Result<(), CredentialsError>;

    /// Fires whenever the account tokens changed
    fn tokens_changed(&self) -> broadcast::Receiver<()>;
}

/// Proxy configuration sink
#[async_trait]
pub trait ProxySink: Send + Sync {
    async fn set_current_endpoint(
        &self,
        endpoint: &Endpoint,
        location: &Location,
    ) -> Result<ProxyTarget, crate::ProxyError>;

    async fn set_access_credentials(
        &self,
        credentials: &AccessCredentials,
    ) -> Result<AppliedCredentials, crate::ProxyError>;

    async fn enable(&self) -> Result<(), crate::ProxyError>;

    /// Must be safe to call repeatedly
    async fn disable(&self);
}

/// Durable key-value settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, crate::SettingsError>;

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), crate::SettingsError>;
}

/// Authoritative location list
#[async_trait]
pub trait LocationsBackend: Send + Sync {
    async fn fetch_locations(
        &self,
        app_id: &str,
        vpn_token: &str,
    ) -> Result<Vec<LocationData>, BackendError>;
}
