//! In-Process Proxy Configuration
//!
//! Holds the endpoint and credentials the proxy tunnels through and gates
//! every outgoing request on the proxy being enabled.
//!
//! # Kill switch
//!
//! With the kill switch on (the default), a request made while the proxy is
//! disabled is refused instead of going out directly. Nothing leaks between
//! a teardown and the next successful connect.

use crate::location::{Endpoint, Location, LocationId};
use crate::ports::{AccessCredentials, AppliedCredentials, ProxySink, ProxyTarget};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Port the tunnel listens on at every endpoint
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Through the tunnel at `host:port`
    Tunnel {
        connection_host: String,
        username: String,
    },
    /// Proxy off and kill switch off
    Direct,
}

#[derive(Default)]
struct Configured {
    endpoint: Option<Endpoint>,
    location_id: Option<LocationId>,
    connection_host: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Proxy sink backed by process memory
pub struct LocalProxy {
    port: u16,
    kill_switch: bool,
    enabled: AtomicBool,
    configured: RwLock<Configured>,
}

impl LocalProxy {
    pub fn new(kill_switch: bool) -> Self {
        Self {
            port: DEFAULT_TUNNEL_PORT,
            kill_switch,
            enabled: AtomicBool::new(false),
            configured: RwLock::new(Configured::default()),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.read().endpoint.clone()
    }

    pub fn current_location(&self) -> Option<LocationId> {
        self.read().location_id.clone()
    }

    pub fn connection_host(&self) -> Option<String> {
        self.read().connection_host.clone()
    }

    /// Route for an outgoing request right now
    pub fn check_request(&self) -> Result<Route, ProxyError> {
        if !self.is_enabled() {
            return if self.kill_switch {
                Err(ProxyError::TrafficBlocked)
            } else {
                Ok(Route::Direct)
            };
        }

        let configured = self.read();
        match (&configured.connection_host, &configured.username) {
            (Some(host), Some(user)) => Ok(Route::Tunnel {
                connection_host: host.clone(),
                username: user.clone(),
            }),
            _ => Err(ProxyError::NotConfigured),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Configured> {
        self.configured.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Configured> {
        self.configured.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LocalProxy {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ProxySink for LocalProxy {
    async fn set_current_endpoint(
        &self,
        endpoint: &Endpoint,
        location: &Location,
    ) -> Result<ProxyTarget, ProxyError> {
        let connection_host = format!("{}:{}", endpoint.domain_name, self.port);

        let mut configured = self.write();
        configured.endpoint = Some(endpoint.clone());
        configured.location_id = Some(location.id.clone());
        configured.connection_host = Some(connection_host.clone());
        // Credentials are bound to the endpoint they were issued for
        configured.username = None;
        configured.password = None;

        debug!(location = %location.id, endpoint = %endpoint.id, "Proxy endpoint set");
        Ok(ProxyTarget { connection_host })
    }

    async fn set_access_credentials(
        &self,
        credentials: &AccessCredentials,
    ) -> Result<AppliedCredentials, ProxyError> {
        let mut configured = self.write();
        let domain_name = configured
            .endpoint
            .as_ref()
            .map(|e| e.domain_name.clone())
            .ok_or(ProxyError::NoEndpoint)?;

        configured.username = Some(credentials.username.clone());
        configured.password = Some(credentials.password.clone());

        Ok(AppliedCredentials { domain_name })
    }

    async fn enable(&self) -> Result<(), ProxyError> {
        {
            let configured = self.read();
            if configured.connection_host.is_none() || configured.username.is_none() {
                warn!("Refusing to enable an unconfigured proxy");
                return Err(ProxyError::NotConfigured);
            }
        }

        if !self.enabled.swap(true, Ordering::AcqRel) {
            info!(host = ?self.connection_host(), "Proxy enabled");
        }
        Ok(())
    }

    async fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            info!("Proxy disabled");
        }
    }
}

/// Proxy configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("No endpoint configured")]
    NoEndpoint,

    #[error("Proxy is not fully configured")]
    NotConfigured,

    #[error("Traffic blocked: proxy is disabled (kill switch active)")]
    TrafficBlocked,
}
