//! Static Locations Backend
//!
//! Serves the location list from a catalog file instead of the account
//! API. Used by the agent binary and by tests.
//!
//! ```toml
//! [[locations]]
//! id = "fra"
//! countryName = "Germany"
//! countryCode = "DE"
//! cityName = "Frankfurt"
//! coordinates = { longitude = 8.68, latitude = 50.11 }
//!
//! [[locations.endpoints]]
//! id = "fra-1"
//! domainName = "fra-1.example.org"
//! ipv4Address = "185.186.78.1"
//! publicKey = "WDvCRKv9hVAx1P3L7dKxiNxI3CxbK9Ue1tL8x2ZqRVk="
//! ```

use crate::config::ConfigError;
use crate::location::LocationData;
use crate::ports::{BackendError, LocationsBackend};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Location list as stored on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationCatalog {
    #[serde(default)]
    pub locations: Vec<LocationData>,
}

impl LocationCatalog {
    pub fn new(locations: Vec<LocationData>) -> Self {
        Self { locations }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    pub fn find(&self, id: &str) -> Option<&LocationData> {
        self.locations.iter().find(|l| l.id == id)
    }

    /// Export as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Backend answering every fetch from an in-memory catalog
pub struct StaticLocationsBackend {
    catalog: RwLock<LocationCatalog>,
    fetches: AtomicUsize,
}

impl StaticLocationsBackend {
    pub fn new(catalog: LocationCatalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Swap the catalog served by later fetches
    pub async fn replace(&self, catalog: LocationCatalog) {
        *self.catalog.write().await = catalog;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LocationsBackend for StaticLocationsBackend {
    async fn fetch_locations(
        &self,
        app_id: &str,
        vpn_token: &str,
    ) -> Result<Vec<LocationData>, BackendError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if vpn_token.is_empty() {
            return Err(BackendError::Request("missing vpn token".into()));
        }

        let locations = self.catalog.read().await.locations.clone();
        debug!(app_id, count = locations.len(), "Serving static locations");
        Ok(locations)
    }
}
