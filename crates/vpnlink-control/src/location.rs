//! Locations and Endpoints
//!
//! A location is the unit the user picks (a city); each location lists one
//! or more endpoints in failover order. Runtime latency state lives on the
//! location but is only ever written by the registry.

use crate::keys::{KeyError, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::time::Instant;
use tracing::warn;

/// Stable location identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single connectable server
///
/// Immutable once built; two endpoints are the same endpoint when their ids
/// match.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    /// Tunnel host; also probed via `ping.<domain>`
    pub domain_name: String,
    pub ipv4_address: Option<Ipv4Addr>,
    pub ipv6_address: Option<Ipv6Addr>,
    pub public_key: PublicKey,
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Endpoint {}

/// Geographic position (longitude, latitude)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
}

/// A user-selectable place grouping failover endpoints
#[derive(Debug, Clone)]
pub struct Location {
    pub id: LocationId,
    pub country_name: String,
    pub country_code: String,
    pub city_name: String,
    pub premium_only: bool,
    pub coordinates: Coordinates,
    /// Candidate endpoints in failover order
    pub endpoints: Vec<Endpoint>,
    /// No dedicated physical presence
    pub is_virtual: bool,
    ping: Option<u32>,
    available: bool,
    endpoint: Option<Endpoint>,
}

impl Location {
    pub fn new(id: impl Into<String>, city_name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            id: LocationId::new(id),
            country_name: String::new(),
            country_code: String::new(),
            city_name: city_name.into(),
            premium_only: false,
            coordinates: Coordinates::default(),
            endpoints,
            is_virtual: false,
            ping: None,
            available: true,
            endpoint: None,
        }
    }

    /// Last measured latency in milliseconds
    pub fn ping(&self) -> Option<u32> {
        self.ping
    }

    pub fn available(&self) -> bool {
        self.available
    }

    /// Endpoint that answered the last probe
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Has at least one endpoint to resolve
    pub fn is_resolvable(&self) -> bool {
        !self.endpoints.is_empty()
    }

    pub(crate) fn set_ping_state(
        &mut self,
        ping: Option<u32>,
        available: bool,
        endpoint: Option<Endpoint>,
    ) {
        self.available = available;
        self.ping = if available { ping } else { None };
        self.endpoint = endpoint;
    }
}

/// The persisted location choice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedLocation {
    pub id: LocationId,
    /// Explicit user choice; disables auto re-selection
    #[serde(default)]
    pub selected_by_user: bool,
}

/// Per-location ping cache record
#[derive(Debug, Clone)]
pub(crate) struct PingCacheEntry {
    pub ping: Option<u32>,
    pub available: bool,
    pub endpoint: Option<Endpoint>,
    pub last_measured: Option<Instant>,
    pub is_measuring: bool,
}

impl PingCacheEntry {
    pub fn empty() -> Self {
        Self {
            ping: None,
            available: true,
            endpoint: None,
            last_measured: None,
            is_measuring: false,
        }
    }

    /// Measured recently and answered
    pub fn is_fresh(&self, ttl: std::time::Duration, now: Instant) -> bool {
        match self.last_measured {
            Some(at) => self.ping.is_some() && now.duration_since(at) < ttl,
            None => false,
        }
    }
}

/// Endpoint as delivered by the locations backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointData {
    pub id: String,
    pub domain_name: String,
    #[serde(default)]
    pub ipv4_address: Option<String>,
    #[serde(default)]
    pub ipv6_address: Option<String>,
    pub public_key: String,
}

/// Location as delivered by the locations backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationData {
    pub id: String,
    #[serde(default)]
    pub country_name: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub city_name: String,
    #[serde(default)]
    pub premium_only: bool,
    #[serde(default)]
    pub coordinates: Coordinates,
    #[serde(default)]
    pub endpoints: Vec<EndpointData>,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

impl TryFrom<&EndpointData> for Endpoint {
    type Error = EndpointDataError;

    fn try_from(data: &EndpointData) -> Result<Self, Self::Error> {
        if data.domain_name.is_empty() {
            return Err(EndpointDataError::MissingDomain);
        }
        let ipv4_address = match data.ipv4_address.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse().map_err(|_| EndpointDataError::InvalidAddress(s.to_string()))?),
            None => None,
        };
        let ipv6_address = match data.ipv6_address.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse().map_err(|_| EndpointDataError::InvalidAddress(s.to_string()))?),
            None => None,
        };

        Ok(Endpoint {
            id: data.id.clone(),
            domain_name: data.domain_name.clone(),
            ipv4_address,
            ipv6_address,
            public_key: PublicKey::from_base64(&data.public_key)?,
        })
    }
}

impl From<&LocationData> for Location {
    /// Endpoints that fail validation are dropped with a warning
    fn from(data: &LocationData) -> Self {
        let endpoints = data
            .endpoints
            .iter()
            .filter_map(|e| match Endpoint::try_from(e) {
                Ok(endpoint) => Some(endpoint),
                Err(err) => {
                    warn!(location = %data.id, endpoint = %e.id, "Skipping endpoint: {}", err);
                    None
                }
            })
            .collect();

        Location {
            id: LocationId::new(data.id.clone()),
            country_name: data.country_name.clone(),
            country_code: data.country_code.clone(),
            city_name: data.city_name.clone(),
            premium_only: data.premium_only,
            coordinates: data.coordinates,
            endpoints,
            is_virtual: data.is_virtual,
            ping: None,
            available: true,
            endpoint: None,
        }
    }
}

/// Endpoint validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EndpointDataError {
    #[error("missing domain name")]
    MissingDomain,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid public key: {0}")]
    Key(#[from] KeyError),
}
