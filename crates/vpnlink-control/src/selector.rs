//! Endpoint Selection
//!
//! Picks the endpoint to connect to for a location, and the location to use
//! when the user has not chosen one.
//!
//! # Policies
//!
//! | Situation | Choice |
//! |-----------|--------|
//! | No stored selection | fastest allowed location |
//! | Auto selection, tunnel idle | fastest allowed location |
//! | User selection, or tunnel active | keep the selection |
//! | Premium location, account downgraded | same city, else fastest allowed |

use crate::config::SelectorConfig;
use crate::location::{Endpoint, Location, SelectedLocation};
use crate::registry::{LocationRegistry, RegistryError};
use crate::state::ConnectionState;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Location and endpoint chooser
pub struct EndpointSelector {
    registry: Arc<LocationRegistry>,
    measurement_wait: Duration,
}

impl EndpointSelector {
    pub fn new(registry: Arc<LocationRegistry>, config: &SelectorConfig) -> Self {
        Self {
            registry,
            measurement_wait: config.measurement_wait(),
        }
    }

    pub fn registry(&self) -> &Arc<LocationRegistry> {
        &self.registry
    }

    /// Endpoint for `location`, re-read from the current list first
    pub async fn selected_endpoint_for(
        &self,
        location: &Location,
        force_previous: bool,
    ) -> Result<Endpoint, RegistryError> {
        let current = self
            .registry
            .find(&location.id)
            .await
            .unwrap_or_else(|| location.clone());
        self.registry.resolve_endpoint(&current, force_previous).await
    }

    /// Fastest available location the account may use
    ///
    /// Waits once, briefly, if measurements are still running. Falls back
    /// to the first allowed location when nothing has a ping yet.
    pub async fn pick_default_location(
        &self,
        all: &[Location],
        is_premium: bool,
    ) -> Option<Location> {
        let mut candidates: Vec<Location> = all
            .iter()
            .filter(|l| is_premium || !l.premium_only)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }

        if self.registry.is_measuring() {
            debug!(wait = ?self.measurement_wait, "Measurements running, waiting before picking");
            tokio::time::sleep(self.measurement_wait).await;

            let latest = self.registry.get_all().await;
            for candidate in &mut candidates {
                if let Some(updated) = latest.iter().find(|l| l.id == candidate.id) {
                    *candidate = updated.clone();
                }
            }
        }

        fastest(&candidates).or_else(|| candidates.first()).cloned()
    }

    /// Whether the fastest location may replace the current selection
    pub fn should_auto_select(
        &self,
        selected: Option<&SelectedLocation>,
        state: ConnectionState,
    ) -> bool {
        match selected {
            None => true,
            Some(selected) => !selected.selected_by_user && state.is_idle(),
        }
    }

    /// Closest location a non-premium account may use instead of `current`
    pub fn premium_substitute(&self, current: &Location, all: &[Location]) -> Option<Location> {
        let allowed: Vec<Location> = all
            .iter()
            .filter(|l| !l.premium_only && l.id != current.id)
            .cloned()
            .collect();

        let same_city: Vec<Location> = allowed
            .iter()
            .filter(|l| {
                l.city_name == current.city_name && l.country_code == current.country_code
            })
            .cloned()
            .collect();

        if let Some(first) = same_city.first() {
            return fastest(&same_city).or(Some(first)).cloned();
        }
        fastest(&allowed).or_else(|| allowed.first()).cloned()
    }
}

fn fastest(locations: &[Location]) -> Option<&Location> {
    locations
        .iter()
        .filter(|l| l.available())
        .filter_map(|l| l.ping().map(|ping| (ping, l)))
        .min_by_key(|(ping, _)| *ping)
        .map(|(_, l)| l)
}
