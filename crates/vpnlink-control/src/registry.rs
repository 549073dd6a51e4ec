//! Location Registry
//!
//! Owns the location list, the per-location ping cache and the persisted
//! selection. Nothing outside this module writes ping, availability or the
//! sticky endpoint of a location.
//!
//! # Measurement
//!
//! - A bulk pass re-probes only locations whose cache entry is stale or
//!   missing a ping.
//! - A second bulk pass while one is running is a no-op.
//! - A location already being measured is skipped, never probed twice;
//!   resolving it waits for the running measurement instead.
//! - Endpoints are tried in failover order with the last good one first;
//!   the first one that answers wins.

use crate::config::RegistryConfig;
use crate::events::{EventBus, LocationState, Notification};
use crate::location::{Endpoint, Location, LocationId, PingCacheEntry, SelectedLocation};
use crate::ports::{BackendError, LocationsBackend, SettingsStore};
use crate::probe::PingProbe;
use crate::settings::SettingsError;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings key holding the persisted [`SelectedLocation`]
pub const SELECTED_LOCATION_KEY: &str = "selected-location";

#[derive(Default)]
struct Selection {
    loaded: bool,
    current: Option<SelectedLocation>,
}

/// In-memory location cache
pub struct LocationRegistry {
    backend: Arc<dyn LocationsBackend>,
    probe: Arc<dyn PingProbe>,
    settings: Arc<dyn SettingsStore>,
    bus: Arc<dyn EventBus>,
    ping_ttl: Duration,
    locations: RwLock<Vec<Location>>,
    cache: Mutex<HashMap<LocationId, PingCacheEntry>>,
    selection: tokio::sync::Mutex<Selection>,
    measuring: AtomicBool,
    measured: Notify,
}

impl LocationRegistry {
    pub fn new(
        config: &RegistryConfig,
        backend: Arc<dyn LocationsBackend>,
        probe: Arc<dyn PingProbe>,
        settings: Arc<dyn SettingsStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            backend,
            probe,
            settings,
            bus,
            ping_ttl: config.ping_ttl(),
            locations: RwLock::new(Vec::new()),
            cache: Mutex::new(HashMap::new()),
            selection: tokio::sync::Mutex::new(Selection::default()),
            measuring: AtomicBool::new(false),
            measured: Notify::new(),
        }
    }

    /// Replace the list with the backend's and start measuring in the background
    ///
    /// An empty answer keeps the current list. Ping state carries over by id;
    /// entries of locations that left the list are dropped.
    pub async fn load_from_server(
        self: &Arc<Self>,
        app_id: &str,
        vpn_token: &str,
    ) -> Result<Vec<Location>, RegistryError> {
        let data = self.backend.fetch_locations(app_id, vpn_token).await?;

        if data.is_empty() {
            let kept = self.get_all().await;
            warn!(kept = kept.len(), "Server returned no locations, keeping cached list");
            return Ok(kept);
        }

        let fresh: Vec<Location> = data.iter().map(Location::from).collect();
        info!(count = fresh.len(), "Locations loaded");

        // Claimed before returning so callers see the pass as running
        let due = {
            let mut locations = self.locations.write().await;
            *locations = fresh;
            self.prune_cache(&locations);
            self.claim_due(&locations)
        };

        let snapshot = self.get_all().await;
        self.bus.publish(Notification::LocationsUpdated(snapshot.clone()));

        if let Some(due) = due {
            let registry = self.clone();
            tokio::spawn(async move { registry.measure_claimed(due).await });
        }

        Ok(snapshot)
    }

    /// Every known location with its cached ping state applied
    pub async fn get_all(&self) -> Vec<Location> {
        let mut locations = self.locations.read().await.clone();
        let cache = self.cache();
        for location in &mut locations {
            if let Some(entry) = cache.get(&location.id) {
                apply_entry(location, entry);
            }
        }
        locations
    }

    pub async fn find(&self, id: &LocationId) -> Option<Location> {
        self.get_all().await.into_iter().find(|l| &l.id == id)
    }

    /// The selected location, if it is still in the list
    pub async fn get_selected(&self) -> Option<Location> {
        let selected = self.selected_info().await?;
        self.find(&selected.id).await
    }

    /// The persisted selection record, loaded from settings on first use
    pub async fn selected_info(&self) -> Option<SelectedLocation> {
        let mut selection = self.selection.lock().await;
        if !selection.loaded {
            selection.current = self.load_selection().await;
            selection.loaded = true;
        }
        selection.current.clone()
    }

    pub async fn set_selected(
        &self,
        id: &LocationId,
        selected_by_user: bool,
    ) -> Result<(), RegistryError> {
        let record = SelectedLocation {
            id: id.clone(),
            selected_by_user,
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| RegistryError::Settings(SettingsError::Parse(e.to_string())))?;

        let mut selection = self.selection.lock().await;
        self.settings.set(SELECTED_LOCATION_KEY, value).await?;
        selection.current = Some(record);
        selection.loaded = true;
        drop(selection);

        info!(location = %id, selected_by_user, "Location selected");
        self.bus.publish(Notification::SelectedLocationChanged {
            location_id: id.clone(),
            selected_by_user,
        });
        Ok(())
    }

    /// Re-probe every stale location
    pub async fn measure_all_pings(&self) {
        let locations = self.locations.read().await.clone();
        if let Some(due) = self.claim_due(&locations) {
            self.measure_claimed(due).await;
        }
    }

    /// Start a bulk pass: take the pass flag and mark every due location
    ///
    /// `None` when a pass is already running.
    fn claim_due(&self, locations: &[Location]) -> Option<Vec<Location>> {
        if self.measuring.swap(true, Ordering::AcqRel) {
            debug!("Measurement already running");
            return None;
        }

        let now = Instant::now();
        let mut cache = self.cache();
        let due = locations
            .iter()
            .filter(|location| {
                let entry = cache
                    .entry(location.id.clone())
                    .or_insert_with(PingCacheEntry::empty);
                if entry.is_measuring || entry.is_fresh(self.ping_ttl, now) {
                    return false;
                }
                entry.is_measuring = true;
                true
            })
            .cloned()
            .collect();
        Some(due)
    }

    /// Measure locations claimed by [`Self::claim_due`], then release the pass flag
    async fn measure_claimed(&self, due: Vec<Location>) {
        let _running = FlagGuard(&self.measuring);
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "Measuring locations");

        join_all(due.iter().map(|location| async move {
            if let Err(e) = self.measure(location, false).await {
                debug!(location = %location.id, "Skipped: {}", e);
            }
        }))
        .await;
    }

    /// Resolve a location to the endpoint to connect to
    ///
    /// With `force_previous` and a known good endpoint, only that endpoint is
    /// probed. Otherwise endpoints are searched in order; when none answers
    /// the first one is returned, marked unavailable.
    pub async fn resolve_endpoint(
        &self,
        location: &Location,
        force_previous: bool,
    ) -> Result<Endpoint, RegistryError> {
        loop {
            let finished = self.measured.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();

            let busy_since = {
                let mut cache = self.cache();
                let entry = cache
                    .entry(location.id.clone())
                    .or_insert_with(PingCacheEntry::empty);
                if entry.is_measuring {
                    Some(entry.last_measured)
                } else {
                    entry.is_measuring = true;
                    None
                }
            };
            let Some(before) = busy_since else {
                return self.measure(location, force_previous).await;
            };

            // Another measurement owns the entry; use its result
            debug!(location = %location.id, "Waiting for running measurement");
            finished.await;
            if let Some(result) = self.measured_since(location, before) {
                return result;
            }
        }
    }

    /// Any measurement in progress
    pub fn is_measuring(&self) -> bool {
        self.measuring.load(Ordering::Acquire) || self.cache().values().any(|e| e.is_measuring)
    }

    /// Re-ping stale locations every `interval` until cancelled
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("Periodic location refresh");
                        registry.measure_all_pings().await;
                    }
                }
            }
        })
    }

    /// Probe a location whose cache entry is already marked as measuring
    async fn measure(&self, location: &Location, force_previous: bool) -> Result<Endpoint, RegistryError> {
        let _measuring = MeasureGuard {
            registry: self,
            id: &location.id,
        };

        if location.endpoints.is_empty() {
            return Err(RegistryError::NoEndpoints(location.id.clone()));
        }

        let previous = self.previous_endpoint(location);
        let (endpoint, ping) = match previous {
            Some(previous) if force_previous => {
                debug!(location = %location.id, endpoint = %previous.id, "Re-validating previous endpoint");
                let ping = self.probe.probe(&previous.domain_name).await;
                (previous, ping)
            }
            previous => self.search(location, previous).await,
        };

        self.record(location, &endpoint, ping);
        Ok(endpoint)
    }

    /// Sequential failover search, last good endpoint first
    async fn search(&self, location: &Location, previous: Option<Endpoint>) -> (Endpoint, Option<u32>) {
        let mut order: Vec<&Endpoint> = Vec::with_capacity(location.endpoints.len());
        if let Some(previous) = previous.as_ref() {
            order.push(previous);
        }
        order.extend(location.endpoints.iter().filter(|e| Some(*e) != previous.as_ref()));

        for endpoint in order {
            if let Some(ping) = self.probe.probe(&endpoint.domain_name).await {
                return (endpoint.clone(), Some(ping));
            }
            debug!(location = %location.id, endpoint = %endpoint.id, "Endpoint did not answer");
        }

        // Non-empty checked by the caller
        (location.endpoints[0].clone(), None)
    }

    /// Outcome of a measurement that finished after `before`, if any
    fn measured_since(
        &self,
        location: &Location,
        before: Option<Instant>,
    ) -> Option<Result<Endpoint, RegistryError>> {
        let cache = self.cache();
        let entry = cache.get(&location.id)?;
        if entry.is_measuring || entry.last_measured.is_none() || entry.last_measured == before {
            return None;
        }

        let endpoint = entry
            .endpoint
            .as_ref()
            .and_then(|e| location.endpoints.iter().find(|candidate| *candidate == e))
            .or_else(|| location.endpoints.first())
            .cloned();
        Some(endpoint.ok_or_else(|| RegistryError::NoEndpoints(location.id.clone())))
    }

    /// Drop cache entries of locations no longer listed
    fn prune_cache(&self, locations: &[Location]) {
        let mut cache = self.cache();
        let before = cache.len();
        cache.retain(|id, _| locations.iter().any(|l| &l.id == id));
        if cache.len() < before {
            debug!(removed = before - cache.len(), "Pruned ping cache");
        }
    }

    /// Last good endpoint, if the location still lists it
    fn previous_endpoint(&self, location: &Location) -> Option<Endpoint> {
        let cache = self.cache();
        let previous = cache.get(&location.id)?.endpoint.as_ref()?;
        let listed = location.endpoints.iter().find(|e| *e == previous).cloned();
        listed
    }

    fn record(&self, location: &Location, endpoint: &Endpoint, ping: Option<u32>) {
        let available = ping.is_some();
        {
            let mut cache = self.cache();
            let entry = cache
                .entry(location.id.clone())
                .or_insert_with(PingCacheEntry::empty);
            entry.ping = ping;
            entry.available = available;
            entry.last_measured = Some(Instant::now());
            // Only an answering endpoint becomes sticky
            if available {
                entry.endpoint = Some(endpoint.clone());
            }
        }

        debug!(location = %location.id, endpoint = %endpoint.id, ping = ?ping, "Location measured");
        self.bus.publish(Notification::LocationStateUpdated(LocationState {
            location_id: location.id.clone(),
            ping,
            available,
            endpoint_id: Some(endpoint.id.clone()),
        }));
    }

    async fn load_selection(&self) -> Option<SelectedLocation> {
        match self.settings.get(SELECTED_LOCATION_KEY).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(selected) => Some(selected),
                Err(e) => {
                    warn!("Ignoring malformed stored selection: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read stored selection: {}", e);
                None
            }
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<LocationId, PingCacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_entry(location: &mut Location, entry: &PingCacheEntry) {
    let endpoint = entry
        .endpoint
        .as_ref()
        .and_then(|e| location.endpoints.iter().find(|candidate| *candidate == e))
        .cloned();
    location.set_ping_state(entry.ping, entry.available, endpoint);
}

/// Clears a location's measuring mark, also when the measurement is dropped
struct MeasureGuard<'a> {
    registry: &'a LocationRegistry,
    id: &'a LocationId,
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.cache().get_mut(self.id) {
            entry.is_measuring = false;
        }
        self.registry.measured.notify_waiters();
    }
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Registry errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Location {0} has no endpoints")]
    NoEndpoints(LocationId),

    #[error("Unknown location: {0}")]
    UnknownLocation(LocationId),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventBus;
    use crate::settings::MemorySettingsStore;
    use crate::test_support::{location, location_data, FakeBackend, FakeProbe};
    use tokio::sync::broadcast;

    struct Fixture {
        registry: Arc<LocationRegistry>,
        probe: Arc<FakeProbe>,
        backend: Arc<FakeBackend>,
        settings: Arc<MemorySettingsStore>,
        bus: Arc<InMemoryEventBus>,
    }

    fn fixture(probe: FakeProbe, locations: Vec<crate::location::LocationData>) -> Fixture {
        let probe = Arc::new(probe);
        let backend = Arc::new(FakeBackend::new(locations));
        let settings = Arc::new(MemorySettingsStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = Arc::new(LocationRegistry::new(
            &RegistryConfig::default(),
            backend.clone(),
            probe.clone(),
            settings.clone(),
            bus.clone(),
        ));
        Fixture {
            registry,
            probe,
            backend,
            settings,
            bus,
        }
    }

    async fn seed(registry: &LocationRegistry, locations: Vec<Location>) {
        *registry.locations.write().await = locations;
    }

    async fn settle(registry: &LocationRegistry) {
        while registry.is_measuring() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn state_updates(rx: &mut broadcast::Receiver<Notification>) -> Vec<LocationState> {
        let mut updates = Vec::new();
        while let Ok(n) = rx.try_recv() {
            if let Notification::LocationStateUpdated(state) = n {
                updates.push(state);
            }
        }
        updates
    }

    #[tokio::test]
    async fn test_failover_to_second_endpoint() {
        let f = fixture(FakeProbe::new(&[("e1", None), ("e2", Some(200))]), vec![]);
        let a = location("a", &["e1", "e2"]);
        seed(&f.registry, vec![a.clone()]).await;
        let mut rx = f.bus.subscribe();

        let endpoint = f.registry.resolve_endpoint(&a, false).await.unwrap();

        assert_eq!(endpoint.id, "e2");
        let cached = f.registry.find(&a.id).await.unwrap();
        assert_eq!(cached.ping(), Some(200));
        assert!(cached.available());
        assert_eq!(cached.endpoint().map(|e| e.id.as_str()), Some("e2"));

        assert_eq!(
            state_updates(&mut rx),
            vec![LocationState {
                location_id: a.id.clone(),
                ping: Some(200),
                available: true,
                endpoint_id: Some("e2".into()),
            }]
        );
        assert!(!f.registry.is_measuring());
    }

    #[tokio::test]
    async fn test_sticky_endpoint_probed_alone() {
        let f = fixture(
            FakeProbe::new(&[("e1", Some(80)), ("e2", Some(40)), ("e3", Some(20))]),
            vec![],
        );
        let a = location("a", &["e1", "e2", "e3"]);
        seed(&f.registry, vec![a.clone()]).await;

        // e1 answers first and becomes sticky
        f.registry.resolve_endpoint(&a, false).await.unwrap();
        assert_eq!(f.probe.calls(), vec!["e1"]);

        f.probe.set("e1", None);
        let endpoint = f.registry.resolve_endpoint(&a, true).await.unwrap();

        assert_eq!(endpoint.id, "e1");
        assert_eq!(f.probe.calls(), vec!["e1", "e1"]);
        let cached = f.registry.find(&a.id).await.unwrap();
        assert!(!cached.available());
        assert_eq!(cached.ping(), None);
    }

    #[tokio::test]
    async fn test_previous_endpoint_tried_first() {
        let f = fixture(FakeProbe::new(&[("e1", None), ("e2", Some(60))]), vec![]);
        let a = location("a", &["e1", "e2"]);
        seed(&f.registry, vec![a.clone()]).await;

        f.registry.resolve_endpoint(&a, false).await.unwrap();
        f.registry.resolve_endpoint(&a, false).await.unwrap();

        assert_eq!(f.probe.calls(), vec!["e1", "e2", "e2"]);
    }

    #[tokio::test]
    async fn test_nothing_answers_falls_back_to_first() {
        let f = fixture(FakeProbe::new(&[]), vec![]);
        let a = location("a", &["e1", "e2"]);
        seed(&f.registry, vec![a.clone()]).await;

        let endpoint = f.registry.resolve_endpoint(&a, true).await.unwrap();

        assert_eq!(endpoint.id, "e1");
        assert_eq!(f.probe.call_count(), 2);
        let cached = f.registry.find(&a.id).await.unwrap();
        assert!(!cached.available());
        assert!(cached.endpoint().is_none());
    }

    #[tokio::test]
    async fn test_no_endpoints_is_an_error() {
        let f = fixture(FakeProbe::new(&[]), vec![]);
        let empty = location("void", &[]);

        let result = f.registry.resolve_endpoint(&empty, false).await;

        assert!(matches!(result, Err(RegistryError::NoEndpoints(id)) if id.as_str() == "void"));
        assert!(!f.registry.is_measuring());
    }

    #[tokio::test]
    async fn test_concurrent_bulk_measure_probes_once() {
        let f = fixture(
            FakeProbe::new(&[("a1", Some(30)), ("b1", Some(50)), ("c1", Some(70))]),
            vec![],
        );
        seed(
            &f.registry,
            vec![location("a", &["a1"]), location("b", &["b1"]), location("c", &["c1"])],
        )
        .await;

        tokio::join!(f.registry.measure_all_pings(), f.registry.measure_all_pings());
        f.registry.measure_all_pings().await;

        assert_eq!(f.probe.call_count(), 3);
        assert!(!f.registry.is_measuring());
    }

    #[tokio::test]
    async fn test_location_being_resolved_is_skipped() {
        let f = fixture(
            FakeProbe::new(&[("a1", Some(30)), ("b1", Some(50))]).with_delay(Duration::from_millis(50)),
            vec![],
        );
        let a = location("a", &["a1"]);
        seed(&f.registry, vec![a.clone(), location("b", &["b1"])]).await;

        let (resolved, _) = tokio::join!(f.registry.resolve_endpoint(&a, false), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            f.registry.measure_all_pings().await
        });

        assert_eq!(resolved.unwrap().id, "a1");
        let mut calls = f.probe.calls();
        calls.sort();
        assert_eq!(calls, vec!["a1", "b1"]);
    }

    #[tokio::test]
    async fn test_resolve_waits_for_running_bulk_measurement() {
        let f = fixture(
            FakeProbe::new(&[("a1", Some(30)), ("b1", Some(50))]).with_delay(Duration::from_millis(50)),
            vec![],
        );
        let a = location("a", &["a1"]);
        seed(&f.registry, vec![a.clone(), location("b", &["b1"])]).await;

        let (_, resolved) = tokio::join!(f.registry.measure_all_pings(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let during = f.registry.is_measuring();
            (during, f.registry.resolve_endpoint(&a, false).await)
        });

        let (during, resolved) = resolved;
        assert!(during);
        assert_eq!(resolved.unwrap().id, "a1");
        let mut calls = f.probe.calls();
        calls.sort();
        assert_eq!(calls, vec!["a1", "b1"]);
        assert!(!f.registry.is_measuring());
        assert_eq!(f.registry.find(&a.id).await.unwrap().ping(), Some(30));
    }

    #[tokio::test]
    async fn test_load_marks_measuring_before_returning() {
        let f = fixture(
            FakeProbe::new(&[("a1", Some(30))]),
            vec![location_data("a", &["a1"])],
        );

        f.registry.load_from_server("app", "token").await.unwrap();
        assert!(f.registry.is_measuring());
        // The pass already owns a: an explicit pass right after is a no-op
        f.registry.measure_all_pings().await;

        settle(&f.registry).await;
        assert_eq!(f.probe.call_count(), 1);
        assert_eq!(f.registry.find(&LocationId::from("a")).await.unwrap().ping(), Some(30));
    }

    #[tokio::test]
    async fn test_reload_prunes_vanished_locations() {
        let f = fixture(
            FakeProbe::new(&[("a1", Some(30)), ("b1", Some(50))]),
            vec![location_data("a", &["a1"]), location_data("b", &["b1"])],
        );
        f.registry.load_from_server("app", "token").await.unwrap();
        settle(&f.registry).await;
        assert_eq!(f.registry.cache().len(), 2);

        f.backend.set(vec![location_data("a", &["a1"])]);
        f.registry.load_from_server("app", "token").await.unwrap();
        settle(&f.registry).await;

        let cache = f.registry.cache();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(&LocationId::from("a")));
        assert!(!cache.contains_key(&LocationId::from("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_freshness() {
        let f = fixture(FakeProbe::new(&[("a1", Some(30)), ("b1", None)]), vec![]);
        seed(&f.registry, vec![location("a", &["a1"]), location("b", &["b1"])]).await;

        f.registry.measure_all_pings().await;
        assert_eq!(f.probe.calls(), vec!["a1", "b1"]);

        // a is fresh, b has no ping
        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        f.registry.measure_all_pings().await;
        assert_eq!(f.probe.call_count(), 3);
        assert_eq!(f.probe.calls()[2], "b1");

        // Past the TTL a is due again
        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        f.registry.measure_all_pings().await;
        let mut last_pass = f.probe.calls()[3..].to_vec();
        last_pass.sort();
        assert_eq!(last_pass, vec!["a1", "b1"]);
    }

    #[tokio::test]
    async fn test_load_carries_ping_state_over() {
        let f = fixture(
            FakeProbe::new(&[("a1", Some(30))]),
            vec![location_data("a", &["a1"])],
        );

        let loaded = f.registry.load_from_server("app", "token").await.unwrap();
        assert_eq!(loaded.len(), 1);
        settle(&f.registry).await;
        assert_eq!(f.probe.call_count(), 1);

        f.backend.set(vec![location_data("a", &["a1"]), location_data("b", &[])]);
        let reloaded = f.registry.load_from_server("app", "token").await.unwrap();

        let a = reloaded.iter().find(|l| l.id.as_str() == "a").unwrap();
        assert_eq!(a.ping(), Some(30));
        assert_eq!(a.endpoint().map(|e| e.id.as_str()), Some("a1"));
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_server_list_keeps_state() {
        let f = fixture(FakeProbe::new(&[]), vec![location_data("a", &["a1"])]);
        f.registry.load_from_server("app", "token").await.unwrap();
        f.registry.set_selected(&LocationId::from("a"), true).await.unwrap();
        let mut rx = f.bus.subscribe();

        f.backend.set(vec![]);
        let kept = f.registry.load_from_server("app", "token").await.unwrap();

        assert_eq!(kept.len(), 1);
        assert_eq!(f.registry.get_all().await.len(), 1);
        assert_eq!(f.registry.get_selected().await.map(|l| l.id), Some(LocationId::from("a")));
        assert!(!matches!(rx.try_recv(), Ok(Notification::LocationsUpdated(_))));
        assert_eq!(f.backend.fetches(), 2);
    }

    #[tokio::test]
    async fn test_selection_persisted_and_lazily_loaded() {
        let f = fixture(FakeProbe::new(&[]), vec![]);
        seed(&f.registry, vec![location("a", &["a1"])]).await;
        let mut rx = f.bus.subscribe();
        assert!(f.registry.get_selected().await.is_none());

        f.registry.set_selected(&LocationId::from("a"), true).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            Notification::SelectedLocationChanged { selected_by_user: true, .. }
        ));

        // A second registry over the same settings sees the selection
        let restarted = LocationRegistry::new(
            &RegistryConfig::default(),
            f.backend.clone(),
            f.probe.clone(),
            f.settings.clone(),
            f.bus.clone(),
        );
        let info = restarted.selected_info().await.unwrap();
        assert_eq!(info.id, LocationId::from("a"));
        assert!(info.selected_by_user);
        // Not in this registry's (empty) list yet
        assert!(restarted.get_selected().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_stops_on_cancel() {
        let f = fixture(FakeProbe::new(&[("a1", None)]), vec![]);
        seed(&f.registry, vec![location("a", &["a1"])]).await;
        let cancel = CancellationToken::new();

        let handle = f.registry.spawn_refresh(Duration::from_secs(300), cancel.clone());
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(f.probe.call_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(f.probe.call_count(), 1);
    }
}
