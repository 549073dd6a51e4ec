//! Connectivity Manager
//!
//! Single owned instance wiring the registry, selector, state machine and
//! control channel together. Applications hold one of these and talk to it
//! instead of to the components.

use crate::config::ConnectivityConfig;
use crate::events::{EventBus, InMemoryEventBus, Notification};
use crate::location::{Location, LocationId, SelectedLocation};
use crate::machine::{ConnectError, ConnectionStateMachine, MachineHandle, StateSnapshot};
use crate::monitor::{ChannelEvent, ControlChannel};
use crate::ports::{CredentialsProvider, LocationsBackend, ProxySink, SettingsStore};
use crate::probe::PingProbe;
use crate::registry::{LocationRegistry, RegistryError};
use crate::selector::EndpointSelector;
use crate::state::ConnectionState;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// External collaborators the manager is built from
pub struct Collaborators {
    pub backend: Arc<dyn LocationsBackend>,
    pub probe: Arc<dyn PingProbe>,
    pub settings: Arc<dyn SettingsStore>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub proxy: Arc<dyn ProxySink>,
    pub channel: Arc<dyn ControlChannel>,
}

/// Connectivity Manager
pub struct ConnectivityManager {
    config: ConnectivityConfig,
    bus: Arc<InMemoryEventBus>,
    policy: Arc<LocationPolicy>,
    machine: MachineHandle,
    channel: Arc<dyn ControlChannel>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectivityManager {
    /// Build the control plane; must be called inside a tokio runtime
    pub fn new(config: ConnectivityConfig, parts: Collaborators) -> Self {
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = Arc::new(LocationRegistry::new(
            &config.registry,
            parts.backend,
            parts.probe,
            parts.settings,
            bus.clone(),
        ));
        let selector = Arc::new(EndpointSelector::new(registry.clone(), &config.selector));

        let machine = ConnectionStateMachine::spawn(
            config.backoff.clone(),
            selector.clone(),
            parts.credentials.clone(),
            parts.proxy,
            parts.channel.clone(),
            bus.clone(),
        );

        let policy = Arc::new(LocationPolicy {
            registry,
            selector,
            machine: machine.clone(),
            credentials: parts.credentials.clone(),
        });

        let cancel = CancellationToken::new();
        let forwarder = forward_channel_events(
            parts.channel.subscribe(),
            parts.credentials.clone(),
            bus.clone(),
            cancel.child_token(),
        );
        let token_watch = watch_tokens(
            parts.credentials.tokens_changed(),
            policy.clone(),
            cancel.child_token(),
        );

        info!("Connectivity manager started");
        Self {
            config,
            bus,
            policy,
            machine,
            channel: parts.channel,
            cancel,
            tasks: Mutex::new(vec![forwarder, token_watch]),
        }
    }

    pub fn connect(&self) {
        self.machine.connect();
    }

    pub fn disconnect(&self) {
        self.machine.disconnect();
    }

    /// The network came back online
    pub fn network_online(&self) {
        self.machine.network_online();
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.machine.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<StateSnapshot> {
        self.machine.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    pub fn registry(&self) -> &Arc<LocationRegistry> {
        &self.policy.registry
    }

    pub async fn locations(&self) -> Vec<Location> {
        self.policy.registry.get_all().await
    }

    pub async fn selected_location(&self) -> Option<Location> {
        self.policy.registry.get_selected().await
    }

    /// Latency of the control channel, `None` when not connected
    pub fn current_ping(&self) -> Option<u32> {
        self.channel.last_ping()
    }

    /// User picked a location; an active connection moves to it
    pub async fn select_location(&self, id: &LocationId) -> Result<(), RegistryError> {
        let registry = &self.policy.registry;
        if registry.find(id).await.is_none() {
            return Err(RegistryError::UnknownLocation(id.clone()));
        }

        registry.set_selected(id, true).await?;
        if self.state().is_active() {
            info!(location = %id, "Selection changed while active, reconnecting");
            self.machine.reconnect();
        }
        Ok(())
    }

    /// Reload locations and apply the default selection policy
    pub async fn refresh_locations(&self) -> Result<Vec<Location>, ConnectError> {
        self.policy.refresh_locations().await
    }

    /// Account tokens changed: reload, and move off premium locations
    /// the account lost access to
    ///
    /// Runs on its own whenever the credentials provider signals a change.
    pub async fn on_tokens_changed(&self) -> Result<(), ConnectError> {
        self.policy.on_tokens_changed().await
    }

    /// Re-ping every location periodically until shutdown
    pub fn start_background_refresh(&self) {
        let interval = self.config.registry.refresh_interval();
        let task = self
            .policy
            .registry
            .spawn_refresh(interval, self.cancel.child_token());
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Disconnect and stop every background task
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.machine.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(notifications = self.bus.published(), "Connectivity manager stopped");
    }
}

/// Selection rules shared by the manager and its token watcher
struct LocationPolicy {
    registry: Arc<LocationRegistry>,
    selector: Arc<EndpointSelector>,
    machine: MachineHandle,
    credentials: Arc<dyn CredentialsProvider>,
}

impl LocationPolicy {
    async fn refresh_locations(&self) -> Result<Vec<Location>, ConnectError> {
        let token = self.credentials.vpn_token().await?;
        let app_id = self.credentials.app_id();
        let all = self.registry.load_from_server(&app_id, &token.token).await?;

        let selected = self
            .registry
            .selected_info()
            .await
            .filter(|s| all.iter().any(|l| l.id == s.id));
        if self.selector.should_auto_select(selected.as_ref(), self.machine.state()) {
            self.auto_select(selected.as_ref(), &all, token.premium).await;
        }
        Ok(all)
    }

    async fn on_tokens_changed(&self) -> Result<(), ConnectError> {
        let all = self.refresh_locations().await?;
        if self.credentials.is_premium_token().await {
            return Ok(());
        }

        let Some(current) = self.registry.get_selected().await else {
            return Ok(());
        };
        if !current.premium_only {
            return Ok(());
        }

        match self.selector.premium_substitute(&current, &all) {
            Some(substitute) => {
                info!(from = %current.id, to = %substitute.id, "Premium access lost, switching location");
                self.registry.set_selected(&substitute.id, false).await?;
                if self.machine.state().is_active() {
                    self.machine.reconnect();
                }
            }
            None => warn!(location = %current.id, "Premium access lost and no substitute location"),
        }
        Ok(())
    }

    async fn auto_select(&self, selected: Option<&SelectedLocation>, all: &[Location], premium: bool) {
        let Some(best) = self.selector.pick_default_location(all, premium).await else {
            debug!("No location to auto-select");
            return;
        };
        if selected.is_some_and(|s| s.id == best.id) {
            return;
        }
        if let Err(e) = self.registry.set_selected(&best.id, false).await {
            warn!("Failed to store automatic selection: {}", e);
        }
    }
}

/// Re-apply the selection rules whenever the account tokens change
fn watch_tokens(
    mut changes: broadcast::Receiver<()>,
    policy: Arc<LocationPolicy>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => change,
            };
            if let Err(RecvError::Closed) = change {
                break;
            }

            debug!("Account tokens changed");
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = policy.on_tokens_changed() => {
                    if let Err(e) = result {
                        warn!("Applying token change failed: {}", e);
                    }
                }
            }
        }
    })
}

/// Turn channel events into bus notifications
fn forward_channel_events(
    mut events: broadcast::Receiver<ChannelEvent>,
    credentials: Arc<dyn CredentialsProvider>,
    bus: Arc<dyn EventBus>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(ChannelEvent::Ping { ping, .. }) => {
                    bus.publish(Notification::ConnectivityPing { ping });
                }
                Ok(ChannelEvent::ConnectivityInfo {
                    bytes_downloaded,
                    bytes_uploaded,
                    refresh_tokens,
                }) => {
                    bus.publish(Notification::TrafficStatsUpdated {
                        bytes_downloaded,
                        bytes_uploaded,
                    });
                    if refresh_tokens {
                        debug!("Server asked for a token refresh");
                        if let Err(e) = credentials.refresh_tokens().await {
                            warn!("Token refresh failed: {}", e);
                        }
                    }
                }
                Ok(ChannelEvent::ServerError { code, payload }) => {
                    debug!(%code, "Forwarding server error");
                    bus.publish(Notification::ServerError { code, payload });
                }
                Ok(ChannelEvent::DnsServer { dns_server }) => {
                    bus.publish(Notification::DnsServerSet { dns_server });
                }
                Ok(ChannelEvent::Opened { session }) => debug!(session, "Channel opened"),
                Ok(ChannelEvent::Closed { session, clean, .. }) => {
                    debug!(session, clean, "Channel closed");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Channel events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::LocalProxy;
    use crate::settings::MemorySettingsStore;
    use crate::test_support::{location_data, FakeBackend, FakeChannel, FakeCredentials, FakeProbe};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        manager: ConnectivityManager,
        backend: Arc<FakeBackend>,
        credentials: Arc<FakeCredentials>,
        proxy: Arc<LocalProxy>,
        channel: Arc<FakeChannel>,
    }

    impl Fixture {
        fn hosts(&self) -> Vec<String> {
            self.channel.opened_hosts.lock().unwrap().clone()
        }

        async fn wait_for(&self, state: ConnectionState) {
            let mut rx = self.manager.watch();
            tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| s.state == state))
                .await
                .expect("state not reached")
                .expect("machine stopped");
        }

        async fn wait_for_host(&self, host: &str) {
            for _ in 0..1_000 {
                if self.hosts().iter().any(|h| h == host) && self.manager.state().is_connected() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("never connected to {}", host);
        }
    }

    fn fixture() -> Fixture {
        let mut premium = location_data("nycp", &["nycp1"]);
        premium.premium_only = true;
        premium.city_name = "NYC".into();
        let mut nyc = location_data("nyc", &["nyc1"]);
        nyc.city_name = "NYC".into();

        let backend = Arc::new(FakeBackend::new(vec![
            location_data("fra", &["fra1"]),
            location_data("ams", &["ams1"]),
            premium,
            nyc,
        ]));
        let probe = FakeProbe::new(&[
            ("fra1", Some(40)),
            ("ams1", Some(15)),
            ("nycp1", Some(5)),
            ("nyc1", Some(90)),
        ]);
        let credentials = Arc::new(FakeCredentials::new());
        let proxy = Arc::new(LocalProxy::default());
        let channel = Arc::new(FakeChannel::new());

        let manager = ConnectivityManager::new(
            ConnectivityConfig::default(),
            Collaborators {
                backend: backend.clone(),
                probe: Arc::new(probe),
                settings: Arc::new(MemorySettingsStore::new()),
                credentials: credentials.clone(),
                proxy: proxy.clone(),
                channel: channel.clone(),
            },
        );

        Fixture {
            manager,
            backend,
            credentials,
            proxy,
            channel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_auto_selects_fastest_allowed() {
        let f = fixture();

        let all = f.manager.refresh_locations().await.unwrap();
        assert_eq!(all.len(), 4);

        let selected = f.manager.registry().selected_info().await.unwrap();
        assert_eq!(selected.id.as_str(), "ams");
        assert!(!selected.selected_by_user);
        assert_eq!(f.manager.selected_location().await.unwrap().ping(), Some(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_selection_survives_refresh() {
        let f = fixture();
        f.manager.refresh_locations().await.unwrap();

        f.manager.select_location(&LocationId::from("fra")).await.unwrap();
        f.manager.refresh_locations().await.unwrap();

        let selected = f.manager.registry().selected_info().await.unwrap();
        assert_eq!(selected.id.as_str(), "fra");
        assert!(selected.selected_by_user);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_unknown_location() {
        let f = fixture();
        f.manager.refresh_locations().await.unwrap();

        let err = f.manager.select_location(&LocationId::from("nowhere")).await;
        assert!(matches!(err, Err(RegistryError::UnknownLocation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_while_connected_reconnects() {
        let f = fixture();
        f.manager.refresh_locations().await.unwrap();
        f.manager.connect();
        f.wait_for_host("abc.ams1.example.org").await;
        assert_eq!(f.manager.current_ping(), Some(42));

        f.manager.select_location(&LocationId::from("fra")).await.unwrap();
        f.wait_for_host("abc.fra1.example.org").await;

        assert_eq!(f.proxy.current_location().unwrap().as_str(), "fra");
        assert!(f.proxy.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_premium_downgrade_moves_to_same_city() {
        let f = fixture();
        f.credentials.premium.store(true, Ordering::SeqCst);
        f.manager.refresh_locations().await.unwrap();
        f.manager.select_location(&LocationId::from("nycp")).await.unwrap();
        f.manager.connect();
        f.wait_for_host("abc.nycp1.example.org").await;

        f.credentials.premium.store(false, Ordering::SeqCst);
        f.manager.on_tokens_changed().await.unwrap();

        let selected = f.manager.registry().selected_info().await.unwrap();
        assert_eq!(selected.id.as_str(), "nyc");
        assert!(!selected.selected_by_user);
        f.wait_for_host("abc.nyc1.example.org").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_events_become_notifications() {
        let f = fixture();
        let mut events = f.manager.subscribe();
        tokio::task::yield_now().await;

        f.channel.push(ChannelEvent::ConnectivityInfo {
            bytes_downloaded: 10,
            bytes_uploaded: 20,
            refresh_tokens: true,
        });
        f.channel.push(ChannelEvent::Ping {
            session: 1,
            ping: Some(33),
        });
        f.channel.push(ChannelEvent::DnsServer {
            dns_server: "10.0.0.53".into(),
        });
        f.channel.push(ChannelEvent::ServerError {
            code: "E42".into(),
            payload: "quota".into(),
        });

        // The token refresh also reloads locations; keep only channel events
        let channel_events = ["TRAFFIC_STATS_UPDATED", "CONNECTIVITY_PING", "DNS_SERVER_SET", "SERVER_ERROR"];
        let mut names = Vec::new();
        while names.len() < 4 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if channel_events.contains(&event.name()) {
                names.push(event.name());
            }
        }

        assert_eq!(
            names,
            vec!["TRAFFIC_STATS_UPDATED", "CONNECTIVITY_PING", "DNS_SERVER_SET", "SERVER_ERROR"]
        );
        assert_eq!(f.credentials.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_token_refresh_reloads_and_drops_premium() {
        let f = fixture();
        f.credentials.premium.store(true, Ordering::SeqCst);
        f.manager.refresh_locations().await.unwrap();
        f.manager.select_location(&LocationId::from("nycp")).await.unwrap();
        assert_eq!(f.backend.fetches(), 1);

        f.credentials.premium.store(false, Ordering::SeqCst);
        f.channel.push(ChannelEvent::ConnectivityInfo {
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            refresh_tokens: true,
        });

        for _ in 0..1_000 {
            let selected = f.manager.registry().selected_info().await.unwrap();
            if selected.id.as_str() == "nyc" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let selected = f.manager.registry().selected_info().await.unwrap();
        assert_eq!(selected.id.as_str(), "nyc");
        assert!(!selected.selected_by_user);
        assert_eq!(f.credentials.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(f.backend.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_and_stops_refresh() {
        let f = fixture();
        f.manager.refresh_locations().await.unwrap();
        f.manager.start_background_refresh();
        f.manager.connect();
        f.wait_for(ConnectionState::Connected).await;

        f.manager.shutdown().await;

        assert_eq!(f.manager.state(), ConnectionState::DisconnectedIdle);
        assert!(!f.proxy.is_enabled());
        assert_eq!(f.manager.current_ping(), None);
    }
}
