//! Collaborator fakes shared by the unit tests

use crate::keys::PublicKey;
use crate::location::{Endpoint, EndpointData, Location, LocationData};
use crate::monitor::{ChannelEvent, ControlChannel, MonitorError};
use crate::ports::{
    AccessCredentials, BackendError, CredentialsError, CredentialsProvider, LocationsBackend,
    VpnToken,
};
use crate::probe::PingProbe;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

pub const KEY: &str = "WDvCRKv9hVAx1P3L7dKxiNxI3CxbK9Ue1tL8x2ZqRVk=";

pub fn endpoint(id: &str) -> Endpoint {
    Endpoint {
        id: id.to_string(),
        domain_name: format!("{}.example.org", id),
        ipv4_address: None,
        ipv6_address: None,
        public_key: PublicKey::from_bytes([7u8; 32]),
    }
}

pub fn location(id: &str, endpoints: &[&str]) -> Location {
    Location::new(id, id.to_uppercase(), endpoints.iter().map(|e| endpoint(e)).collect())
}

pub fn location_data(id: &str, endpoints: &[&str]) -> LocationData {
    LocationData {
        id: id.to_string(),
        country_name: String::new(),
        country_code: String::new(),
        city_name: id.to_uppercase(),
        premium_only: false,
        coordinates: Default::default(),
        endpoints: endpoints
            .iter()
            .map(|e| EndpointData {
                id: e.to_string(),
                domain_name: format!("{}.example.org", e),
                ipv4_address: None,
                ipv6_address: None,
                public_key: KEY.to_string(),
            })
            .collect(),
        is_virtual: false,
    }
}

pub fn credentials() -> AccessCredentials {
    AccessCredentials {
        token: "channel-token".into(),
        credentials_hash: "hash".into(),
        prefix: "abc".into(),
        username: "user".into(),
        password: "pass".into(),
    }
}

/// Probe answering from a per-endpoint latency table
///
/// Hosts are endpoint ids; unknown ids never answer. Each call sleeps for
/// `delay` first, so concurrent callers overlap.
pub struct FakeProbe {
    latencies: Mutex<HashMap<String, Option<u32>>>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn new(latencies: &[(&str, Option<u32>)]) -> Self {
        Self {
            latencies: Mutex::new(
                latencies
                    .iter()
                    .map(|(id, ms)| (format!("{}.example.org", id), *ms))
                    .collect(),
            ),
            delay: Duration::from_millis(10),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set(&self, endpoint_id: &str, ping: Option<u32>) {
        self.latencies
            .lock()
            .unwrap()
            .insert(format!("{}.example.org", endpoint_id), ping);
    }

    /// Endpoint ids probed so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|h| h.trim_end_matches(".example.org").to_string())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PingProbe for FakeProbe {
    async fn probe(&self, host: &str) -> Option<u32> {
        self.calls.lock().unwrap().push(host.to_string());
        tokio::time::sleep(self.delay).await;
        self.latencies.lock().unwrap().get(host).copied().flatten()
    }
}

/// Backend serving a replaceable list and counting fetches
#[derive(Default)]
pub struct FakeBackend {
    locations: Mutex<Vec<LocationData>>,
    fetches: AtomicUsize,
}

impl FakeBackend {
    pub fn new(locations: Vec<LocationData>) -> Self {
        Self {
            locations: Mutex::new(locations),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, locations: Vec<LocationData>) {
        *self.locations.lock().unwrap() = locations;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationsBackend for FakeBackend {
    async fn fetch_locations(
        &self,
        _app_id: &str,
        _vpn_token: &str,
    ) -> Result<Vec<LocationData>, BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.locations.lock().unwrap().clone())
    }
}

/// Credentials provider that can be held mid-fetch
pub struct FakeCredentials {
    pub premium: AtomicBool,
    pub fail: AtomicBool,
    hold: AtomicBool,
    entered: Notify,
    release: Notify,
    pub fetches: AtomicUsize,
    pub refreshes: AtomicUsize,
    changes: broadcast::Sender<()>,
}

impl FakeCredentials {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(8);
        Self {
            premium: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
            fetches: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            changes,
        }
    }

    /// Make the next credential fetches wait for [`Self::release`]
    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Wait until a held fetch is in progress
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }
}

#[async_trait]
impl CredentialsProvider for FakeCredentials {
    fn app_id(&self) -> String {
        "test-app".into()
    }

    async fn vpn_token(&self) -> Result<VpnToken, CredentialsError> {
        Ok(VpnToken {
            token: "vpn-token".into(),
            premium: self.premium.load(Ordering::SeqCst),
        })
    }

    async fn access_credentials(&self) -> Result<AccessCredentials, CredentialsError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            let released = self.release.notified();
            self.entered.notify_one();
            released.await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CredentialsError::Request("credentials service down".into()));
        }
        Ok(credentials())
    }

    async fn is_premium_token(&self) -> bool {
        self.premium.load(Ordering::SeqCst)
    }

    async fn refresh_tokens(&self) -> Result<(), CredentialsError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let _ = self.changes.send(());
        Ok(())
    }

    fn tokens_changed(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

/// Channel that opens instantly unless told to fail
pub struct FakeChannel {
    pub fail: AtomicBool,
    pub opened_hosts: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    open_session: Mutex<Option<u64>>,
    next_session: AtomicU64,
    events: broadcast::Sender<ChannelEvent>,
}

impl FakeChannel {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            fail: AtomicBool::new(false),
            opened_hosts: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            open_session: Mutex::new(None),
            next_session: AtomicU64::new(1),
            events,
        }
    }

    pub fn current_session(&self) -> Option<u64> {
        *self.open_session.lock().unwrap()
    }

    /// Simulate the server dropping the channel
    pub fn drop_unexpectedly(&self) {
        if let Some(session) = self.open_session.lock().unwrap().take() {
            let _ = self.events.send(ChannelEvent::Closed {
                session,
                clean: false,
                reason: Some("connection reset".into()),
            });
        }
    }

    pub fn push(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ControlChannel for FakeChannel {
    async fn open(&self, host: &str, _token: &str, _hash: &str) -> Result<u64, MonitorError> {
        self.close().await;
        self.opened_hosts.lock().unwrap().push(host.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(MonitorError::Connect("refused".into()));
        }

        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        *self.open_session.lock().unwrap() = Some(session);
        let _ = self.events.send(ChannelEvent::Opened { session });
        Ok(session)
    }

    async fn close(&self) {
        if let Some(session) = self.open_session.lock().unwrap().take() {
            self.closes.fetch_add(1, Ordering::SeqCst);
            let _ = self.events.send(ChannelEvent::Closed {
                session,
                clean: true,
                reason: None,
            });
        }
    }

    fn last_ping(&self) -> Option<u32> {
        self.current_session().map(|_| 42)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
