//! Notification Bus
//!
//! Fire-and-forget publication of named events for the UI layer. Delivery
//! is in publication order to every live subscriber; nothing is persisted
//! or replayed to late subscribers.

use crate::location::{Location, LocationId};
use crate::state::{ConnectionState, RetryContext};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// Maximum notifications buffered per subscriber before it starts lagging
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Live ping state of one location
#[derive(Debug, Clone, PartialEq)]
pub struct LocationState {
    pub location_id: LocationId,
    pub ping: Option<u32>,
    pub available: bool,
    pub endpoint_id: Option<String>,
}

/// Events published by the control plane
#[derive(Debug, Clone)]
pub enum Notification {
    /// A location was (re)measured
    LocationStateUpdated(LocationState),
    /// The location list was replaced
    LocationsUpdated(Vec<Location>),
    /// The persisted selection changed
    SelectedLocationChanged {
        location_id: LocationId,
        selected_by_user: bool,
    },
    /// The connection state machine transitioned
    ConnectivityStateChanged {
        state: ConnectionState,
        context: RetryContext,
    },
    /// A connection attempt failed
    ConnectionFail { reason: String },
    /// Channel ping round finished
    ConnectivityPing { ping: Option<u32> },
    /// Server-pushed traffic counters
    TrafficStatsUpdated {
        bytes_downloaded: u64,
        bytes_uploaded: u64,
    },
    /// Server-pushed error code
    ServerError { code: String, payload: String },
    /// Server-forced DNS server
    DnsServerSet { dns_server: String },
}

impl Notification {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Notification::LocationStateUpdated(_) => "LOCATION_STATE_UPDATED",
            Notification::LocationsUpdated(_) => "LOCATIONS_UPDATED",
            Notification::SelectedLocationChanged { .. } => "SELECTED_LOCATION_CHANGED",
            Notification::ConnectivityStateChanged { .. } => "CONNECTIVITY_STATE_CHANGED",
            Notification::ConnectionFail { .. } => "CONNECTION_FAIL",
            Notification::ConnectivityPing { .. } => "CONNECTIVITY_PING",
            Notification::TrafficStatsUpdated { .. } => "TRAFFIC_STATS_UPDATED",
            Notification::ServerError { .. } => "SERVER_ERROR",
            Notification::DnsServerSet { .. } => "DNS_SERVER_SET",
        }
    }
}

/// Publishing side of the bus
pub trait EventBus: Send + Sync {
    /// Publish without waiting for subscribers
    fn publish(&self, notification: Notification);
}

/// In-memory bus over `tokio::sync::broadcast`
pub struct InMemoryEventBus {
    sender: broadcast::Sender<Notification>,
    published: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Receive every notification published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Total notifications published, with or without subscribers
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, notification: Notification) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let name = notification.name();

        // No subscribers is not an error
        let receivers = self.sender.send(notification).unwrap_or(0);
        trace!(event = name, receivers, "Notification published");
    }
}
