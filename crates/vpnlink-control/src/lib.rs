//! vpnlink control plane - Connectivity Management
//!
//! Decides when and where the proxy tunnel connects, keeps latency data for
//! every location fresh, and recovers from endpoint, channel and network
//! failures without leaving the proxy enabled behind a dead tunnel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ConnectivityManager                       │
//! │                                                               │
//! │  ┌──────────────┐   connect    ┌──────────────────────────┐   │
//! │  │ MachineHandle│─────────────▶│ ConnectionStateMachine   │   │
//! │  └──────────────┘              │ (actor + backoff timer)  │   │
//! │                                └───────┬──────────┬───────┘   │
//! │                     selected location  │          │ open      │
//! │  ┌──────────────────┐   ┌──────────────▼───┐  ┌───▼────────┐  │
//! │  │ LocationRegistry │◀──│ EndpointSelector │  │ Monitor    │  │
//! │  │ (ping cache)     │   └──────────────────┘  │ (ws + pb)  │  │
//! │  └────────┬─────────┘                         └────────────┘  │
//! │           │ probe                                             │
//! │  ┌────────▼─────────┐                                         │
//! │  │ HttpPingProbe    │  https://ping.<domain>/  x3, capped     │
//! │  └──────────────────┘                                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collaborators outside the control plane (credentials, proxy
//! configuration, settings persistence, location backend) are reached only
//! through the traits in [`ports`]. Observers subscribe to the
//! [`InMemoryEventBus`] instead of polling.

mod backend;
mod config;
mod events;
mod keys;
mod location;
mod machine;
mod manager;
mod monitor;
mod probe;
mod protocol;
mod proxy;
mod registry;
mod selector;
mod settings;
mod state;

pub mod ports;

#[cfg(test)]
mod test_support;

pub use backend::{LocationCatalog, StaticLocationsBackend};
pub use config::{
    BackoffConfig, ConfigError, ConnectivityConfig, MonitorConfig, ProbeConfig, RegistryConfig,
    SelectorConfig,
};
pub use events::{EventBus, InMemoryEventBus, LocationState, Notification};
pub use keys::{KeyError, PublicKey};
pub use location::{
    Coordinates, Endpoint, EndpointData, EndpointDataError, Location, LocationData, LocationId,
    SelectedLocation,
};
pub use machine::{
    channel_host, ConnectError, ConnectionStateMachine, MachineHandle, StateSnapshot,
};
pub use manager::{Collaborators, ConnectivityManager};
pub use monitor::{ChannelEvent, ConnectivityMonitor, ControlChannel, MonitorError};
pub use probe::{HttpPingProbe, PingProbe};
pub use protocol::{ChannelMessage, ProtocolError};
pub use proxy::{LocalProxy, ProxyError, Route, DEFAULT_TUNNEL_PORT};
pub use registry::{LocationRegistry, RegistryError, SELECTED_LOCATION_KEY};
pub use selector::EndpointSelector;
pub use settings::{FileSettingsStore, MemorySettingsStore, SettingsError};
pub use state::{transition, Action, ConnectMode, ConnectionState, RetryContext, Transition, Trigger};
