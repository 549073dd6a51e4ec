//! Connection State Table
//!
//! Pure description of the connection lifecycle: which trigger moves which
//! state where, and which actions run on leaving and entering each state.
//! The machine in [`crate::machine`] interprets it; nothing here does I/O.
//!
//! ```text
//!                    Connect                     Succeeded
//!  DisconnectedIdle ─────────▶ ConnectingIdle ──────────────▶ Connected
//!         ▲                         │ Failed                    │ │
//!         │ Disconnect              ▼                 ChannelClosed│
//!         └──────────────── DisconnectedRetrying ◀──────────────┘ │
//!                              │   ▲                               │
//!           backoff elapsed    ▼   │ Failed                         │
//!                         ConnectingRetrying ─────────────────▶────┘
//!                                              Succeeded
//! ```

use crate::config::BackoffConfig;
use std::fmt;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected and not trying to
    #[default]
    DisconnectedIdle,
    /// Waiting out the backoff delay before the next attempt
    DisconnectedRetrying,
    /// First attempt after an explicit request
    ConnectingIdle,
    /// Automatic attempt after a failure
    ConnectingRetrying,
    /// Tunnel up and channel open
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectingIdle | ConnectionState::ConnectingRetrying
        )
    }

    /// Neither connected nor on the way there
    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::DisconnectedIdle)
    }

    /// Connected, connecting, or about to retry
    pub fn is_active(&self) -> bool {
        !self.is_idle()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::DisconnectedIdle => "disconnectedIdle",
            ConnectionState::DisconnectedRetrying => "disconnectedRetrying",
            ConnectionState::ConnectingIdle => "connectingIdle",
            ConnectionState::ConnectingRetrying => "connectingRetrying",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Inputs to the state table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ConnectRequested,
    DisconnectRequested,
    /// Location or account changed while active
    ReconnectRequested,
    ConnectionSucceeded,
    ConnectionFailed,
    /// The connectivity channel closed or errored without being asked to
    ChannelClosed,
    RetryTimerElapsed,
    NetworkOnline,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start the connect sequence for the state being entered
    StartConnect,
    /// Cancel the in-flight connect sequence
    CancelConnect,
    /// Close the channel and disable the proxy
    TearDown,
    /// Arm the backoff timer with the current delay
    ScheduleRetry,
    CancelRetryTimer,
    /// Grow the backoff delay for the next retry
    IncreaseBackoff,
    /// Count the retry and the time spent waiting for it
    RecordRetry,
    ResetContext,
}

/// Result of looking up a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl Transition {
    /// Actions run before the state changes
    pub fn exit_actions(&self) -> &'static [Action] {
        exit_actions(self.from)
    }

    /// Actions run after the state changes
    pub fn entry_actions(&self) -> &'static [Action] {
        entry_actions(self.to)
    }
}

/// Look up the transition for `trigger` in `state`; `None` means ignored
pub fn transition(state: ConnectionState, trigger: Trigger) -> Option<Transition> {
    use ConnectionState::*;
    use Trigger::*;

    let to = match (state, trigger) {
        (DisconnectedIdle, ConnectRequested) => ConnectingIdle,

        (DisconnectedRetrying, ConnectRequested) => ConnectingRetrying,
        (DisconnectedRetrying, RetryTimerElapsed) => ConnectingRetrying,
        (DisconnectedRetrying, NetworkOnline) => ConnectingRetrying,
        (DisconnectedRetrying, ReconnectRequested) => ConnectingIdle,
        (DisconnectedRetrying, DisconnectRequested) => DisconnectedIdle,

        (ConnectingIdle | ConnectingRetrying, ConnectionSucceeded) => Connected,
        (ConnectingIdle | ConnectingRetrying, ConnectionFailed | ChannelClosed) => {
            DisconnectedRetrying
        }
        (ConnectingIdle | ConnectingRetrying, DisconnectRequested) => DisconnectedIdle,
        // A fresh request restarts the attempt
        (ConnectingIdle | ConnectingRetrying, ConnectRequested | ReconnectRequested) => {
            ConnectingIdle
        }

        (Connected, DisconnectRequested) => DisconnectedIdle,
        (Connected, ChannelClosed) => DisconnectedRetrying,
        (Connected, ReconnectRequested) => ConnectingIdle,

        _ => return None,
    };

    Some(Transition { from: state, to })
}

fn exit_actions(state: ConnectionState) -> &'static [Action] {
    match state {
        ConnectionState::DisconnectedIdle => &[],
        ConnectionState::DisconnectedRetrying => &[Action::CancelRetryTimer],
        ConnectionState::ConnectingIdle | ConnectionState::ConnectingRetrying => {
            &[Action::CancelConnect]
        }
        ConnectionState::Connected => &[Action::TearDown],
    }
}

fn entry_actions(state: ConnectionState) -> &'static [Action] {
    match state {
        ConnectionState::DisconnectedIdle => &[Action::TearDown, Action::ResetContext],
        ConnectionState::DisconnectedRetrying => &[
            Action::TearDown,
            Action::ScheduleRetry,
            Action::IncreaseBackoff,
        ],
        ConnectionState::ConnectingIdle => &[Action::StartConnect],
        ConnectionState::ConnectingRetrying => &[Action::RecordRetry, Action::StartConnect],
        ConnectionState::Connected => &[Action::ResetContext],
    }
}

/// How the connect sequence should resolve its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Explicit request: full endpoint search
    Fresh,
    /// Automatic retry: re-validate the last good endpoint only
    Retry,
    /// Stuck retrying: refresh tokens and locations, then search again
    Escalate,
}

/// Retry bookkeeping carried across transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    pub retry_count: u32,
    pub retry_time_accumulated_ms: u64,
    pub current_backoff_delay_ms: u64,
    pub has_tried_alternate_endpoint: bool,
}

impl RetryContext {
    pub fn new(backoff: &BackoffConfig) -> Self {
        Self {
            retry_count: 0,
            retry_time_accumulated_ms: 0,
            current_backoff_delay_ms: backoff.initial_delay_ms,
            has_tried_alternate_endpoint: false,
        }
    }

    /// Grow the delay used for the next scheduled retry
    pub fn increase_backoff(&mut self, backoff: &BackoffConfig) {
        self.current_backoff_delay_ms = backoff.next_delay_ms(self.current_backoff_delay_ms);
    }

    pub fn record_retry(&mut self, waited_ms: u64) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_time_accumulated_ms = self.retry_time_accumulated_ms.saturating_add(waited_ms);
    }

    /// Mode for the attempt that follows a recorded retry
    ///
    /// Escalates at most once: the first call past the threshold marks the
    /// alternate attempt as made.
    pub fn next_mode(&mut self, backoff: &BackoffConfig) -> ConnectMode {
        if self.retry_time_accumulated_ms > backoff.escalation_threshold_ms
            && !self.has_tried_alternate_endpoint
        {
            self.has_tried_alternate_endpoint = true;
            ConnectMode::Escalate
        } else {
            ConnectMode::Retry
        }
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}
