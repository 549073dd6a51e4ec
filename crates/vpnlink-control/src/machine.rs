//! Connection State Machine
//!
//! Actor task that owns the connection state and interprets the table in
//! [`crate::state`]. Every input arrives as a message, so transitions are
//! serialized: each one runs the old state's exit actions, switches state,
//! runs the new state's entry actions and publishes the new state before
//! the next message is looked at.
//!
//! Work started by a transition (the connect sequence, teardown, the retry
//! timer) runs in its own task and reports back by message:
//! - the connect sequence checks its cancellation token at every step, and
//!   a completion from a cancelled attempt is dropped by attempt id
//! - teardown and a new attempt wait for whatever ran before them, so two
//!   sequences never touch the proxy or the channel at once

use crate::config::BackoffConfig;
use crate::events::{EventBus, Notification};
use crate::location::Location;
use crate::monitor::{ChannelEvent, ControlChannel, MonitorError};
use crate::ports::{CredentialsError, CredentialsProvider, ProxySink};
use crate::proxy::ProxyError;
use crate::registry::RegistryError;
use crate::selector::EndpointSelector;
use crate::state::{transition, Action, ConnectMode, ConnectionState, RetryContext, Trigger};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Current state with its retry context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub context: RetryContext,
}

enum Message {
    Trigger(Trigger),
    AttemptFinished {
        attempt: u64,
        result: Result<u64, ConnectError>,
    },
    RetryTimerElapsed {
        timer: u64,
    },
    ChannelClosed {
        session: u64,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the running machine
#[derive(Clone)]
pub struct MachineHandle {
    tx: mpsc::UnboundedSender<Message>,
    snapshot: watch::Receiver<StateSnapshot>,
}

impl MachineHandle {
    pub fn connect(&self) {
        self.send(Trigger::ConnectRequested);
    }

    pub fn disconnect(&self) {
        self.send(Trigger::DisconnectRequested);
    }

    /// Restart the connection when active (new location, new account)
    pub fn reconnect(&self) {
        self.send(Trigger::ReconnectRequested);
    }

    /// The network came back; retry now instead of after the backoff
    pub fn network_online(&self) {
        self.send(Trigger::NetworkOnline);
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> StateSnapshot {
        *self.snapshot.borrow()
    }

    /// Receiver that sees every published snapshot from now on
    pub fn watch(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshot.clone()
    }

    /// Disconnect, wait for teardown and stop the actor
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.tx.send(Message::Shutdown { done }).is_ok() {
            let _ = finished.await;
        }
    }

    fn send(&self, trigger: Trigger) {
        if self.tx.send(Message::Trigger(trigger)).is_err() {
            warn!(?trigger, "State machine is not running");
        }
    }
}

/// Collaborators used by the connect sequence
struct Wiring {
    backoff: BackoffConfig,
    selector: Arc<EndpointSelector>,
    credentials: Arc<dyn CredentialsProvider>,
    proxy: Arc<dyn ProxySink>,
    channel: Arc<dyn ControlChannel>,
    bus: Arc<dyn EventBus>,
}

struct Attempt {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct RetryTimer {
    id: u64,
    task: JoinHandle<()>,
}

/// The connection lifecycle actor
pub struct ConnectionStateMachine {
    wiring: Arc<Wiring>,
    state: ConnectionState,
    context: RetryContext,
    rx: mpsc::UnboundedReceiver<Message>,
    tx: mpsc::WeakUnboundedSender<Message>,
    snapshot: watch::Sender<StateSnapshot>,
    attempt_seq: u64,
    attempt: Option<Attempt>,
    timer_seq: u64,
    retry_timer: Option<RetryTimer>,
    retry_scheduled_at: Option<Instant>,
    /// Background work the next teardown or attempt must wait for
    barrier: Option<JoinHandle<()>>,
    torn_down: bool,
    session: Option<u64>,
    last_dropped_session: Option<u64>,
}

impl ConnectionStateMachine {
    /// Start the actor in `DisconnectedIdle`
    pub fn spawn(
        backoff: BackoffConfig,
        selector: Arc<EndpointSelector>,
        credentials: Arc<dyn CredentialsProvider>,
        proxy: Arc<dyn ProxySink>,
        channel: Arc<dyn ControlChannel>,
        bus: Arc<dyn EventBus>,
    ) -> MachineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = RetryContext::new(&backoff);
        let (snapshot, snapshot_rx) = watch::channel(StateSnapshot {
            state: ConnectionState::DisconnectedIdle,
            context,
        });

        let machine = Self {
            wiring: Arc::new(Wiring {
                backoff,
                selector,
                credentials,
                proxy,
                channel,
                bus,
            }),
            state: ConnectionState::DisconnectedIdle,
            context,
            rx,
            tx: tx.downgrade(),
            snapshot,
            attempt_seq: 0,
            attempt: None,
            timer_seq: 0,
            retry_timer: None,
            retry_scheduled_at: None,
            barrier: None,
            torn_down: true,
            session: None,
            last_dropped_session: None,
        };
        tokio::spawn(machine.run());

        MachineHandle {
            tx,
            snapshot: snapshot_rx,
        }
    }

    async fn run(mut self) {
        let watcher = self.watch_channel();
        debug!("Connection state machine started");

        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Trigger(trigger) => self.fire(trigger),
                Message::AttemptFinished { attempt, result } => self.on_attempt_finished(attempt, result),
                Message::RetryTimerElapsed { timer } => {
                    if self.retry_timer.as_ref().is_some_and(|t| t.id == timer) {
                        self.fire(Trigger::RetryTimerElapsed);
                    }
                }
                Message::ChannelClosed { session } => self.on_channel_closed(session),
                Message::Shutdown { done } => {
                    self.fire(Trigger::DisconnectRequested);
                    if let Some(barrier) = self.barrier.take() {
                        let _ = barrier.await;
                    }
                    let _ = done.send(());
                    break;
                }
            }
        }

        watcher.abort();
        debug!("Connection state machine stopped");
    }

    /// Forward unexpected channel closes to the actor
    fn watch_channel(&self) -> JoinHandle<()> {
        let mut events = self.wiring.channel.subscribe();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Closed {
                        session,
                        clean: false,
                        ..
                    }) => {
                        let Some(tx) = tx.upgrade() else { break };
                        let _ = tx.send(Message::ChannelClosed { session });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Channel events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn fire(&mut self, trigger: Trigger) {
        let Some(t) = transition(self.state, trigger) else {
            debug!(state = %self.state, ?trigger, "Trigger ignored");
            return;
        };

        for action in t.exit_actions() {
            self.perform(*action);
        }
        self.state = t.to;
        for action in t.entry_actions() {
            self.perform(*action);
        }

        info!(from = %t.from, to = %t.to, ?trigger, "Connection state changed");
        let snapshot = StateSnapshot {
            state: self.state,
            context: self.context,
        };
        self.snapshot.send_replace(snapshot);
        self.wiring.bus.publish(Notification::ConnectivityStateChanged {
            state: snapshot.state,
            context: snapshot.context,
        });
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::StartConnect => self.start_connect(),
            Action::CancelConnect => {
                if let Some(attempt) = self.attempt.take() {
                    debug!(attempt = attempt.id, "Cancelling connect sequence");
                    attempt.cancel.cancel();
                    self.chain_barrier(attempt.task);
                }
            }
            Action::TearDown => self.tear_down(),
            Action::ScheduleRetry => self.schedule_retry(),
            Action::CancelRetryTimer => {
                if let Some(timer) = self.retry_timer.take() {
                    timer.task.abort();
                }
            }
            Action::IncreaseBackoff => self.context.increase_backoff(&self.wiring.backoff),
            Action::RecordRetry => {
                // Time actually spent waiting; a manual connect cuts it short
                let waited = self
                    .retry_scheduled_at
                    .take()
                    .map(|at| at.elapsed().as_millis() as u64)
                    .unwrap_or(0);
                self.context.record_retry(waited);
            }
            Action::ResetContext => self.context = RetryContext::new(&self.wiring.backoff),
        }
    }

    fn start_connect(&mut self) {
        let mode = match self.state {
            ConnectionState::ConnectingRetrying => self.context.next_mode(&self.wiring.backoff),
            _ => ConnectMode::Fresh,
        };

        self.attempt_seq += 1;
        let id = self.attempt_seq;
        let cancel = CancellationToken::new();
        let barrier = self.barrier.take();
        let wiring = self.wiring.clone();
        let tx = self.tx.clone();
        let token = cancel.clone();
        self.torn_down = false;
        self.session = None;

        if mode == ConnectMode::Escalate {
            info!(
                retries = self.context.retry_count,
                waited_ms = self.context.retry_time_accumulated_ms,
                "Retrying for too long, forcing full re-selection"
            );
        }

        let task = tokio::spawn(async move {
            if let Some(barrier) = barrier {
                let _ = barrier.await;
            }

            let started = Instant::now();
            let mut result = wiring.connect(mode, &token).await;

            let failed = matches!(&result, Err(e) if !matches!(e, ConnectError::Cancelled));
            if failed {
                // Keep a failing endpoint from spinning the retry loop
                let pad = wiring
                    .backoff
                    .min_attempt_duration()
                    .saturating_sub(started.elapsed());
                if step(&token, tokio::time::sleep(pad)).await.is_err() {
                    result = Err(ConnectError::Cancelled);
                }
            }

            if token.is_cancelled() {
                debug!(attempt = id, "Discarding cancelled connect sequence");
                return;
            }
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::AttemptFinished { attempt: id, result });
            }
        });

        self.attempt = Some(Attempt { id, cancel, task });
    }

    fn on_attempt_finished(&mut self, attempt: u64, result: Result<u64, ConnectError>) {
        if self.attempt.as_ref().map(|a| a.id) != Some(attempt) {
            debug!(attempt, "Stale connect result dropped");
            return;
        }
        self.attempt = None;

        let result = match result {
            Ok(session) if self.last_dropped_session == Some(session) => Err(ConnectError::ChannelClosed),
            other => other,
        };

        match result {
            Ok(session) => {
                self.session = Some(session);
                self.fire(Trigger::ConnectionSucceeded);
            }
            Err(ConnectError::Cancelled) => {}
            Err(e) => {
                warn!(attempt, "Connection attempt failed: {}", e);
                self.wiring.bus.publish(Notification::ConnectionFail {
                    reason: e.to_string(),
                });
                self.fire(Trigger::ConnectionFailed);
            }
        }
    }

    fn on_channel_closed(&mut self, session: u64) {
        self.last_dropped_session = Some(session);
        if self.session == Some(session) {
            self.session = None;
            self.fire(Trigger::ChannelClosed);
        }
    }

    fn tear_down(&mut self) {
        self.session = None;
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let barrier = self.barrier.take();
        let wiring = self.wiring.clone();
        self.barrier = Some(tokio::spawn(async move {
            if let Some(barrier) = barrier {
                let _ = barrier.await;
            }
            wiring.channel.close().await;
            wiring.proxy.disable().await;
            debug!("Connection torn down");
        }));
    }

    fn schedule_retry(&mut self) {
        self.timer_seq += 1;
        let id = self.timer_seq;
        let delay = std::time::Duration::from_millis(self.context.current_backoff_delay_ms);
        let tx = self.tx.clone();

        info!(delay_ms = self.context.current_backoff_delay_ms, "Retry scheduled");
        self.retry_scheduled_at = Some(Instant::now());
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::RetryTimerElapsed { timer: id });
            }
        });

        self.retry_timer = Some(RetryTimer { id, task });
    }

    fn chain_barrier(&mut self, task: JoinHandle<()>) {
        let previous = self.barrier.take();
        self.barrier = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let _ = task.await;
        }));
    }
}

impl Wiring {
    /// One connect sequence; every await is a cancellation point
    async fn connect(&self, mode: ConnectMode, cancel: &CancellationToken) -> Result<u64, ConnectError> {
        let registry = self.selector.registry();

        if mode == ConnectMode::Escalate {
            step(cancel, self.credentials.refresh_tokens()).await??;
            let token = step(cancel, self.credentials.vpn_token()).await??;
            let app_id = self.credentials.app_id();
            if let Err(e) = step(cancel, registry.load_from_server(&app_id, &token.token)).await? {
                warn!("Location refresh failed, keeping cached list: {}", e);
            }
        }

        let location = match step(cancel, registry.get_selected()).await? {
            Some(location) => location,
            None => step(cancel, self.default_location()).await??,
        };

        let force_previous = mode == ConnectMode::Retry;
        let endpoint = step(cancel, self.selector.selected_endpoint_for(&location, force_previous)).await??;
        debug!(location = %location.id, endpoint = %endpoint.id, ?mode, "Endpoint resolved");

        let target = step(cancel, self.proxy.set_current_endpoint(&endpoint, &location)).await??;
        let credentials = step(cancel, self.credentials.access_credentials()).await??;
        let applied = step(cancel, self.proxy.set_access_credentials(&credentials)).await??;

        let host = channel_host(&credentials.prefix, &applied.domain_name);
        let session = step(
            cancel,
            self.channel
                .open(&host, &credentials.token, &credentials.credentials_hash),
        )
        .await??;

        step(cancel, self.proxy.enable()).await??;
        info!(
            location = %location.id,
            endpoint = %endpoint.id,
            via = %target.connection_host,
            session,
            "Connected"
        );
        Ok(session)
    }

    /// Fastest location, remembered as an automatic choice
    async fn default_location(&self) -> Result<Location, ConnectError> {
        let registry = self.selector.registry();
        let all = registry.get_all().await;
        let premium = self.credentials.is_premium_token().await;

        let location = self
            .selector
            .pick_default_location(&all, premium)
            .await
            .ok_or(ConnectError::NoLocation)?;

        if let Err(e) = registry.set_selected(&location.id, false).await {
            warn!("Failed to store automatic selection: {}", e);
        }
        Ok(location)
    }
}

/// Await `fut` unless `cancel` fires first
async fn step<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, ConnectError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ConnectError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Control-plane host of an endpoint: `<prefix>.<domain>`
pub fn channel_host(prefix: &str, domain_name: &str) -> String {
    if prefix.is_empty() {
        domain_name.to_string()
    } else {
        format!("{}.{}", prefix, domain_name)
    }
}

/// Connect sequence failures
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Connect sequence cancelled")]
    Cancelled,

    #[error("No location available")]
    NoLocation,

    #[error("Channel closed during connect")]
    ChannelClosed,

    #[error("Location error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Channel error: {0}")]
    Channel(#[from] MonitorError),
}
