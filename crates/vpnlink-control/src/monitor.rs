//! Connectivity Channel
//!
//! One persistent WebSocket per active connection to the endpoint's
//! control-plane host. While open it:
//! - runs a ping round every `ping_interval` (N exchanges, minimum kept)
//! - forwards server-pushed messages as [`ChannelEvent`]s
//! - reports how the channel ended, so a close we asked for can be told
//!   apart from one we did not

use crate::config::MonitorConfig;
use crate::probe::tls_client_config;
use crate::protocol::ChannelMessage;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rustls::ClientConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

type ChannelStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Something that happened on the channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened {
        session: u64,
    },
    /// The channel ended; `clean` is true only for a close we requested
    Closed {
        session: u64,
        clean: bool,
        reason: Option<String>,
    },
    /// A ping round finished
    Ping {
        session: u64,
        ping: Option<u32>,
    },
    ConnectivityInfo {
        bytes_downloaded: u64,
        bytes_uploaded: u64,
        refresh_tokens: bool,
    },
    ServerError {
        code: String,
        payload: String,
    },
    DnsServer {
        dns_server: String,
    },
}

/// Persistent control-plane link
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Open a channel to `host`, closing any previous one first
    ///
    /// Returns the session id carried by the channel's events.
    async fn open(&self, host: &str, token: &str, credentials_hash: &str) -> Result<u64, MonitorError>;

    /// Close the channel; safe to call when nothing is open
    async fn close(&self);

    /// Ping from the last finished round, `None` when closed
    fn last_ping(&self) -> Option<u32>;

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// WebSocket connectivity monitor
pub struct ConnectivityMonitor {
    config: MonitorConfig,
    app_id: String,
    tls: Arc<ClientConfig>,
    events: broadcast::Sender<ChannelEvent>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    last_ping: Arc<Mutex<Option<u32>>>,
    next_session: AtomicU64,
}

impl ConnectivityMonitor {
    pub fn new(config: MonitorConfig, app_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            app_id: app_id.into(),
            tls: tls_client_config(),
            events,
            session: tokio::sync::Mutex::new(None),
            last_ping: Arc::new(Mutex::new(None)),
            next_session: AtomicU64::new(1),
        }
    }

    /// `{scheme}://{host}{path}?hash={credentials_hash}`
    pub fn channel_url(&self, host: &str, credentials_hash: &str) -> Result<Url, MonitorError> {
        let mut url = Url::parse(&format!("{}://{}{}", self.config.scheme, host, self.config.path))
            .map_err(|e| MonitorError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut().append_pair("hash", credentials_hash);
        Ok(url)
    }

    /// Session id of the open channel
    pub async fn current_session(&self) -> Option<u64> {
        self.session.lock().await.as_ref().map(|s| s.id)
    }

    async fn connect(&self, url: &Url) -> Result<ChannelStream, MonitorError> {
        let connector = match url.scheme() {
            "wss" => Some(Connector::Rustls(self.tls.clone())),
            _ => None,
        };

        let handshake =
            tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector);
        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout(), handshake)
            .await
            .map_err(|_| MonitorError::Timeout)?
            .map_err(|e| MonitorError::Connect(e.to_string()))?;

        Ok(stream)
    }
}

#[async_trait]
impl ControlChannel for ConnectivityMonitor {
    async fn open(&self, host: &str, token: &str, credentials_hash: &str) -> Result<u64, MonitorError> {
        self.close().await;

        let url = self.channel_url(host, credentials_hash)?;
        debug!(host, "Opening connectivity channel");
        let stream = self.connect(&url).await?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let session = Session {
            id,
            config: self.config.clone(),
            token: token.as_bytes().to_vec(),
            app_id: self.app_id.as_bytes().to_vec(),
            events: self.events.clone(),
            last_ping: self.last_ping.clone(),
            cancel: cancel.clone(),
        };
        let _ = self.events.send(ChannelEvent::Opened { session: id });
        let task = tokio::spawn(session.run(stream));

        *self.session.lock().await = Some(ActiveSession { id, cancel, task });
        info!(host, session = id, "Connectivity channel open");

        Ok(id)
    }

    async fn close(&self) {
        let active = self.session.lock().await.take();
        if let Some(active) = active {
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                warn!(session = active.id, "Channel task ended abnormally: {}", e);
            }
            debug!(session = active.id, "Connectivity channel closed");
        }
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn last_ping(&self) -> Option<u32> {
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

/// In-progress ping round
struct PingRound {
    remaining: u32,
    best: Option<u32>,
    request_time: u64,
    sent_at: Instant,
    deadline: Instant,
}

impl PingRound {
    fn record(&mut self, rtt: Option<u32>) {
        if let Some(ms) = rtt {
            self.best = Some(self.best.map_or(ms, |b| b.min(ms)));
        }
        self.remaining = self.remaining.saturating_sub(1);
    }
}

/// State owned by a channel's task
struct Session {
    id: u64,
    config: MonitorConfig,
    token: Vec<u8>,
    app_id: Vec<u8>,
    events: broadcast::Sender<ChannelEvent>,
    last_ping: Arc<Mutex<Option<u32>>>,
    cancel: CancellationToken,
}

impl Session {
    async fn run(self, stream: ChannelStream) {
        let (mut write, mut read) = stream.split();
        let mut ticker = tokio::time::interval(self.config.ping_interval());
        let mut round: Option<PingRound> = None;

        let reason = loop {
            let deadline = round.as_ref().map(|r| r.deadline);

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break None;
                }

                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Binary(data))) => {
                        match ChannelMessage::decode(&data) {
                            Ok(ChannelMessage::Ping { request_time, .. }) => {
                                if let Some(r) = round.as_mut().filter(|r| r.request_time == request_time) {
                                    let rtt = u32::try_from(r.sent_at.elapsed().as_millis()).unwrap_or(u32::MAX);
                                    r.record(Some(rtt));
                                    round = self.advance(round.take(), &mut write).await;
                                }
                            }
                            Ok(message) => self.dispatch(message),
                            Err(e) => debug!(session = self.id, "Ignoring frame: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break Some(frame.map_or_else(
                            || "closed by server".to_string(),
                            |f| format!("closed by server: {} {}", f.code, f.reason),
                        ));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("connection lost".to_string()),
                },

                _ = ticker.tick(), if round.is_none() => {
                    let fresh = PingRound {
                        remaining: self.config.ping_samples,
                        best: None,
                        request_time: 0,
                        sent_at: Instant::now(),
                        deadline: Instant::now(),
                    };
                    round = self.advance(Some(fresh), &mut write).await;
                }

                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some(r) = round.as_mut() {
                        debug!(session = self.id, "Ping exchange timed out");
                        r.record(None);
                    }
                    round = self.advance(round.take(), &mut write).await;
                }
            }
        };

        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let clean = reason.is_none();
        if !clean {
            warn!(session = self.id, reason = ?reason, "Connectivity channel closed unexpectedly");
        }
        let _ = self.events.send(ChannelEvent::Closed {
            session: self.id,
            clean,
            reason,
        });
    }

    /// Send the next exchange of a round, or finish it
    async fn advance<S>(&self, round: Option<PingRound>, write: &mut S) -> Option<PingRound>
    where
        S: futures_util::Sink<WsMessage> + Unpin,
        S::Error: std::fmt::Display,
    {
        let mut round = round?;
        if round.remaining == 0 {
            self.finish(round.best);
            return None;
        }

        let request_time = unix_millis().max(round.request_time + 1);
        let ping = ChannelMessage::Ping {
            request_time,
            token: self.token.clone(),
            application_id: self.app_id.clone(),
        };

        round.request_time = request_time;
        round.sent_at = Instant::now();
        round.deadline = round.sent_at + self.config.ping_timeout();

        if let Err(e) = write.send(WsMessage::Binary(ping.encode().into())).await {
            // The read side notices a dead socket; this round is just lost
            debug!(session = self.id, "Ping send failed: {}", e);
            self.finish(None);
            return None;
        }
        Some(round)
    }

    fn finish(&self, ping: Option<u32>) {
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = ping;
        debug!(session = self.id, ping = ?ping, "Ping round finished");
        let _ = self.events.send(ChannelEvent::Ping {
            session: self.id,
            ping,
        });
    }

    fn dispatch(&self, message: ChannelMessage) {
        let event = match message {
            ChannelMessage::ConnectivityInfo {
                bytes_downloaded,
                bytes_uploaded,
                refresh_tokens,
                ..
            } => ChannelEvent::ConnectivityInfo {
                bytes_downloaded,
                bytes_uploaded,
                refresh_tokens,
            },
            ChannelMessage::Error { code, payload } => {
                warn!(session = self.id, code = %code, "Server error pushed");
                ChannelEvent::ServerError { code, payload }
            }
            ChannelMessage::Settings { dns_server } => ChannelEvent::DnsServer { dns_server },
            // Unsolicited echoes
            ChannelMessage::Ping { .. } => return,
        };
        let _ = self.events.send(event);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid channel URL: {0}")]
    InvalidUrl(String),

    #[error("Channel connect failed: {0}")]
    Connect(String),

    #[error("Channel handshake timed out")]
    Timeout,
}
