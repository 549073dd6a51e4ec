//! Endpoint Latency Probe
//!
//! Measures round-trip time to an endpoint with a few small HTTP(S)
//! requests against its ping host. Features:
//! - Sequential samples, minimum wins
//! - Per-request timeout (request is dropped, not left running)
//! - Process-wide cap on probes in flight; excess callers queue
//! - Failures degrade to `None`, never to an error

use crate::config::ProbeConfig;
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request, Uri};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// Latency measurement for a single host
#[async_trait]
pub trait PingProbe: Send + Sync {
    /// Best round trip in milliseconds, `None` if the host never answered
    async fn probe(&self, host: &str) -> Option<u32>;
}

/// Root store shared by the probe and the connectivity channel
pub(crate) fn tls_client_config() -> Arc<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// HTTP(S) latency probe
pub struct HttpPingProbe {
    config: ProbeConfig,
    permits: Arc<Semaphore>,
    tls: Arc<ClientConfig>,
}

impl HttpPingProbe {
    pub fn new(config: ProbeConfig) -> Self {
        debug!(
            "Ping probe initialized ({} samples, {:?} timeout, {} in flight)",
            config.samples,
            config.request_timeout(),
            config.max_in_flight
        );

        Self {
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            tls: tls_client_config(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ProbeConfig::default())
    }

    /// Probes currently allowed to start without waiting
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// One timed request; the elapsed time covers connect, TLS and response
    async fn sample(&self, uri: &Uri) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        tokio::time::timeout(self.config.request_timeout(), self.request(uri))
            .await
            .map_err(|_| ProbeError::Timeout)??;
        Ok(start.elapsed())
    }

    async fn request(&self, uri: &Uri) -> Result<(), ProbeError> {
        let host = uri
            .host()
            .ok_or_else(|| ProbeError::InvalidUrl("No host in URL".to_string()))?;
        let is_https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri.path())
            .header(HOST, host)
            .header(USER_AGENT, &self.config.user_agent)
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        let response = if is_https {
            let connector = TlsConnector::from(self.tls.clone());
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| ProbeError::Tls("Invalid server name".to_string()))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProbeError::Tls(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProbeError::Http(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    trace!("Probe connection closed: {}", e);
                }
            });
            sender.send_request(request).await
        } else {
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProbeError::Http(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    trace!("Probe connection closed: {}", e);
                }
            });
            sender.send_request(request).await
        };

        let response = response.map_err(|e| ProbeError::Http(e.to_string()))?;

        // Any status proves the host is reachable; drain so the timing
        // includes the full response
        response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl PingProbe for HttpPingProbe {
    async fn probe(&self, host: &str) -> Option<u32> {
        let uri: Uri = match self.config.url_for(host).parse() {
            Ok(uri) => uri,
            Err(e) => {
                debug!(host, "Unprobeable host: {}", e);
                return None;
            }
        };

        // Closed semaphore only happens on shutdown
        let _permit = self.permits.acquire().await.ok()?;

        let mut best: Option<u32> = None;
        for attempt in 0..self.config.samples {
            match self.sample(&uri).await {
                Ok(rtt) => {
                    let ms = u32::try_from(rtt.as_millis()).unwrap_or(u32::MAX);
                    best = Some(best.map_or(ms, |b| b.min(ms)));
                }
                Err(e) => {
                    trace!(host, attempt, "Probe sample failed: {}", e);
                }
            }
        }

        debug!(host, ping = ?best, "Probe finished");
        best
    }
}

/// Probe failures (internal; callers only see `None`)
#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn local_config() -> ProbeConfig {
        ProbeConfig {
            scheme: "http".to_string(),
            host_prefix: String::new(),
            request_timeout_ms: 500,
            ..ProbeConfig::default()
        }
    }

    /// Minimal HTTP server; returns its address and the peak number of
    /// requests it was serving at once
    async fn spawn_server(delay: Duration) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let (active, peak) = (a.clone(), p.clone());
                tokio::spawn(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);

                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                        .await;
                });
            }
        });

        (addr, peak)
    }

    #[tokio::test]
    async fn test_probe_reachable_host() {
        let (addr, _) = spawn_server(Duration::from_millis(20)).await;
        let probe = HttpPingProbe::new(local_config());

        let ping = probe.probe(&addr).await;
        assert!(matches!(ping, Some(ms) if ms >= 20 && ms < 500));
    }

    #[tokio::test]
    async fn test_probe_unreachable_host_is_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let probe = HttpPingProbe::new(local_config());
        assert_eq!(probe.probe(&addr).await, None);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_none() {
        let (addr, _) = spawn_server(Duration::from_secs(2)).await;
        let config = ProbeConfig {
            request_timeout_ms: 50,
            samples: 1,
            ..local_config()
        };

        let probe = HttpPingProbe::new(config);
        assert_eq!(probe.probe(&addr).await, None);
    }

    #[tokio::test]
    async fn test_in_flight_cap() {
        let (addr, peak) = spawn_server(Duration::from_millis(50)).await;
        let config = ProbeConfig {
            samples: 1,
            max_in_flight: 2,
            ..local_config()
        };
        let probe = Arc::new(HttpPingProbe::new(config));

        let probes = (0..6).map(|_| {
            let probe = probe.clone();
            let addr = addr.clone();
            tokio::spawn(async move { probe.probe(&addr).await })
        });
        for handle in probes {
            assert!(handle.await.unwrap().is_some());
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(probe.available_permits(), 2);
    }
}
