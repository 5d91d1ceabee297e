//! Minimal HTTP surface for liveness probing and metrics scraping. No web framework is in the
//! dependency stack, so this is a hand-rolled line-oriented HTTP/1.1 responder over a raw
//! `TcpListener` — adequate for the tiny, trusted surface this endpoint serves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::MetricsConfig;
use crate::metrics::Metrics;
use crate::Result;

/// Shared readiness flag. The orchestrator flips this once every subsystem has completed
/// startup, and back off during shutdown drain.
#[derive(Clone)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        status = status,
        content_type = content_type,
        len = body.len(),
        body = body,
    )
}

async fn handle_connection(mut stream: tokio::net::TcpStream, readiness: Readiness, metrics: Option<Arc<Metrics>>) {
    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf).await {
        Ok(n) => n,
        Err(_) => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request.lines().next().and_then(|line| line.split_whitespace().nth(1)).unwrap_or("/");

    let response = if path.starts_with("/metrics") {
        match &metrics {
            Some(m) => http_response("200 OK", "text/plain; version=0.0.4", &m.render()),
            None => http_response("404 Not Found", "text/plain", "metrics exposition disabled"),
        }
    } else if path.starts_with("/healthz") || path.starts_with("/livez") {
        if readiness.is_ready() {
            http_response("200 OK", "text/plain", "ok")
        } else {
            http_response("503 Service Unavailable", "text/plain", "starting")
        }
    } else {
        http_response("404 Not Found", "text/plain", "not found")
    };

    let _ = stream.write_all(response.as_bytes()).await;
}

/// Starts the health/metrics listener. When `config.enabled` is false, the bind is still
/// performed (a container orchestrator can still probe TCP connect/accept as a liveness signal)
/// but `/metrics` always answers 404.
pub async fn spawn(config: MetricsConfig, readiness: Readiness, metrics: Option<Arc<Metrics>>) -> Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(&config.bind_address).await?;
    info!(bind = %config.bind_address, metrics_enabled = config.enabled, "health/metrics endpoint listening");

    let metrics = if config.enabled { metrics } else { None };

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let readiness = readiness.clone();
                    let metrics = metrics.clone();
                    tokio::spawn(handle_connection(stream, readiness, metrics));
                }
                Err(e) => {
                    warn!(error = %e, "health listener accept failed");
                }
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_defaults_to_not_ready() {
        let r = Readiness::new();
        assert!(!r.is_ready());
        r.set_ready(true);
        assert!(r.is_ready());
    }

    #[test]
    fn response_includes_content_length() {
        let resp = http_response("200 OK", "text/plain", "ok");
        assert!(resp.contains("Content-Length: 2"));
    }
}
