//! HTTP transport: POSTs consolidated documents and multipart recording uploads to the
//! ingestion API, with bearer auth, exponential backoff+jitter, and local tier-based rate
//! limiting derived from the API key's shape.

use std::time::Duration;

use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::metrics::Metrics;
use crate::model::{ConsolidatedCallDocument, RecordingDescriptor};
use crate::shipper::rate_limit::RateLimiter;
use crate::{Error, Result};

fn content_type_for(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".mp3") {
        "audio/mpeg"
    } else {
        // .wav and .gsm both ship as audio/wav for the widest player compatibility.
        "audio/wav"
    }
}

fn is_success(status: StatusCode) -> bool {
    status.is_success() || status.as_u16() == 202
}

pub struct HttpTransport {
    client: Client,
    config: ApiConfig,
    hostname: String,
    memory_ceiling_bytes: u64,
    rate_limiter: RateLimiter,
    max_retries: u32,
    retry_base_secs: u64,
    retry_cap_secs: u64,
    metrics: Option<std::sync::Arc<Metrics>>,
}

impl HttpTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ApiConfig,
        hostname: String,
        memory_ceiling_bytes: u64,
        max_retries: u32,
        retry_base_secs: u64,
        retry_cap_secs: u64,
        metrics: Option<std::sync::Arc<Metrics>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(Error::Http)?;
        let rate_limiter = RateLimiter::from_api_key(&config.key);
        Ok(Self {
            client,
            config,
            hostname,
            memory_ceiling_bytes,
            rate_limiter,
            max_retries,
            retry_base_secs,
            retry_cap_secs,
            metrics,
        })
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.retry_base_secs.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.retry_cap_secs);
        let jitter_ms = rand::thread_rng().gen_range(0..500);
        Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
    }

    fn user_agent(&self) -> String {
        format!("{}/{}", self.config.user_agent_product, env!("CARGO_PKG_VERSION"))
    }

    /// Ships one or more consolidated documents in a single request, wrapped in the current
    /// `{cdrs, cels}`-shaped envelope the ingestion API expects (the legacy flat-list shape is
    /// the endpoint's concern, not this client's). Retries the whole batch up to `max_retries`
    /// times with exponential backoff+jitter; returns the last error on exhaustion.
    pub async fn ship_batch(&self, documents: &[ConsolidatedCallDocument]) -> Result<()> {
        let body = json!({ "calls": documents });
        let linkedids: Vec<&str> = documents.iter().map(|d| d.linkedid.as_str()).collect();
        let mut last_err = None;

        for attempt in 1..=self.max_retries.max(1) {
            self.rate_limiter.acquire().await;
            let response = self
                .client
                .post(format!("{}/calls", self.config.base_url))
                .bearer_auth(&self.config.key)
                .header("User-Agent", self.user_agent())
                .header("X-Asterisk-Hostname", &self.hostname)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) if is_success(resp.status()) => {
                    debug!(count = documents.len(), attempt, status = %resp.status(), "documents shipped");
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    warn!(?linkedids, attempt, %status, "document shipment rejected");
                    last_err = Some(Error::shipping(format!("HTTP {}: {}", status, truncate(&text, 500))));
                }
                Err(e) => {
                    warn!(?linkedids, attempt, error = %e, "document shipment transport error");
                    last_err = Some(Error::Http(e));
                }
            }

            if let Some(m) = &self.metrics {
                m.http_retry();
            }
            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff_for(attempt)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| Error::shipping("exhausted retries with no recorded error")))
    }

    pub async fn ship_document(&self, document: &ConsolidatedCallDocument) -> Result<()> {
        self.ship_batch(std::slice::from_ref(document)).await
    }

    /// Uploads one recording file as multipart form data. Returns the HTTP status on success.
    ///
    /// Files at or under `memory_ceiling_bytes` are read fully into memory; larger files are
    /// streamed from disk in chunks so a handful of long conference recordings can't push the
    /// agent's resident memory past what a single host is provisioned for.
    pub async fn upload_recording(&self, file_path: &str, descriptor: &RecordingDescriptor) -> Result<u16> {
        let content_type = content_type_for(file_path);
        let file_name = std::path::Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| descriptor.filename.clone());

        let metadata = tokio::fs::metadata(file_path).await.map_err(Error::Io)?;
        let audio_part = if metadata.len() > self.memory_ceiling_bytes {
            let file = tokio::fs::File::open(file_path).await.map_err(Error::Io)?;
            let stream = tokio_util::io::ReaderStream::new(file);
            reqwest::multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), metadata.len())
                .file_name(file_name.clone())
                .mime_str(content_type)
                .map_err(Error::Http)?
        } else {
            let bytes = tokio::fs::read(file_path).await.map_err(Error::Io)?;
            reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name.clone())
                .mime_str(content_type)
                .map_err(Error::Http)?
        };

        let mut form = reqwest::multipart::Form::new()
            .part("audio", audio_part)
            .text("recording_id", descriptor.filename.clone())
            .text("file_name", file_name)
            .text("file_size", descriptor.file_size.to_string());

        if let Some(v) = &descriptor.uniqueid {
            form = form.text("uniqueid", v.clone());
        }
        if let Some(v) = &descriptor.linkedid {
            form = form.text("linkedid", v.clone());
            form = form.text("call_id", v.clone());
        }
        if let Some(v) = &descriptor.callerid_num {
            form = form.text("src_number", v.clone());
        }
        form = form.text("start_time", descriptor.started_at.to_rfc3339());
        form = form.text("calldate", descriptor.started_at.to_rfc3339());

        self.rate_limiter.acquire().await;
        let response = self
            .client
            .post(format!("{}/recordings", self.config.base_url))
            .bearer_auth(&self.config.key)
            .header("User-Agent", self.user_agent())
            .header("X-Asterisk-Hostname", &self.hostname)
            .multipart(form)
            .send()
            .await
            .map_err(Error::Http)?;

        let status = response.status();
        if is_success(status) {
            Ok(status.as_u16())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Error::shipping(format!("recording upload rejected with HTTP {}: {}", status, truncate(&text, 500))))
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_maps_known_extensions() {
        assert_eq!(content_type_for("a.wav"), "audio/wav");
        assert_eq!(content_type_for("a.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("a.gsm"), "audio/wav");
        assert_eq!(content_type_for("a.WAV"), "audio/wav");
    }

    #[test]
    fn truncate_leaves_short_strings_untouched() {
        assert_eq!(truncate("short", 500), "short");
    }
}
