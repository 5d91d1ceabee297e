//! Shipper: delivers consolidated call documents to the ingestion API, either batched behind a
//! bounded queue or one at a time with bounded concurrency, and reconciles the outcome back into
//! the Per-Call Shipping State — the State Store is the system's only durable retry queue.

pub mod rate_limit;
pub mod transport;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::config::{AgentConfig, ShipperTransport, ShippingConfig};
use crate::metrics::Metrics;
use crate::model::ConsolidatedCallDocument;
use crate::store::Store;
use crate::Result;
use transport::HttpTransport;

pub struct ShipRequest {
    pub document: ConsolidatedCallDocument,
}

pub struct Shipper {
    tx: mpsc::Sender<ShipRequest>,
}

impl Shipper {
    pub fn sender(&self) -> mpsc::Sender<ShipRequest> {
        self.tx.clone()
    }

    pub fn spawn(config: &AgentConfig, store: Arc<Store>, metrics: Option<Arc<Metrics>>) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.shipping.queue_capacity);
        let transport = Arc::new(HttpTransport::new(
            config.api.clone(),
            config.hostname(),
            config.recording.memory_ceiling_bytes,
            config.shipping.max_retries,
            config.shipping.retry_base_secs,
            config.shipping.retry_cap_secs,
            metrics.clone(),
        )?);

        match config.shipping.transport {
            ShipperTransport::Batch => spawn_batch_worker(rx, transport, store, metrics, config.shipping.clone()),
            ShipperTransport::Direct => {
                spawn_direct_worker(rx, transport, store, metrics, config.shipping.max_concurrent_uploads)
            }
        }

        Ok(Self { tx })
    }
}

async fn record_outcome(store: &Store, linkedid: &str, error: Option<String>) {
    let now = Utc::now();
    let Ok(Some(mut state)) = store.load_shipping_state(linkedid).await else {
        return;
    };
    match error {
        None => {
            state.shipped_at = Some(now);
            state.ship_count += 1;
            state.error_count = 0;
            state.last_error = None;
        }
        Some(e) => {
            state.error_count += 1;
            state.last_error = Some(e);
        }
    }
    state.last_updated = now;
    if let Err(e) = store.save_shipping_state(&state).await {
        warn!(linkedid = %linkedid, error = %e, "failed to persist shipping outcome");
    }
}

fn spawn_batch_worker(
    mut rx: mpsc::Receiver<ShipRequest>,
    transport: Arc<HttpTransport>,
    store: Arc<Store>,
    metrics: Option<Arc<Metrics>>,
    config: ShippingConfig,
) {
    tokio::spawn(async move {
        let mut buffer: Vec<ShipRequest> = Vec::new();
        let mut oldest: Option<Instant> = None;
        let batch_timeout = Duration::from_secs(config.batch_timeout_secs);

        loop {
            let sleep_for = match oldest {
                Some(t) => batch_timeout.saturating_sub(t.elapsed()),
                None => batch_timeout,
            };

            tokio::select! {
                maybe_item = rx.recv() => {
                    match maybe_item {
                        Some(item) => {
                            if buffer.is_empty() {
                                oldest = Some(Instant::now());
                            }
                            buffer.push(item);
                            if let Some(m) = &metrics {
                                m.set_queue_depth(buffer.len() as i64);
                            }
                            if buffer.len() >= config.batch_size {
                                flush(&mut buffer, &mut oldest, &transport, &store, &metrics).await;
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                flush(&mut buffer, &mut oldest, &transport, &store, &metrics).await;
                            }
                            info!("shipper batch worker exiting: queue closed");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(sleep_for), if oldest.is_some() => {
                    flush(&mut buffer, &mut oldest, &transport, &store, &metrics).await;
                }
            }
        }
    });
}

async fn flush(
    buffer: &mut Vec<ShipRequest>,
    oldest: &mut Option<Instant>,
    transport: &Arc<HttpTransport>,
    store: &Arc<Store>,
    metrics: &Option<Arc<Metrics>>,
) {
    if buffer.is_empty() {
        return;
    }
    let documents: Vec<ConsolidatedCallDocument> = buffer.drain(..).map(|r| r.document).collect();
    *oldest = None;
    if let Some(m) = metrics {
        m.set_queue_depth(0);
    }

    match transport.ship_batch(&documents).await {
        Ok(()) => {
            for doc in &documents {
                if let Some(m) = metrics {
                    m.call_shipped(doc.ship_phase);
                }
                record_outcome(store, &doc.linkedid, None).await;
            }
        }
        Err(e) => {
            warn!(count = documents.len(), error = %e, "batch shipment failed, recording per-call errors");
            for doc in &documents {
                record_outcome(store, &doc.linkedid, Some(e.to_string())).await;
            }
        }
    }
}

fn spawn_direct_worker(
    mut rx: mpsc::Receiver<ShipRequest>,
    transport: Arc<HttpTransport>,
    store: Arc<Store>,
    metrics: Option<Arc<Metrics>>,
    max_concurrent: usize,
) {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        while let Some(item) = rx.recv().await {
            let permit = Arc::clone(&semaphore).acquire_owned().await;
            let transport = Arc::clone(&transport);
            let store = Arc::clone(&store);
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let doc = item.document;
                match transport.ship_document(&doc).await {
                    Ok(()) => {
                        if let Some(m) = &metrics {
                            m.call_shipped(doc.ship_phase);
                        }
                        record_outcome(&store, &doc.linkedid, None).await;
                    }
                    Err(e) => {
                        warn!(linkedid = %doc.linkedid, error = %e, "direct shipment failed");
                        record_outcome(&store, &doc.linkedid, Some(e.to_string())).await;
                    }
                }
            });
        }
        info!("shipper direct worker exiting: queue closed");
    });
}
