//! Wires together every subsystem in dependency order (§2, §5): the Local State Store opens
//! first, then the Source Readers, then the Shipper and Recording Tracker, then the Aggregator
//! that drives them all, and finally the health/metrics endpoint. Shutdown runs the same chain
//! in reverse: stop accepting work, drain the Shipper, persist state, close connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, CelSourceConfig};
use crate::health;
use crate::metrics::Metrics;
use crate::recording::Tracker as RecordingTracker;
use crate::shipper::Shipper;
use crate::sources::cel_ami::AmiCelReader;
use crate::sources::cel_csv::CsvTailReader;
use crate::sources::cel_db::CelDbReader;
use crate::sources::{CdrReader, CelSource};
use crate::store::Store;
use crate::{ami, Error, Result};

/// Status snapshot returned by [`Agent::status`]; cheap to compute, safe to poll frequently
/// (e.g. from the `Status` CLI subcommand or a future control socket).
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub running: bool,
    pub uptime: Duration,
    pub cel_source_mode: String,
    pub shipping_mode: String,
}

/// Lifecycle events surfaced to whatever embeds the agent (the CLI's event-printing loop today;
/// a supervisor or control plane could subscribe the same way).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Started,
    Stopped,
    SubsystemError { subsystem: String, message: String },
}

/// Top-level orchestrator. Owns the process-wide Local State Store and HTTP client (via the
/// Shipper), and the join handles of every background task, so it can sequence an orderly
/// shutdown (§5 "Cancellation/shutdown").
pub struct Agent {
    config: AgentConfig,
    store: Option<Arc<Store>>,
    metrics: Option<Arc<Metrics>>,
    readiness: health::Readiness,

    shipper: Option<Shipper>,
    recording_tracker: Option<Arc<RecordingTracker>>,

    tasks: Vec<JoinHandle<()>>,

    event_tx: mpsc::UnboundedSender<AgentEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<AgentEvent>>,

    running: Arc<AtomicBool>,
    start_time: Option<Instant>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            store: None,
            metrics: None,
            readiness: health::Readiness::new(),
            shipper: None,
            recording_tracker: None,
            tasks: Vec::new(),
            event_tx,
            event_rx: Some(event_rx),
            running: Arc::new(AtomicBool::new(false)),
            start_time: None,
        })
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<AgentEvent>> {
        self.event_rx.take()
    }

    /// Brings up every subsystem in dependency order and returns once the Aggregator's driving
    /// loop and every reader/tracker/shipper task is running. Fatal startup errors (per §7)
    /// propagate to the caller, which exits the process with code 1.
    pub async fn start(&mut self) -> Result<()> {
        info!("starting cdrlink agent");

        let metrics = if cfg!(feature = "metrics") {
            Some(Arc::new(Metrics::new()))
        } else {
            None
        };
        self.metrics = metrics.clone();

        let store = Arc::new(Store::open(&self.config.store).await);
        self.purge_on_startup(&store).await;
        self.store = Some(Arc::clone(&store));

        let cdr_reader = CdrReader::connect(&self.config.database).await.map_err(|e| {
            error!(error = %e, "fatal: CDR database unreachable on startup health check");
            e
        })?;

        let cel_source: Box<dyn CelSource> = self.build_cel_source(&cdr_reader).await?;

        let shipper = Shipper::spawn(&self.config, Arc::clone(&store), metrics.clone())?;
        let ship_tx = shipper.sender();
        self.shipper = Some(shipper);

        let recording_tracker = self.build_recording_tracker(Arc::clone(&store), metrics.clone());
        self.recording_tracker = recording_tracker.clone();

        let aggregator = crate::aggregator::Aggregator::new(
            self.config.clone(),
            cdr_reader,
            cel_source,
            Arc::clone(&store),
            ship_tx,
            recording_tracker,
            metrics.clone(),
        );
        self.tasks.push(tokio::spawn(aggregator.run()));

        // The health endpoint is always bound (§5 "global state"); /metrics just answers 404
        // when exposition is disabled, so a container orchestrator can still TCP-probe liveness.
        match health::spawn(self.config.metrics.clone(), self.readiness.clone(), metrics.clone()).await {
            Ok(handle) => self.tasks.push(handle),
            Err(e) => warn!(error = %e, "health/metrics endpoint failed to bind, continuing without it"),
        }

        self.readiness.set_ready(true);
        self.running.store(true, Ordering::SeqCst);
        self.start_time = Some(Instant::now());
        let _ = self.event_tx.send(AgentEvent::Started);
        info!("cdrlink agent started");
        Ok(())
    }

    async fn build_cel_source(&self, _cdr_reader: &CdrReader) -> Result<Box<dyn CelSource>> {
        match &self.config.cel_source {
            CelSourceConfig::Db => {
                let reader = CelDbReader::connect(&self.config.database).await?;
                Ok(Box::new(reader))
            }
            CelSourceConfig::Csv(csv_config) => {
                if !std::path::Path::new(&csv_config.path).exists() {
                    return Err(Error::parse(format!(
                        "CEL CSV path {} does not exist (fatal: CEL mode is csv)",
                        csv_config.path
                    )));
                }
                Ok(Box::new(CsvTailReader::new(csv_config)))
            }
            CelSourceConfig::Ami(ami_config) => Ok(Box::new(AmiCelReader::connect(ami_config))),
        }
    }

    /// Spawns the Recording Tracker's filesystem scan and watch loops unconditionally (file
    /// discovery doesn't need AMI), and wires its AMI-driven descriptor creation path only when
    /// an AMI connection is actually configured (§4.4).
    fn build_recording_tracker(&self, store: Arc<Store>, metrics: Option<Arc<Metrics>>) -> Option<Arc<RecordingTracker>> {
        let tracker = RecordingTracker::new(self.config.recording.clone(), store, metrics);
        tracker.spawn_scan_loop();
        tracker.spawn_filesystem_watch();

        match self.config.recording_ami_config() {
            Some(ami_config) => {
                let rx = ami::spawn_event_stream(ami_config);
                tracker.spawn_ami_handler(rx);
            }
            None => {
                warn!("no AMI connection configured; recording descriptors will only be created via filesystem discovery");
            }
        }

        Some(tracker)
    }

    async fn purge_on_startup(&self, store: &Store) {
        let now = chrono::Utc::now();
        match store.purge_expired_calls(now).await {
            Ok(n) if n > 0 => info!(count = n, "purged expired per-call shipping state on startup"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to purge expired per-call shipping state"),
        }
        match store.purge_expired_recordings(now).await {
            Ok(n) if n > 0 => info!(count = n, "purged expired recording descriptors on startup"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to purge expired recording descriptors"),
        }
    }

    /// Orderly shutdown (§5): flip readiness off, abort the Aggregator/reader tasks so no new
    /// work enters the Shipper queue, drop the Shipper sender to trigger its final flush, wait up
    /// to `shipping.shutdown_deadline_secs` for the drain, then close the store.
    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping cdrlink agent");
        self.readiness.set_ready(false);
        self.running.store(false, Ordering::SeqCst);

        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(shipper) = self.shipper.take() {
            drop(shipper);
        }
        let deadline = Duration::from_secs(self.config.shipping.shutdown_deadline_secs);
        tokio::time::sleep(Duration::from_millis(250).min(deadline)).await;

        self.store = None;

        let _ = self.event_tx.send(AgentEvent::Stopped);
        info!("cdrlink agent stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> AgentStatus {
        AgentStatus {
            running: self.is_running().await,
            uptime: self.start_time.map(|t| t.elapsed()).unwrap_or_default(),
            cel_source_mode: match &self.config.cel_source {
                CelSourceConfig::Db => "db".to_string(),
                CelSourceConfig::Csv(_) => "csv".to_string(),
                CelSourceConfig::Ami(_) => "ami".to_string(),
            },
            shipping_mode: format!("{:?}", self.config.shipping.mode).to_lowercase(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        let mut c = AgentConfig::default();
        c.api.key = "sk_t1_test".to_string();
        c
    }

    #[tokio::test]
    async fn agent_creation_starts_not_running() {
        let agent = Agent::new(config()).unwrap();
        assert!(!agent.is_running().await);
    }

    #[tokio::test]
    async fn status_reports_configured_cel_mode() {
        let agent = Agent::new(config()).unwrap();
        let status = agent.status().await;
        assert_eq!(status.cel_source_mode, "db");
        assert!(!status.running);
    }
}
