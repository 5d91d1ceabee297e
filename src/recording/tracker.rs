use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::ami::AmiEvent;
use crate::config::RecordingConfig;
use crate::metrics::Metrics;
use crate::model::RecordingDescriptor;
use crate::shipper::transport::HttpTransport;
use crate::store::Store;
use crate::Result;

/// Candidate field names Asterisk has used historically for the recording filename, tried in
/// order until one is non-empty.
const FILENAME_FIELDS: &[&str] = &["Mixmonitor_filename", "MixMonitor_filename", "File", "Filename", "MixMonitorFilename"];

pub struct Tracker {
    config: RecordingConfig,
    store: Arc<Store>,
    metrics: Option<Arc<Metrics>>,
}

impl Tracker {
    pub fn new(config: RecordingConfig, store: Arc<Store>, metrics: Option<Arc<Metrics>>) -> Arc<Self> {
        Arc::new(Self { config, store, metrics })
    }

    /// Consumes the shared AMI event stream, upserting Recording Descriptors on start/stop
    /// events. Runs for the lifetime of the broadcast channel.
    pub fn spawn_ami_handler(self: &Arc<Self>, mut rx: broadcast::Receiver<AmiEvent>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = this.handle_ami_event(&event).await {
                            warn!(error = %e, "failed to process AMI recording event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "recording tracker AMI handler lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("AMI event stream closed, recording tracker AMI handler exiting");
                        break;
                    }
                }
            }
        });
    }

    async fn handle_ami_event(&self, event: &AmiEvent) -> Result<()> {
        match event.event.as_str() {
            "MixMonitorStart" | "MonitorStart" => self.handle_start(event).await,
            "MixMonitorStop" | "MonitorStop" => self.handle_stop(event).await,
            _ => Ok(()),
        }
    }

    async fn handle_start(&self, event: &AmiEvent) -> Result<()> {
        let now = Utc::now();
        let uniqueid = event.get("Uniqueid").map(str::to_string);
        let linkedid = event.get("Linkedid").map(str::to_string);
        let mut filename = event.first_of(FILENAME_FIELDS);
        let mut synthetic = false;

        if filename.is_none() {
            filename = self.scan_for_candidate(uniqueid.as_deref(), linkedid.as_deref()).await;
        }
        let filename = match filename {
            Some(f) => f,
            None => {
                synthetic = true;
                let base = uniqueid.clone().unwrap_or_else(|| now.timestamp().to_string());
                warn!(uniqueid = ?uniqueid, "no recording filename available, using synthetic name");
                format!("{}.wav", base)
            }
        };

        let basename = basename_of(&filename);
        let mut descriptor = self
            .store
            .load_recording(&basename)
            .await?
            .unwrap_or_else(|| RecordingDescriptor::new(&basename, now));
        descriptor.channel = event.get("Channel").map(str::to_string);
        descriptor.uniqueid = uniqueid;
        descriptor.linkedid = linkedid;
        descriptor.callerid_num = event.get("CallerIDNum").map(str::to_string);
        descriptor.exten = event.get("Exten").map(str::to_string);
        descriptor.context = event.get("Context").map(str::to_string);
        descriptor.synthetic_filename = synthetic;
        if descriptor.file_path.is_none() {
            descriptor.file_path = self.find_on_disk(&basename);
        }

        self.store.save_recording(&descriptor).await?;
        if let Some(m) = &self.metrics {
            m.recording_tracked();
        }
        Ok(())
    }

    async fn handle_stop(&self, event: &AmiEvent) -> Result<()> {
        let now = Utc::now();
        let filename = event.first_of(FILENAME_FIELDS);
        let basename = match filename {
            Some(f) => basename_of(&f),
            None => match event.get("Uniqueid") {
                Some(u) => format!("{}.wav", u),
                None => return Ok(()),
            },
        };

        if let Some(mut descriptor) = self.store.load_recording(&basename).await? {
            descriptor.mark_stopped(now);
            self.store.save_recording(&descriptor).await?;
        }
        Ok(())
    }

    /// Scans configured recording roots for a file modified within the last 2 minutes whose
    /// name contains `uniqueid` or `linkedid`. Most recently modified match wins.
    async fn scan_for_candidate(&self, uniqueid: Option<&str>, linkedid: Option<&str>) -> Option<String> {
        if uniqueid.is_none() && linkedid.is_none() {
            return None;
        }
        let roots = self.config.root_paths.clone();
        let uniqueid = uniqueid.map(str::to_string);
        let linkedid = linkedid.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
            for root in &roots {
                let entries = match std::fs::read_dir(root) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
                    let matches = uniqueid.as_deref().map(|u| name.contains(u)).unwrap_or(false)
                        || linkedid.as_deref().map(|l| name.contains(l)).unwrap_or(false);
                    if !matches {
                        continue;
                    }
                    if let Ok(meta) = entry.metadata() {
                        if let Ok(modified) = meta.modified() {
                            let recent = modified.elapsed().map(|d| d < Duration::from_secs(120)).unwrap_or(false);
                            if recent && best.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                                best = Some((modified, path));
                            }
                        }
                    }
                }
            }
            best.map(|(_, p)| p.file_name().unwrap().to_string_lossy().to_string())
        })
        .await
        .unwrap_or(None)
    }

    fn find_on_disk(&self, basename: &str) -> Option<String> {
        self.config
            .root_paths
            .iter()
            .map(|root| Path::new(root).join(basename))
            .find(|candidate| candidate.exists())
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Periodic scan of every Descriptor with `file_exists, !recording_complete, !uploaded`,
    /// sampling file size for stability. Interval is capped at 60s regardless of configuration.
    pub fn spawn_scan_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval_secs = this.config.scan_interval_secs.clamp(1, 60);
        tokio::spawn(async move {
            info!(interval_secs, "recording scan loop started");
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                if let Err(e) = this.scan_tick().await {
                    warn!(error = %e, "recording scan tick failed");
                }
            }
        });
    }

    async fn scan_tick(&self) -> Result<()> {
        let now = Utc::now();
        for mut descriptor in self.store.pending_recordings().await? {
            let path = descriptor.file_path.clone().or_else(|| self.find_on_disk(&descriptor.filename));
            let Some(path) = path else { continue };

            match tokio::fs::metadata(&path).await {
                Ok(meta) => {
                    descriptor.file_path = Some(path);
                    descriptor.observe_size(meta.len() as i64, now);
                }
                Err(_) => descriptor.file_exists = false,
            }
            self.store.save_recording(&descriptor).await?;
        }
        Ok(())
    }

    /// Starts an OS-level file-watch notifier over the configured roots on a dedicated thread
    /// (notify's blocking API doesn't fit cleanly onto the async runtime). Discovered
    /// creation/modification events seed the scanner's worklist immediately; the periodic scan
    /// still runs independently, since stability requires two samples taken 60s apart regardless
    /// of how promptly a change was observed.
    pub fn spawn_filesystem_watch(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let (tx, rx) = std_mpsc::channel::<PathBuf>();
        let roots = this.config.root_paths.clone();

        std::thread::spawn(move || {
            let tx_inner = tx;
            let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = tx_inner.send(path);
                        }
                    }
                }
            }) {
                Ok(w) => w,
                Err(e) => {
                    error!(error = %e, "failed to start recording filesystem watcher");
                    return;
                }
            };
            for root in &roots {
                if let Err(e) = watcher.watch(Path::new(root), RecursiveMode::NonRecursive) {
                    warn!(root = %root, error = %e, "failed to watch recording directory");
                }
            }
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        });

        tokio::spawn(async move {
            while let Ok(path) = rx.recv() {
                if let Err(e) = this.seed_from_path(&path).await {
                    debug!(path = %path.display(), error = %e, "recording watch seed failed");
                }
            }
        });
    }

    async fn seed_from_path(&self, path: &Path) -> Result<()> {
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else { return Ok(()) };
        if let Some(mut descriptor) = self.store.load_recording(basename).await? {
            descriptor.file_exists = true;
            if descriptor.file_path.is_none() {
                descriptor.file_path = Some(path.to_string_lossy().to_string());
            }
            self.store.save_recording(&descriptor).await?;
        }
        Ok(())
    }

    /// Uploads every currently-eligible recording. Returns the count successfully uploaded.
    pub async fn upload_eligible(&self, transport: &HttpTransport) -> Result<usize> {
        let now = Utc::now();
        let mut uploaded = 0;
        for mut descriptor in self.store.upload_eligible_recordings(now).await? {
            if descriptor.is_abandoned(now) {
                if let Some(m) = &self.metrics {
                    m.recording_abandoned();
                }
                continue;
            }
            let Some(path) = descriptor.file_path.clone() else { continue };

            match transport.upload_recording(&path, &descriptor).await {
                Ok(status) => {
                    descriptor.record_success(now);
                    descriptor.upload_status = Some(status as i32);
                    uploaded += 1;
                    if let Some(m) = &self.metrics {
                        m.recording_uploaded();
                    }
                }
                Err(e) => descriptor.record_failed_attempt(None, e.to_string(), now),
            }
            self.store.save_recording(&descriptor).await?;
        }
        Ok(uploaded)
    }

    /// File-discovery fallback used when a consolidated call document is ready: returns every
    /// file under the configured roots whose basename contains `linkedid`.
    pub async fn discover_recordings_for_linkedid(&self, linkedid: &str) -> Vec<String> {
        let roots = self.config.root_paths.clone();
        let linkedid = linkedid.to_string();
        tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            for root in &roots {
                let entries = match std::fs::read_dir(root) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if name.contains(&linkedid) {
                            matches.push(path.to_string_lossy().to_string());
                        }
                    }
                }
            }
            matches
        })
        .await
        .unwrap_or_default()
    }
}

fn basename_of(path: &str) -> String {
    Path::new(path).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_of_strips_directory_components() {
        assert_eq!(basename_of("/var/spool/asterisk/monitor/2024/01/01/x.wav"), "x.wav");
        assert_eq!(basename_of("x.wav"), "x.wav");
    }

    #[tokio::test]
    async fn start_event_with_explicit_filename_creates_a_descriptor() {
        let store = Arc::new(Store::open_in_memory_for_test().await);
        let tracker = Tracker::new(RecordingConfig::default(), store.clone(), None);

        let mut fields = std::collections::HashMap::new();
        fields.insert("Uniqueid".to_string(), "1700000000.1".to_string());
        fields.insert("Linkedid".to_string(), "1700000000.1".to_string());
        fields.insert("File".to_string(), "1700000000.1.wav".to_string());
        let event = AmiEvent { event: "MixMonitorStart".into(), fields };

        tracker.handle_ami_event(&event).await.unwrap();
        let descriptor = store.load_recording("1700000000.1.wav").await.unwrap();
        assert!(descriptor.is_some());
    }
}
