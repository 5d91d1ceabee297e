//! Central metrics registry: business counters the rest of the agent increments directly, plus
//! process-level gauges sampled from `sysinfo`. Subsystems never know whether exposition is
//! enabled or how it's served; they just call these increment methods.

use std::sync::Mutex;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use sysinfo::{Pid, System};

use crate::model::ShipPhase;

pub struct Metrics {
    registry: Registry,
    calls_seen: IntCounter,
    calls_shipped: IntCounterVec,
    recordings_tracked: IntCounter,
    recordings_uploaded: IntCounter,
    recordings_abandoned: IntCounter,
    shipper_queue_depth: IntGauge,
    shipper_queue_drops: IntCounter,
    http_retries: IntCounter,
    errors_by_subsystem: IntCounterVec,
    process_cpu_percent: IntGauge,
    process_memory_bytes: IntGauge,
    process_uptime_seconds: IntGauge,
    system: Mutex<System>,
    pid: Pid,
    started_at: std::time::Instant,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let calls_seen = IntCounter::new("cdrlink_calls_seen_total", "Distinct linkedids observed").unwrap();
        let calls_shipped = IntCounterVec::new(
            Opts::new("cdrlink_calls_shipped_total", "Documents shipped, by phase"),
            &["phase"],
        )
        .unwrap();
        let recordings_tracked = IntCounter::new("cdrlink_recordings_tracked_total", "Recording descriptors created").unwrap();
        let recordings_uploaded = IntCounter::new("cdrlink_recordings_uploaded_total", "Recordings successfully uploaded").unwrap();
        let recordings_abandoned = IntCounter::new("cdrlink_recordings_abandoned_total", "Recordings abandoned past the retry ceiling").unwrap();
        let shipper_queue_depth = IntGauge::new("cdrlink_shipper_queue_depth", "Current items in the shipper queue").unwrap();
        let shipper_queue_drops = IntCounter::new("cdrlink_shipper_queue_drops_total", "Items dropped because the shipper queue was full").unwrap();
        let http_retries = IntCounter::new("cdrlink_http_retries_total", "HTTP retry attempts across all transports").unwrap();
        let errors_by_subsystem = IntCounterVec::new(
            Opts::new("cdrlink_errors_total", "Errors, by subsystem"),
            &["subsystem"],
        )
        .unwrap();
        let process_cpu_percent = IntGauge::new("cdrlink_process_cpu_percent", "Process CPU usage, percent x100").unwrap();
        let process_memory_bytes = IntGauge::new("cdrlink_process_memory_bytes", "Process resident memory, bytes").unwrap();
        let process_uptime_seconds = IntGauge::new("cdrlink_process_uptime_seconds", "Seconds since process start").unwrap();

        for collector in [
            Box::new(calls_seen.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(calls_shipped.clone()),
            Box::new(recordings_tracked.clone()),
            Box::new(recordings_uploaded.clone()),
            Box::new(recordings_abandoned.clone()),
            Box::new(shipper_queue_depth.clone()),
            Box::new(shipper_queue_drops.clone()),
            Box::new(http_retries.clone()),
            Box::new(errors_by_subsystem.clone()),
            Box::new(process_cpu_percent.clone()),
            Box::new(process_memory_bytes.clone()),
            Box::new(process_uptime_seconds.clone()),
        ] {
            let _ = registry.register(collector);
        }

        Self {
            registry,
            calls_seen,
            calls_shipped,
            recordings_tracked,
            recordings_uploaded,
            recordings_abandoned,
            shipper_queue_depth,
            shipper_queue_drops,
            http_retries,
            errors_by_subsystem,
            process_cpu_percent,
            process_memory_bytes,
            process_uptime_seconds,
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
            started_at: std::time::Instant::now(),
        }
    }

    pub fn call_seen(&self) {
        self.calls_seen.inc();
    }

    pub fn call_shipped(&self, phase: ShipPhase) {
        let label = match phase {
            ShipPhase::Initial => "initial",
            ShipPhase::Update => "update",
            ShipPhase::Complete => "complete",
        };
        self.calls_shipped.with_label_values(&[label]).inc();
    }

    pub fn recording_tracked(&self) {
        self.recordings_tracked.inc();
    }

    pub fn recording_uploaded(&self) {
        self.recordings_uploaded.inc();
    }

    pub fn recording_abandoned(&self) {
        self.recordings_abandoned.inc();
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.shipper_queue_depth.set(depth);
    }

    pub fn queue_drop(&self) {
        self.shipper_queue_drops.inc();
    }

    pub fn http_retry(&self) {
        self.http_retries.inc();
    }

    pub fn error(&self, subsystem: &str) {
        self.errors_by_subsystem.with_label_values(&[subsystem]).inc();
    }

    /// Refreshes the process-level gauges from `sysinfo`. Cheap enough to call once per
    /// metrics-scrape request rather than on a separate timer.
    pub fn refresh_process_metrics(&self) {
        let mut system = self.system.lock().expect("metrics system mutex poisoned");
        system.refresh_process(self.pid);
        if let Some(process) = system.process(self.pid) {
            self.process_cpu_percent.set((process.cpu_usage() * 100.0) as i64);
            self.process_memory_bytes.set(process.memory() as i64);
        }
        self.process_uptime_seconds.set(self.started_at.elapsed().as_secs() as i64);
    }

    pub fn render(&self) -> String {
        self.refresh_process_metrics();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("prometheus text encoding");
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = Metrics::new();
        assert_eq!(metrics.calls_seen.get(), 0);
        metrics.call_seen();
        assert_eq!(metrics.calls_seen.get(), 1);
    }

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = Metrics::new();
        metrics.call_shipped(ShipPhase::Complete);
        let text = metrics.render();
        assert!(text.contains("cdrlink_calls_shipped_total"));
    }
}
