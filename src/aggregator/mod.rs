//! Aggregator: groups polled CDR/CEL rows by `linkedid`, detects completion, decides whether and
//! how to emit a consolidated document, and hands it off to the Shipper. The driving loop runs a
//! retry sweep (calls with a recorded shipping error) before each poll, per §4.2.

pub mod cache;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, ShippingMode};
use crate::consolidator;
use crate::metrics::Metrics;
use crate::model::{CallGroup, ShipPhase, ShippingState};
use crate::recording::Tracker as RecordingTracker;
use crate::shipper::ShipRequest;
use crate::sources::{CdrReader, CelSource};
use crate::store::Store;
use crate::Result;

use cache::ActiveCallCache;

pub struct Aggregator {
    config: AgentConfig,
    cdr_reader: CdrReader,
    cel_source: Box<dyn CelSource>,
    store: Arc<Store>,
    ship_tx: mpsc::Sender<ShipRequest>,
    recording_tracker: Option<Arc<RecordingTracker>>,
    metrics: Option<Arc<Metrics>>,
    active: ActiveCallCache,
}

impl Aggregator {
    pub fn new(
        config: AgentConfig,
        cdr_reader: CdrReader,
        cel_source: Box<dyn CelSource>,
        store: Arc<Store>,
        ship_tx: mpsc::Sender<ShipRequest>,
        recording_tracker: Option<Arc<RecordingTracker>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            active: ActiveCallCache::new(10_000),
            config,
            cdr_reader,
            cel_source,
            store,
            ship_tx,
            recording_tracker,
            metrics,
        }
    }

    /// Drives the retry-sweep-then-poll sequence forever, with adaptive pacing: the interval
    /// narrows toward the configured floor when a tick processes more than 10 calls, and widens
    /// toward the configured ceiling when a tick processes nothing.
    pub async fn run(mut self) {
        let floor = Duration::from_secs(self.config.general.min_poll_interval_secs.max(1));
        let ceiling = Duration::from_secs(self.config.general.max_poll_interval_secs.max(floor.as_secs()));
        let mut interval = self.config.poll_interval().clamp(floor, ceiling);

        info!(?interval, "aggregator driving loop started");
        loop {
            let processed = self.tick().await;
            interval = if processed > 10 {
                half(interval).clamp(floor, ceiling)
            } else if processed == 0 {
                double(interval).clamp(floor, ceiling)
            } else {
                interval.clamp(floor, ceiling)
            };
            tokio::time::sleep(interval).await;
        }
    }

    /// One retry-sweep-then-poll cycle. Returns the number of calls processed, which feeds the
    /// adaptive pacing decision.
    async fn tick(&mut self) -> usize {
        let mut processed = 0;

        match self.store.calls_with_errors().await {
            Ok(errored) => {
                let now = Utc::now();
                for state in errored {
                    if now - state.first_seen >= chrono::Duration::hours(48) {
                        continue;
                    }
                    match self.cdr_reader.fetch_cdrs(&state.linkedid).await {
                        Ok(cdrs) if !cdrs.is_empty() => {
                            if let Err(e) = self.process_single_call(&state.linkedid, cdrs).await {
                                warn!(linkedid = %state.linkedid, error = %e, "retry sweep failed to process call");
                            } else {
                                processed += 1;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(linkedid = %state.linkedid, error = %e, "retry sweep CDR refetch failed"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "retry sweep could not load errored calls"),
        }

        if let Err(e) = self.cel_source.tick().await {
            warn!(error = %e, "CEL source tick failed");
        }

        match self.cdr_reader.poll().await {
            Ok(updates) => {
                for (linkedid, cdrs) in updates {
                    if let Some(m) = &self.metrics {
                        m.call_seen();
                    }
                    if let Err(e) = self.process_single_call(&linkedid, cdrs).await {
                        warn!(linkedid = %linkedid, error = %e, "failed to process call");
                    } else {
                        processed += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "CDR poll failed"),
        }

        debug!(processed, "aggregator tick complete");
        processed
    }

    async fn process_single_call(&mut self, linkedid: &str, cdrs: Vec<crate::model::Cdr>) -> Result<()> {
        let now = Utc::now();
        let mut group = self.active.get_or_create(linkedid);
        merge_cdrs(&mut group, cdrs);
        group.cels = self.cel_source.records_for(linkedid);

        let quiescence = chrono::Duration::seconds(self.config.general.completion_quiescence_secs);
        let is_complete = group.is_complete(now, quiescence);

        let mut state = self
            .store
            .load_shipping_state(linkedid)
            .await?
            .unwrap_or_else(|| ShippingState::new(linkedid, now));

        let has_grown = state.has_grown(group.cdr_count(), group.cel_count());
        let completion_transition = is_complete && !state.is_complete;
        let phase = self.decide_phase(&state, has_grown, is_complete, completion_transition, now);

        if let Some(phase) = phase {
            let recording_files = match &self.recording_tracker {
                Some(tracker) => Some(tracker.discover_recordings_for_linkedid(linkedid).await),
                None => None,
            };
            let recording_files = recording_files.filter(|v| !v.is_empty());

            if let Some(document) =
                consolidator::build_document(&group, &self.config, is_complete, phase, recording_files, now)
            {
                match self.ship_tx.try_send(ShipRequest { document }) {
                    Ok(()) => {
                        state.last_cdr_count = group.cdr_count() as i64;
                        state.last_cel_count = group.cel_count() as i64;
                        state.is_complete = is_complete;
                        state.last_updated = now;
                        self.store.save_shipping_state(&state).await?;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        if let Some(m) = &self.metrics {
                            m.queue_drop();
                        }
                        warn!(linkedid = %linkedid, "shipper queue full, dropping emission for this tick");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(linkedid = %linkedid, "shipper queue closed, cannot hand off document");
                    }
                }
            }
        } else if has_grown || completion_transition {
            // Not emitting this cycle (e.g. already shipped complete, or progressive's
            // periodic window hasn't elapsed) but still worth remembering the latest counts
            // so a later emission decision is measured against current, not stale, state.
            state.last_cdr_count = group.cdr_count() as i64;
            state.last_cel_count = group.cel_count() as i64;
            state.is_complete = is_complete;
            state.last_updated = now;
            self.store.save_shipping_state(&state).await?;
        }

        if is_complete {
            self.active.remove(linkedid);
        } else {
            self.active.put(group);
        }

        Ok(())
    }

    fn decide_phase(
        &self,
        state: &ShippingState,
        has_grown: bool,
        is_complete: bool,
        completion_transition: bool,
        now: chrono::DateTime<Utc>,
    ) -> Option<ShipPhase> {
        if state.already_shipped_complete() {
            return None;
        }

        match self.config.shipping.mode {
            ShippingMode::Complete => {
                if completion_transition {
                    return Some(ShipPhase::Complete);
                }
                let interval = self.config.shipping.long_call_update_interval_secs;
                if interval > 0 && !is_complete && now - state.last_updated >= chrono::Duration::seconds(interval as i64) {
                    return Some(ShipPhase::Update);
                }
                None
            }
            ShippingMode::Progressive => {
                if completion_transition {
                    return Some(ShipPhase::Complete);
                }
                if state.ship_count == 0 && state.error_count == 0 {
                    return Some(ShipPhase::Initial);
                }
                if has_grown {
                    return Some(ShipPhase::Update);
                }
                if !is_complete && now - state.last_updated >= chrono::Duration::seconds(60) {
                    return Some(ShipPhase::Update);
                }
                None
            }
        }
    }
}

/// Merges newly-fetched CDR rows into a call group by `uniqueid`, replacing any existing row
/// with the same `uniqueid` (a later read can carry an updated `disposition`) and appending new
/// ones.
fn merge_cdrs(group: &mut CallGroup, cdrs: Vec<crate::model::Cdr>) {
    for cdr in cdrs {
        if let Some(existing) = group.cdrs.iter_mut().find(|c| c.uniqueid == cdr.uniqueid) {
            *existing = cdr;
        } else {
            group.cdrs.push(cdr);
        }
    }
}

fn half(d: Duration) -> Duration {
    Duration::from_secs_f64((d.as_secs_f64() / 2.0).max(1.0))
}

fn double(d: Duration) -> Duration {
    Duration::from_secs_f64(d.as_secs_f64() * 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cdr::Disposition;
    use crate::model::Cdr;

    fn cdr(uniqueid: &str, duration: i64) -> Cdr {
        Cdr {
            calldate: Utc::now(),
            src: "100".into(),
            dst: "200".into(),
            context: "from-internal".into(),
            dcontext: "from-internal".into(),
            channel: "PJSIP/100-1".into(),
            dstchannel: "PJSIP/200-2".into(),
            disposition: Disposition::Answered,
            duration,
            billsec: duration,
            uniqueid: uniqueid.into(),
            linkedid: "1.1".into(),
            accountcode: String::new(),
            amaflags: 3,
            lastapp: "Dial".into(),
            lastdata: String::new(),
        }
    }

    #[test]
    fn merge_replaces_rows_sharing_a_uniqueid() {
        let mut group = CallGroup::new("1.1");
        merge_cdrs(&mut group, vec![cdr("1.1", 10)]);
        merge_cdrs(&mut group, vec![cdr("1.1", 42)]);
        assert_eq!(group.cdrs.len(), 1);
        assert_eq!(group.cdrs[0].duration, 42);
    }

    #[test]
    fn merge_appends_rows_with_new_uniqueids() {
        let mut group = CallGroup::new("1.1");
        merge_cdrs(&mut group, vec![cdr("1.1", 10)]);
        merge_cdrs(&mut group, vec![cdr("1.2", 5)]);
        assert_eq!(group.cdrs.len(), 2);
    }

    #[test]
    fn pacing_halves_on_busy_tick_and_doubles_when_idle() {
        let base = Duration::from_secs(8);
        assert_eq!(half(base), Duration::from_secs(4));
        assert_eq!(double(base), Duration::from_secs(16));
    }
}
