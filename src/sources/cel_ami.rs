//! AMI-backed CEL source: subscribes to the shared AMI event broadcast and reinterprets each
//! `CEL` manager event as a `Cel` record, caching by linkedid the same way the other readers do.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::ami::{self, AmiEvent};
use crate::config::AmiSourceConfig;
use crate::model::{Cel, CelEventType};
use crate::sources::CelSource;
use crate::Result;

pub struct AmiCelReader {
    rx: broadcast::Receiver<AmiEvent>,
    cache: DashMap<String, Vec<Cel>>,
}

fn event_to_cel(event: &AmiEvent) -> Option<Cel> {
    if event.event != "CEL" {
        return None;
    }
    let linkedid = event.get("LinkedID").unwrap_or_default().to_string();
    if linkedid.is_empty() {
        return None;
    }
    let eventtime = event
        .get("CELTime")
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Utc::now);

    Some(Cel {
        eventtime,
        eventtype: CelEventType::from_raw(event.get("EventName").unwrap_or_default()),
        cid_name: event.get("CallerIDName").unwrap_or_default().to_string(),
        cid_num: event.get("CallerIDNum").unwrap_or_default().to_string(),
        cid_dnid: event.get("CallerIDdnid").unwrap_or_default().to_string(),
        exten: event.get("Exten").unwrap_or_default().to_string(),
        context: event.get("Context").unwrap_or_default().to_string(),
        channame: event.get("Channel").unwrap_or_default().to_string(),
        appname: event.get("Application").unwrap_or_default().to_string(),
        appdata: event.get("AppData").unwrap_or_default().to_string(),
        uniqueid: event.get("Uniqueid").unwrap_or_default().to_string(),
        linkedid,
        peer: event.get("Peer").unwrap_or_default().to_string(),
        extra: event.get("Extra").unwrap_or_default().to_string(),
    })
}

impl AmiCelReader {
    pub fn connect(config: &AmiSourceConfig) -> Self {
        Self { rx: ami::spawn_event_stream(config.clone()), cache: DashMap::new() }
    }
}

#[async_trait]
impl CelSource for AmiCelReader {
    async fn tick(&mut self) -> Result<()> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(cel) = event_to_cel(&event) {
                        debug!(linkedid = %cel.linkedid, "CEL event received over AMI");
                        self.cache.entry(cel.linkedid.clone()).or_default().push(cel);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "AMI CEL reader lagged, some events were dropped");
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    warn!("AMI event stream closed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn records_for(&self, linkedid: &str) -> Vec<Cel> {
        self.cache.get(linkedid).map(|v| v.clone()).unwrap_or_default()
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn ignores_non_cel_events() {
        let event = AmiEvent { event: "MixMonitorStart".into(), fields: HashMap::new() };
        assert!(event_to_cel(&event).is_none());
    }

    #[test]
    fn maps_cel_event_fields() {
        let mut fields = HashMap::new();
        fields.insert("LinkedID".to_string(), "1700000000.1".to_string());
        fields.insert("EventName".to_string(), "ANSWER".to_string());
        fields.insert("Channel".to_string(), "PJSIP/100-1".to_string());
        let event = AmiEvent { event: "CEL".into(), fields };
        let cel = event_to_cel(&event).unwrap();
        assert_eq!(cel.linkedid, "1700000000.1");
        assert_eq!(cel.channame, "PJSIP/100-1");
    }
}
