//! Minimal AMI (Asterisk Manager Interface) client: a line-oriented TCP protocol that frames
//! events as blocks of `Key: Value` lines terminated by a blank line. Shared by the CEL
//! event-stream source mode and the Recording Tracker's AMI path.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::AmiSourceConfig;

#[derive(Debug, Clone, Default)]
pub struct AmiEvent {
    pub event: String,
    pub fields: HashMap<String, String>,
}

impl AmiEvent {
    /// Tries each candidate field name in order, returning the first non-empty value. Used for
    /// the filename field, which Asterisk has emitted under several historical names.
    pub fn first_of(&self, candidates: &[&str]) -> Option<String> {
        for name in candidates {
            if let Some(v) = self.fields.get(*name) {
                if !v.is_empty() {
                    return Some(v.clone());
                }
            }
        }
        None
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str())
    }
}

fn parse_block(block: &str) -> Option<AmiEvent> {
    let mut fields = HashMap::new();
    for line in block.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    let event = fields.get("Event").cloned()?;
    Some(AmiEvent { event, fields })
}

async fn read_block(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<String>> {
    let mut block = String::new();
    let mut buf = String::new();
    loop {
        buf.clear();
        let n = reader.read_line(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.trim().is_empty() {
            if block.is_empty() {
                continue;
            }
            return Ok(Some(block));
        }
        block.push_str(&buf);
    }
}

async fn connect_and_login(config: &AmiSourceConfig) -> std::io::Result<BufReader<TcpStream>> {
    let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
    let mut reader = BufReader::new(stream);

    // Banner line.
    let mut banner = String::new();
    reader.read_line(&mut banner).await?;

    let login = format!(
        "Action: Login\r\nUsername: {}\r\nSecret: {}\r\nEvents: on\r\n\r\n",
        config.username, config.secret
    );
    reader.get_mut().write_all(login.as_bytes()).await?;
    // Consume the login response block.
    let _ = read_block(&mut reader).await?;
    Ok(reader)
}

/// Spawns a background task that reconnects with exponential backoff (1s -> 60s cap) and
/// forwards every parsed AMI event onto the returned broadcast channel. Buffer is sized
/// generously since recording events and CEL-equivalent events share the same feed.
pub fn spawn_event_stream(config: AmiSourceConfig) -> broadcast::Receiver<AmiEvent> {
    let (tx, rx) = broadcast::channel(4096);

    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(config.reconnect_min_backoff_secs.max(1));
        let cap = Duration::from_secs(config.reconnect_max_backoff_secs.max(1));

        loop {
            match connect_and_login(&config).await {
                Ok(mut reader) => {
                    info!(host = %config.host, port = config.port, "AMI connected");
                    backoff = Duration::from_secs(config.reconnect_min_backoff_secs.max(1));
                    loop {
                        match read_block(&mut reader).await {
                            Ok(Some(block)) => {
                                if let Some(event) = parse_block(&block) {
                                    debug!(event = %event.event, "AMI event received");
                                    let _ = tx.send(event);
                                }
                            }
                            Ok(None) => {
                                warn!("AMI connection closed by peer");
                                break;
                            }
                            Err(e) => {
                                error!(error = %e, "AMI read error");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "AMI connect failed, retrying");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(cap);
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_event_block() {
        let block = "Event: MixMonitorStart\r\nChannel: PJSIP/100-1\r\nUniqueid: 1700000000.42\r\n";
        let event = parse_block(block).unwrap();
        assert_eq!(event.event, "MixMonitorStart");
        assert_eq!(event.get("Channel"), Some("PJSIP/100-1"));
    }

    #[test]
    fn first_of_returns_first_non_empty_candidate() {
        let mut fields = HashMap::new();
        fields.insert("Mixmonitor_filename".to_string(), String::new());
        fields.insert("File".to_string(), "1700000000.42.wav".to_string());
        let event = AmiEvent { event: "MixMonitorStart".into(), fields };
        assert_eq!(
            event.first_of(&["Mixmonitor_filename", "MixMonitor_filename", "File"]),
            Some("1700000000.42.wav".to_string())
        );
    }
}
