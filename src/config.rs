//! Configuration for the cdrlink agent.
//!
//! Layered lowest-to-highest: built-in defaults → optional TOML file (`--config`) →
//! process environment variables (`CDRLINK_`-prefixed, `__`-separated for nesting).
//! The fully merged structure is validated once, at startup, before any subsystem runs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub general: GeneralConfig,
    pub database: DatabaseConfig,
    pub cel_source: CelSourceConfig,
    /// AMI connection used for recording-lifecycle events (`MixMonitorStart`/`Stop`), independent
    /// of the CEL source mode. When `cel_source` is itself `ami`, that mode's connection settings
    /// are reused and this field is ignored.
    pub ami: Option<AmiSourceConfig>,
    pub api: ApiConfig,
    pub shipping: ShippingConfig,
    pub recording: RecordingConfig,
    pub tenant: TenantConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Overrides `gethostname()` in the shipped document's `hostname` field.
    pub hostname_override: Option<String>,
    pub customer_id: Option<i64>,
    pub default_tenant: Option<String>,
    pub connector_version: String,
    pub poll_interval_secs: u64,
    /// Floor the adaptive poll interval narrows toward when a tick processes many calls.
    pub min_poll_interval_secs: u64,
    /// Ceiling the adaptive poll interval widens toward when a tick processes nothing.
    pub max_poll_interval_secs: u64,
    /// Call completion quiescence window: no CDR/CEL activity for this long, with all
    /// dispositions final, counts as complete even without an explicit LINKEDID_END.
    pub completion_quiescence_secs: i64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            hostname_override: None,
            customer_id: None,
            default_tenant: None,
            connector_version: env!("CARGO_PKG_VERSION").to_string(),
            poll_interval_secs: 5,
            min_poll_interval_secs: 2,
            max_poll_interval_secs: 30,
            completion_quiescence_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub driver: DatabaseDriver,
    pub cdr_table: String,
    pub cel_table: String,
    pub batch_size: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    Postgres,
    Mysql,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            name: "asteriskcdrdb".to_string(),
            user: "cdrlink".to_string(),
            password: String::new(),
            driver: DatabaseDriver::Mysql,
            cdr_table: "cdr".to_string(),
            cel_table: "cel".to_string(),
            batch_size: 200,
            connect_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn dsn(&self) -> String {
        match self.driver {
            DatabaseDriver::Postgres => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.name
            ),
            DatabaseDriver::Mysql => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.name
            ),
        }
    }
}

/// Exactly one CEL source mode is selected at startup; CDR always reads from the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CelSourceConfig {
    Db,
    Csv(CsvSourceConfig),
    Ami(AmiSourceConfig),
}

impl Default for CelSourceConfig {
    fn default() -> Self {
        Self::Db
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvSourceConfig {
    pub path: String,
    pub poll_interval_secs: u64,
    pub line_cap: usize,
    pub cache_ttl_secs: u64,
}

impl Default for CsvSourceConfig {
    fn default() -> Self {
        Self {
            path: "/var/log/asterisk/cel-custom/Master.csv".to_string(),
            poll_interval_secs: 5,
            line_cap: 10_000,
            cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmiSourceConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub reconnect_min_backoff_secs: u64,
    pub reconnect_max_backoff_secs: u64,
}

impl Default for AmiSourceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5038,
            username: "cdrlink".to_string(),
            secret: String::new(),
            reconnect_min_backoff_secs: 1,
            reconnect_max_backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub key: String,
    pub request_timeout_secs: u64,
    pub user_agent_product: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://ingest.cdrlink.example/v1".to_string(),
            key: String::new(),
            request_timeout_secs: 30,
            user_agent_product: "cdrlink-agent".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShippingMode {
    Complete,
    Progressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShipperTransport {
    Batch,
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingConfig {
    pub mode: ShippingMode,
    pub transport: ShipperTransport,
    pub batch_size: usize,
    pub batch_timeout_secs: u64,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub max_concurrent_uploads: usize,
    pub long_call_update_interval_secs: u64,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    pub shutdown_deadline_secs: u64,
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            mode: ShippingMode::Complete,
            transport: ShipperTransport::Batch,
            batch_size: 150,
            batch_timeout_secs: 30,
            queue_capacity: 10_000,
            max_retries: 3,
            max_concurrent_uploads: 10,
            long_call_update_interval_secs: 0,
            retry_base_secs: 1,
            retry_cap_secs: 60,
            shutdown_deadline_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub root_paths: Vec<String>,
    pub min_stable_size_bytes: i64,
    pub stabilization_checks: i32,
    pub scan_interval_secs: u64,
    pub upload_field_name: String,
    pub memory_ceiling_bytes: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root_paths: vec!["/var/spool/asterisk/monitor".to_string()],
            min_stable_size_bytes: 1000,
            stabilization_checks: 2,
            scan_interval_secs: 30,
            upload_field_name: "audio".to_string(),
            memory_ceiling_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    pub known_trunks: Vec<String>,
    pub internal_contexts: Vec<String>,
    pub outbound_route_contexts: Vec<String>,
    pub international_prefixes: Vec<String>,
    pub extension_min_digits: usize,
    pub extension_max_digits: usize,
}

impl TenantConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.internal_contexts.is_empty() {
            self.internal_contexts = vec![
                "from-internal".into(),
                "from-inside".into(),
                "from-phone".into(),
                "from-extension".into(),
                "from-local".into(),
            ];
        }
        if self.outbound_route_contexts.is_empty() {
            self.outbound_route_contexts = vec![
                "outbound-allroutes".into(),
                "outrt-".into(),
                "macro-dialout".into(),
            ];
        }
        if self.extension_min_digits == 0 {
            self.extension_min_digits = 2;
        }
        if self.extension_max_digits == 0 {
            self.extension_max_digits = 7;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub primary_path: String,
    pub fallback_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            primary_path: "/data/cdrlink-agent.db".to_string(),
            fallback_path: "/tmp/cdrlink-agent.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0:9464".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            database: DatabaseConfig::default(),
            cel_source: CelSourceConfig::default(),
            ami: None,
            api: ApiConfig::default(),
            shipping: ShippingConfig::default(),
            recording: RecordingConfig::default(),
            tenant: TenantConfig::default().with_defaults(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("invalid TOML configuration: {}", e)))?;
        Ok(config)
    }

    /// Layers defaults under an optional TOML file, then applies `CDRLINK_`-prefixed
    /// environment overrides on top.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AgentConfig::default())?);

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CDRLINK")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        let config: AgentConfig = merged.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.key.is_empty() {
            return Err(Error::parse("API key is required (api.key / CDRLINK_API__KEY)"));
        }
        if self.api.base_url.is_empty() {
            return Err(Error::parse("API base URL is required"));
        }
        if self.database.host.is_empty() || self.database.name.is_empty() {
            return Err(Error::parse("database host and name are required"));
        }
        match &self.cel_source {
            CelSourceConfig::Csv(csv) if csv.path.is_empty() => {
                return Err(Error::parse("CEL CSV mode requires cel_source.path"));
            }
            CelSourceConfig::Ami(ami) if ami.host.is_empty() => {
                return Err(Error::parse("CEL AMI mode requires cel_source.host"));
            }
            _ => {}
        }
        if self.shipping.batch_size == 0 {
            return Err(Error::parse("shipping.batch_size must be > 0"));
        }
        if self.shipping.queue_capacity == 0 {
            return Err(Error::parse("shipping.queue_capacity must be > 0"));
        }
        if self.recording.root_paths.is_empty() {
            return Err(Error::parse("recording.root_paths must not be empty"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.general.poll_interval_secs)
    }

    /// The AMI connection settings to use for recording-lifecycle events: the CEL AMI mode's
    /// connection when that mode is selected (one socket serves both feeds), otherwise the
    /// dedicated `ami` section if configured.
    pub fn recording_ami_config(&self) -> Option<AmiSourceConfig> {
        match &self.cel_source {
            CelSourceConfig::Ami(cfg) => Some(cfg.clone()),
            _ => self.ami.clone(),
        }
    }

    pub fn hostname(&self) -> String {
        self.general
            .hostname_override
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown-host".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_api_key() {
        let config = AgentConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn valid_config_passes_validation() {
        let mut config = AgentConfig::default();
        config.api.key = "sk_t1_abcdef".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn csv_mode_requires_path() {
        let mut config = AgentConfig::default();
        config.api.key = "sk_t1_abcdef".to_string();
        config.cel_source = CelSourceConfig::Csv(CsvSourceConfig {
            path: String::new(),
            ..CsvSourceConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn dsn_renders_driver_specific_scheme() {
        let mut db = DatabaseConfig::default();
        db.driver = DatabaseDriver::Postgres;
        assert!(db.dsn().starts_with("postgres://"));
        db.driver = DatabaseDriver::Mysql;
        assert!(db.dsn().starts_with("mysql://"));
    }
}
