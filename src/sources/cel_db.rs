//! Database CEL reader: same polling shape as the CDR reader, populating a per-linkedid cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::model::{Cel, CelEventType};
use crate::sources::CelSource;
use crate::{Error, Result};

pub struct CelDbReader {
    pool: AnyPool,
    table: String,
    batch_size: u32,
    watermark: DateTime<Utc>,
    cache: DashMap<String, Vec<Cel>>,
}

fn row_to_cel(row: &sqlx::any::AnyRow) -> Result<Cel> {
    let eventtype_raw: String = row.try_get("eventtype").unwrap_or_default();
    Ok(Cel {
        eventtime: row.try_get("eventtime").map_err(|e| Error::parse(e.to_string()))?,
        eventtype: CelEventType::from_raw(&eventtype_raw),
        cid_name: row.try_get("cid_name").unwrap_or_default(),
        cid_num: row.try_get("cid_num").unwrap_or_default(),
        cid_dnid: row.try_get("cid_dnid").unwrap_or_default(),
        exten: row.try_get("exten").unwrap_or_default(),
        context: row.try_get("context").unwrap_or_default(),
        channame: row.try_get("channame").unwrap_or_default(),
        appname: row.try_get("appname").unwrap_or_default(),
        appdata: row.try_get("appdata").unwrap_or_default(),
        uniqueid: row.try_get("uniqueid").unwrap_or_default(),
        linkedid: row.try_get("linkedid").unwrap_or_default(),
        peer: row.try_get("peer").unwrap_or_default(),
        extra: row.try_get("extra").unwrap_or_default(),
    })
}

impl CelDbReader {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.dsn())
            .await
            .map_err(Error::Database)?;

        let mut reader = Self {
            pool,
            table: config.cel_table.clone(),
            batch_size: config.batch_size,
            watermark: Utc::now(),
            cache: DashMap::new(),
        };
        reader.bootstrap().await?;
        Ok(reader)
    }

    async fn bootstrap(&mut self) -> Result<()> {
        let sql = format!("SELECT MAX(eventtime) AS max_eventtime FROM {}", self.table);
        if let Ok(Some(row)) = sqlx::query(&sql).fetch_optional(&self.pool).await {
            if let Ok(Some(max_eventtime)) = row.try_get::<Option<DateTime<Utc>>, _>("max_eventtime") {
                self.watermark = max_eventtime;
                info!(watermark = %self.watermark, "CEL watermark bootstrapped from existing rows");
                return Ok(());
            }
        }
        self.watermark = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl CelSource for CelDbReader {
    async fn tick(&mut self) -> Result<()> {
        let sql = format!(
            "SELECT DISTINCT linkedid, MAX(eventtime) AS max_eventtime FROM {} WHERE eventtime > ? GROUP BY linkedid ORDER BY MAX(eventtime) DESC LIMIT ?",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(self.watermark)
            .bind(self.batch_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut new_watermark = self.watermark;
        for row in &rows {
            let linkedid: String = row.try_get("linkedid").unwrap_or_default();
            if linkedid.is_empty() {
                continue;
            }
            if let Ok(max_eventtime) = row.try_get::<DateTime<Utc>, _>("max_eventtime") {
                new_watermark = new_watermark.max(max_eventtime);
            }

            let fetch_sql = format!("SELECT * FROM {} WHERE linkedid = ? ORDER BY eventtime ASC", self.table);
            match sqlx::query(&fetch_sql).bind(&linkedid).fetch_all(&self.pool).await {
                Ok(cel_rows) => {
                    let cels: Result<Vec<Cel>> = cel_rows.iter().map(row_to_cel).collect();
                    match cels {
                        Ok(cels) => {
                            self.cache.insert(linkedid.clone(), cels);
                        }
                        Err(e) => warn!(linkedid = %linkedid, error = %e, "failed to decode CEL rows"),
                    }
                }
                Err(e) => warn!(linkedid = %linkedid, error = %e, "failed to fetch CEL rows"),
            }
        }
        self.watermark = new_watermark;
        debug!(watermark = %self.watermark, "CEL db tick complete");
        Ok(())
    }

    fn records_for(&self, linkedid: &str) -> Vec<Cel> {
        self.cache.get(linkedid).map(|v| v.clone()).unwrap_or_default()
    }

    async fn close(&mut self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
