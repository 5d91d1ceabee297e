//! Database CDR reader. CDR always reads from the database regardless of CEL source mode.

use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::model::cdr::Disposition;
use crate::model::Cdr;
use crate::{Error, Result};

pub struct CdrReader {
    pool: AnyPool,
    table: String,
    batch_size: u32,
    watermark: DateTime<Utc>,
}

fn row_to_cdr(row: &sqlx::any::AnyRow) -> Result<Cdr> {
    let disposition_raw: String = row
        .try_get("disposition")
        .map_err(|e| Error::parse(format!("cdr row missing disposition: {}", e)))?;
    Ok(Cdr {
        calldate: row.try_get("calldate").map_err(|e| Error::parse(e.to_string()))?,
        src: row.try_get("src").unwrap_or_default(),
        dst: row.try_get("dst").unwrap_or_default(),
        context: row.try_get("context").unwrap_or_default(),
        dcontext: row.try_get("dcontext").unwrap_or_default(),
        channel: row.try_get("channel").unwrap_or_default(),
        dstchannel: row.try_get("dstchannel").unwrap_or_default(),
        disposition: Disposition::from_raw(&disposition_raw),
        duration: row.try_get::<i64, _>("duration").unwrap_or(0),
        billsec: row.try_get::<i64, _>("billsec").unwrap_or(0),
        uniqueid: row.try_get("uniqueid").unwrap_or_default(),
        linkedid: row.try_get("linkedid").unwrap_or_default(),
        accountcode: row.try_get("accountcode").unwrap_or_default(),
        amaflags: row.try_get::<i32, _>("amaflags").unwrap_or(0),
        lastapp: row.try_get("lastapp").unwrap_or_default(),
        lastdata: row.try_get("lastdata").unwrap_or_default(),
    })
}

impl CdrReader {
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
            table: config.cdr_table.clone(),
            batch_size: config.batch_size,
            watermark: Utc::now(),
        };
        reader.bootstrap().await?;
        Ok(reader)
    }

    /// On first launch, seeds the watermark from the maximum `calldate` already in the table
    /// (per the database clock), so a fresh install never re-ingests history. An empty table
    /// seeds from `SELECT NOW()` on the database server, not the agent's own clock.
    async fn bootstrap(&mut self) -> Result<()> {
        let sql = format!("SELECT MAX(calldate) AS max_calldate FROM {}", self.table);
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await.map_err(Error::Database)?;

        if let Some(row) = row {
            if let Ok(Some(max_calldate)) = row.try_get::<Option<DateTime<Utc>>, _>("max_calldate") {
                self.watermark = max_calldate;
                info!(watermark = %self.watermark, "CDR watermark bootstrapped from existing rows");
                return Ok(());
            }
        }

        let now_row = sqlx::query("SELECT NOW() AS db_now")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        self.watermark = now_row
            .try_get::<DateTime<Utc>, _>("db_now")
            .unwrap_or_else(|_| Utc::now());
        info!(watermark = %self.watermark, "CDR table empty, watermark bootstrapped from database clock");
        Ok(())
    }

    /// One poll tick: returns the distinct `linkedid`s touched since the watermark, each paired
    /// with its full, calldate-ordered CDR rows. The watermark advances only to the maximum
    /// `calldate` actually observed in this batch, never to wall-clock.
    pub async fn poll(&mut self) -> Result<Vec<(String, Vec<Cdr>)>> {
        let linkedid_sql = format!(
            "SELECT DISTINCT linkedid, MAX(calldate) AS max_calldate FROM {} WHERE calldate > ? GROUP BY linkedid ORDER BY MAX(calldate) DESC LIMIT ?",
            self.table
        );

        let rows = sqlx::query(&linkedid_sql)
            .bind(self.watermark)
            .bind(self.batch_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut linkedids = Vec::with_capacity(rows.len());
        let mut new_watermark = self.watermark;
        for row in &rows {
            let linkedid: String = row.try_get("linkedid").unwrap_or_default();
            if linkedid.is_empty() {
                continue;
            }
            if let Ok(max_calldate) = row.try_get::<DateTime<Utc>, _>("max_calldate") {
                new_watermark = new_watermark.max(max_calldate);
            }
            linkedids.push(linkedid);
        }

        let mut results = Vec::with_capacity(linkedids.len());
        for linkedid in linkedids {
            match self.fetch_cdrs(&linkedid).await {
                Ok(cdrs) => results.push((linkedid, cdrs)),
                Err(e) => warn!(linkedid = %linkedid, error = %e, "failed to fetch CDR rows for linkedid"),
            }
        }

        self.watermark = new_watermark;
        debug!(count = results.len(), watermark = %self.watermark, "CDR poll tick complete");
        Ok(results)
    }

    pub async fn fetch_cdrs(&self, linkedid: &str) -> Result<Vec<Cdr>> {
        let sql = format!("SELECT * FROM {} WHERE linkedid = ? ORDER BY calldate ASC", self.table);
        let rows = sqlx::query(&sql)
            .bind(linkedid)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(row_to_cdr).collect()
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
