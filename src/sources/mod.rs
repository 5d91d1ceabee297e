//! Source Readers: polymorphic CEL ingestion (database, CSV tail, AMI event stream) behind one
//! capability set, plus the always-database CDR reader.

pub mod cdr;
pub mod cel_ami;
pub mod cel_csv;
pub mod cel_db;

use async_trait::async_trait;

use crate::model::Cel;
use crate::Result;

/// The capability set every CEL source mode satisfies (§9 design notes: "polymorphic source
/// readers"). `tick` pulls whatever is newly available into the source's internal cache;
/// `records_for` is a cheap synchronous read of that cache.
#[async_trait]
pub trait CelSource: Send {
    async fn tick(&mut self) -> Result<()>;
    fn records_for(&self, linkedid: &str) -> Vec<Cel>;
    async fn close(&mut self) -> Result<()>;
}

pub use cdr::CdrReader;
