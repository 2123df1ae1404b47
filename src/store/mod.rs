//! Persistence seams used by the pipeline.
//!
//! [`StaticScheduleStore`] is read-only reference data.
//! [`SnapshotStore`] holds captured raw feed bytes.
//! [`CheckpointStore`] is the append-only log of batch progress.
//! [`StopEventStore`] receives reconciled stop events through a
//! freshness-conditional upsert.
//!
//! [`SqliteStore`] and [`MemoryStore`] implement all four.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    RawSnapshot, ReconciledStopEvent, ScheduledTrip, SnapshotKey, StopEventKey, TransitSystem,
};
use crate::trip_id::ServiceDay;

#[async_trait]
pub trait StaticScheduleStore: Send + Sync {
    async fn trip_by_id(
        &self,
        system: TransitSystem,
        trip_id: &str,
    ) -> Result<Option<ScheduledTrip>, StoreError>;

    async fn stop_exists(&self, system: TransitSystem, stop_id: &str) -> Result<bool, StoreError>;

    /// Scheduled trip ids registered under a real-time alternate id.
    async fn alternate_trip_ids(
        &self,
        system: TransitSystem,
        alternate_trip_id: &str,
        service_day: ServiceDay,
    ) -> Result<Vec<String>, StoreError>;

    async fn stop_id_from_sequence(
        &self,
        system: TransitSystem,
        trip_id: &str,
        stop_sequence: u32,
    ) -> Result<Option<String>, StoreError>;
}

/// Selects one page of snapshots in `(captured_at, feed_id)` order.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub system: TransitSystem,
    /// Exclusive lower bound on the ordering key.
    pub after: Option<SnapshotKey>,
    /// Inclusive lower bound on `captured_at`.
    pub from_time: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Inserts a snapshot; if its key already exists only `ingested_at` is
    /// updated.
    async fn put_snapshot(&self, snapshot: &RawSnapshot) -> Result<(), StoreError>;

    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<RawSnapshot>, StoreError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn append_checkpoint(
        &self,
        job_name: &str,
        recorded_at: DateTime<Utc>,
        cursor: &str,
    ) -> Result<(), StoreError>;

    /// Cursor of the most recently recorded checkpoint for `job_name`.
    async fn latest_checkpoint(&self, job_name: &str) -> Result<Option<String>, StoreError>;
}

#[async_trait]
pub trait StopEventStore: Send + Sync {
    /// Conditional upsert: an existing row is replaced only when the
    /// incoming freshness is not older than the stored one.
    ///
    /// `rows` must not contain two rows with the same key. Returns the
    /// number of rows inserted or updated.
    async fn upsert_stop_events(&self, rows: &[ReconciledStopEvent]) -> Result<u64, StoreError>;

    async fn stop_event(&self, key: &StopEventKey)
    -> Result<Option<ReconciledStopEvent>, StoreError>;
}
