use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CheckpointStore, PageQuery, SnapshotStore, StaticScheduleStore, StopEventStore};
use crate::error::StoreError;
use crate::model::{
    RawSnapshot, ReconciledStopEvent, ScheduledTrip, SnapshotKey, StopEventKey, TransitSystem,
};
use crate::trip_id::{AlternateTripId, ServiceDay};

#[derive(Default)]
struct Tables {
    stops: HashSet<(TransitSystem, String)>,
    trips: HashMap<(TransitSystem, String), ScheduledTrip>,
    alternates: HashMap<(TransitSystem, String, ServiceDay), Vec<String>>,
    stop_times: HashMap<(TransitSystem, String, u32), String>,
    snapshots: BTreeMap<(TransitSystem, SnapshotKey), RawSnapshot>,
    checkpoints: Vec<(String, DateTime<Utc>, String)>,
    stop_events: HashMap<StopEventKey, ReconciledStopEvent>,
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    static_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of static-schedule lookups served so far.
    pub fn static_reads(&self) -> usize {
        self.static_reads.load(Ordering::SeqCst)
    }

    fn count_read(&self) {
        self.static_reads.fetch_add(1, Ordering::SeqCst);
    }

    pub fn insert_stop(&self, system: TransitSystem, stop_id: &str) {
        self.tables().stops.insert((system, stop_id.to_string()));
    }

    pub fn insert_trip(&self, trip: ScheduledTrip) {
        self.tables()
            .trips
            .insert((trip.system, trip.trip_id.clone()), trip);
    }

    pub fn insert_alternate_ids(&self, rows: &[AlternateTripId]) {
        let mut tables = self.tables();
        for row in rows {
            let trip_ids = tables
                .alternates
                .entry((row.system, row.alternate_trip_id.clone(), row.service_day))
                .or_default();
            if !trip_ids.contains(&row.trip_id) {
                trip_ids.push(row.trip_id.clone());
            }
        }
    }

    pub fn insert_stop_time(
        &self,
        system: TransitSystem,
        trip_id: &str,
        stop_sequence: u32,
        stop_id: &str,
    ) {
        self.tables()
            .stop_times
            .insert((system, trip_id.to_string(), stop_sequence), stop_id.to_string());
    }

    /// All checkpoints recorded for `job_name`, oldest first.
    pub fn checkpoints(&self, job_name: &str) -> Vec<String> {
        self.tables()
            .checkpoints
            .iter()
            .filter(|(job, _, _)| job == job_name)
            .map(|(_, _, cursor)| cursor.clone())
            .collect()
    }

    pub fn stop_events(&self) -> Vec<ReconciledStopEvent> {
        self.tables().stop_events.values().cloned().collect()
    }
}

#[async_trait]
impl StaticScheduleStore for MemoryStore {
    async fn trip_by_id(
        &self,
        system: TransitSystem,
        trip_id: &str,
    ) -> Result<Option<ScheduledTrip>, StoreError> {
        self.count_read();
        Ok(self.tables().trips.get(&(system, trip_id.to_string())).cloned())
    }

    async fn stop_exists(&self, system: TransitSystem, stop_id: &str) -> Result<bool, StoreError> {
        self.count_read();
        Ok(self.tables().stops.contains(&(system, stop_id.to_string())))
    }

    async fn alternate_trip_ids(
        &self,
        system: TransitSystem,
        alternate_trip_id: &str,
        service_day: ServiceDay,
    ) -> Result<Vec<String>, StoreError> {
        self.count_read();
        Ok(self
            .tables()
            .alternates
            .get(&(system, alternate_trip_id.to_string(), service_day))
            .cloned()
            .unwrap_or_default())
    }

    async fn stop_id_from_sequence(
        &self,
        system: TransitSystem,
        trip_id: &str,
        stop_sequence: u32,
    ) -> Result<Option<String>, StoreError> {
        self.count_read();
        Ok(self
            .tables()
            .stop_times
            .get(&(system, trip_id.to_string(), stop_sequence))
            .cloned())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn put_snapshot(&self, snapshot: &RawSnapshot) -> Result<(), StoreError> {
        let mut tables = self.tables();
        tables
            .snapshots
            .entry((snapshot.system, snapshot.key()))
            .and_modify(|stored| stored.ingested_at = snapshot.ingested_at)
            .or_insert_with(|| snapshot.clone());
        Ok(())
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<RawSnapshot>, StoreError> {
        Ok(self
            .tables()
            .snapshots
            .iter()
            .filter(|((system, key), _)| {
                *system == query.system
                    && query.after.as_ref().is_none_or(|after| key > after)
                    && query.from_time.is_none_or(|from| key.captured_at >= from)
            })
            .take(query.limit)
            .map(|(_, snapshot)| snapshot.clone())
            .collect())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn append_checkpoint(
        &self,
        job_name: &str,
        recorded_at: DateTime<Utc>,
        cursor: &str,
    ) -> Result<(), StoreError> {
        self.tables()
            .checkpoints
            .push((job_name.to_string(), recorded_at, cursor.to_string()));
        Ok(())
    }

    async fn latest_checkpoint(&self, job_name: &str) -> Result<Option<String>, StoreError> {
        // max_by_key keeps the last of equal elements, i.e. the latest append
        Ok(self
            .tables()
            .checkpoints
            .iter()
            .filter(|(job, _, _)| job == job_name)
            .max_by_key(|(_, recorded_at, _)| *recorded_at)
            .map(|(_, _, cursor)| cursor.clone()))
    }
}

#[async_trait]
impl StopEventStore for MemoryStore {
    async fn upsert_stop_events(&self, rows: &[ReconciledStopEvent]) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let mut affected = 0;
        for row in rows {
            let key = row.key();
            let fresher = tables
                .stop_events
                .get(&key)
                .is_none_or(|stored| stored.freshness <= row.freshness);
            if fresher {
                tables.stop_events.insert(key, row.clone());
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn stop_event(
        &self,
        key: &StopEventKey,
    ) -> Result<Option<ReconciledStopEvent>, StoreError> {
        Ok(self.tables().stop_events.get(key).cloned())
    }
}
