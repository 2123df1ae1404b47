use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::StoreError;
use crate::model::{ReconciledStopEvent, ReconciledTripUpdate, TransitSystem};
use crate::store::StopEventStore;

/// Persists reconciled stop events. Writing the same update twice, or an
/// older one after a newer one, leaves the stored rows unchanged.
pub struct IdempotentWriter {
    store: Arc<dyn StopEventStore>,
}

impl IdempotentWriter {
    pub fn new(store: Arc<dyn StopEventStore>) -> Self {
        Self { store }
    }

    /// Writes one trip update; `freshness` is the header timestamp of the
    /// message it came from. Returns the number of rows changed.
    pub async fn write(
        &self,
        system: TransitSystem,
        freshness: DateTime<Utc>,
        update: &ReconciledTripUpdate,
    ) -> Result<u64, StoreError> {
        let rows = dedupe(build_rows(system, freshness, update));
        if rows.is_empty() {
            return Ok(0);
        }
        self.store.upsert_stop_events(&rows).await
    }
}

/// One row per stop time event. Trip updates without a route produce none.
pub fn build_rows(
    system: TransitSystem,
    freshness: DateTime<Utc>,
    update: &ReconciledTripUpdate,
) -> Vec<ReconciledStopEvent> {
    let trip = &update.update.trip;
    let Some(route_id) = &trip.route_id else {
        return Vec::new();
    };

    update
        .update
        .stop_time_events
        .iter()
        .map(|event| ReconciledStopEvent {
            system,
            route_id: route_id.clone(),
            stop_id: event.stop_id.clone(),
            service_date: trip.service_date,
            trip_id: update.trip_id().to_string(),
            trip_timestamp: update.update.timestamp,
            arrival: event.arrival,
            departure: event.departure,
            freshness,
        })
        .collect()
}

/// Collapses rows sharing a key. The row with the greater freshness wins;
/// on a tie the later row wins. First-seen order is kept.
pub fn dedupe(rows: Vec<ReconciledStopEvent>) -> Vec<ReconciledStopEvent> {
    let mut kept: Vec<ReconciledStopEvent> = Vec::with_capacity(rows.len());
    let mut positions = HashMap::with_capacity(rows.len());

    for row in rows {
        match positions.entry(row.key()) {
            Entry::Vacant(slot) => {
                slot.insert(kept.len());
                kept.push(row);
            }
            Entry::Occupied(slot) => {
                let existing = &mut kept[*slot.get()];
                debug!(
                    trip_id = %row.trip_id,
                    stop_id = %row.stop_id,
                    "Duplicate stop event in one message"
                );
                if row.freshness >= existing.freshness {
                    *existing = row;
                }
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScheduledTrip, StopTimeEvent, TripDescriptor, TripUpdate};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn update(events: &[(&str, i64)], scheduled: Option<&str>) -> ReconciledTripUpdate {
        ReconciledTripUpdate {
            update: TripUpdate {
                trip: TripDescriptor {
                    trip_id: "X".into(),
                    route_id: Some("R1".into()),
                    service_date: NaiveDate::from_ymd_opt(2019, 10, 21).unwrap(),
                },
                stop_time_events: events
                    .iter()
                    .map(|(stop_id, departure)| StopTimeEvent {
                        stop_id: stop_id.to_string(),
                        arrival: None,
                        departure: Some(ts(*departure)),
                    })
                    .collect(),
                timestamp: Some(ts(990)),
            },
            scheduled_trip: scheduled.map(|trip_id| ScheduledTrip {
                system: TransitSystem::NycMta,
                trip_id: trip_id.into(),
                route_id: "R1".into(),
                service_id: "service".into(),
                trip_headsign: None,
                direction_id: None,
            }),
        }
    }

    #[test]
    fn test_rows_use_scheduled_trip_id_when_matched() {
        let rows = build_rows(TransitSystem::NycMta, ts(1000), &update(&[("S1", 1050)], None));
        assert_eq!(rows[0].trip_id, "X");
        assert_eq!(rows[0].freshness, ts(1000));
        assert_eq!(rows[0].trip_timestamp, Some(ts(990)));

        let rows = build_rows(
            TransitSystem::NycMta,
            ts(1000),
            &update(&[("S1", 1050)], Some("SCHEDULED")),
        );
        assert_eq!(rows[0].trip_id, "SCHEDULED");
    }

    #[test]
    fn test_no_rows_without_route() {
        let mut routeless = update(&[("S1", 1050)], None);
        routeless.update.trip.route_id = None;
        assert!(build_rows(TransitSystem::NycMta, ts(1000), &routeless).is_empty());
    }

    #[test]
    fn test_dedupe_keeps_later_row_on_tie() {
        let rows = build_rows(
            TransitSystem::NycMta,
            ts(1000),
            &update(&[("S1", 1050), ("S2", 1100), ("S1", 1060)], None),
        );
        let rows = dedupe(rows);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stop_id, "S1");
        assert_eq!(rows[0].departure, Some(ts(1060)));
        assert_eq!(rows[1].stop_id, "S2");
    }

    #[test]
    fn test_dedupe_prefers_fresher_row() {
        let mut rows = build_rows(
            TransitSystem::NycMta,
            ts(1000),
            &update(&[("S1", 1050), ("S1", 1060)], None),
        );
        rows[0].freshness = ts(2000);
        let rows = dedupe(rows);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].departure, Some(ts(1050)));
    }

    #[tokio::test]
    async fn test_older_write_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let writer = IdempotentWriter::new(store.clone());

        let newer = update(&[("S1", 2050)], None);
        let older = update(&[("S1", 1050)], None);
        assert_eq!(writer.write(TransitSystem::NycMta, ts(2000), &newer).await.unwrap(), 1);
        assert_eq!(writer.write(TransitSystem::NycMta, ts(1000), &older).await.unwrap(), 0);

        let rows = store.stop_events();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].departure, Some(ts(2050)));
    }

    #[tokio::test]
    async fn test_empty_update_skips_store() {
        let store = Arc::new(MemoryStore::new());
        let writer = IdempotentWriter::new(store.clone());
        assert_eq!(writer.write(TransitSystem::NycMta, ts(1000), &update(&[], None)).await.unwrap(), 0);
        assert!(store.stop_events().is_empty());
    }
}
