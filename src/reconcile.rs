//! Correction rules applied to a decoded feed message before it is written.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, warn};

use crate::error::MatchError;
use crate::matcher::TripMatcher;
use crate::model::{FeedMessage, StopTimeEvent, TripUpdate};

pub struct Reconciler {
    matcher: Arc<TripMatcher>,
}

impl Reconciler {
    pub fn new(matcher: Arc<TripMatcher>) -> Self {
        Self { matcher }
    }

    /// Drops trip updates without a route and stop events that cannot be
    /// written. Vehicle positions pass through untouched.
    #[tracing::instrument(skip_all, fields(feed_id = %message.feed_id))]
    pub async fn reconcile(&self, message: FeedMessage) -> Result<FeedMessage, MatchError> {
        let FeedMessage {
            system,
            feed_id,
            header_timestamp,
            replacement_windows,
            trip_updates,
            vehicle_positions,
        } = message;
        let mut reconciled = FeedMessage {
            system,
            feed_id,
            header_timestamp,
            replacement_windows,
            trip_updates: Vec::with_capacity(trip_updates.len()),
            vehicle_positions,
        };

        let kept = try_join_all(
            trip_updates
                .into_iter()
                .map(|update| self.reconcile_trip_update(&reconciled, update)),
        )
        .await?;
        reconciled.trip_updates = kept.into_iter().flatten().collect();

        debug!(
            trip_updates = reconciled.trip_updates.len(),
            "Reconciled feed message"
        );
        Ok(reconciled)
    }

    async fn reconcile_trip_update(
        &self,
        message: &FeedMessage,
        update: TripUpdate,
    ) -> Result<Option<TripUpdate>, MatchError> {
        if update.trip.route_id.is_none() {
            self.report_missing_route(message, &update).await?;
            return Ok(None);
        }

        let checks = try_join_all(
            update
                .stop_time_events
                .iter()
                .map(|event| self.is_writable(&update, event)),
        )
        .await?;

        let TripUpdate {
            trip,
            stop_time_events,
            timestamp,
        } = update;
        let stop_time_events = stop_time_events
            .into_iter()
            .zip(checks)
            .filter_map(|(event, keep)| keep.then_some(event))
            .collect();

        Ok(Some(TripUpdate {
            trip,
            stop_time_events,
            timestamp,
        }))
    }

    /// Trip updates without a route are expected while a replacement period
    /// covers the scheduled trip's route.
    async fn report_missing_route(
        &self,
        message: &FeedMessage,
        update: &TripUpdate,
    ) -> Result<(), MatchError> {
        let replaced_route = self
            .matcher
            .resolve(&update.trip)
            .await?
            .map(|trip| trip.route_id)
            .filter(|route_id| message.is_trip_replaced(route_id));

        match replaced_route {
            Some(route_id) => debug!(
                trip_id = %update.trip.trip_id,
                %route_id,
                "Dropping trip update without route during replacement period"
            ),
            None => warn!(
                trip_id = %update.trip.trip_id,
                service_date = %update.trip.service_date,
                "Dropping trip update without route"
            ),
        }
        Ok(())
    }

    async fn is_writable(
        &self,
        update: &TripUpdate,
        event: &StopTimeEvent,
    ) -> Result<bool, MatchError> {
        if !event.has_time() {
            warn!(
                trip_id = %update.trip.trip_id,
                stop_id = %event.stop_id,
                "Stop time event has neither arrival nor departure"
            );
            return Ok(false);
        }
        if !self.matcher.stop_exists(&event.stop_id).await? {
            debug!(
                trip_id = %update.trip.trip_id,
                stop_id = %event.stop_id,
                "Dropping stop time event for unknown stop"
            );
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ScheduledTrip, TransitSystem, TripDescriptor, VehiclePosition, VehicleStopStatus,
    };
    use crate::store::MemoryStore;
    use chrono::{DateTime, NaiveDate, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn trip(trip_id: &str, route_id: Option<&str>) -> TripDescriptor {
        TripDescriptor {
            trip_id: trip_id.to_string(),
            route_id: route_id.map(str::to_string),
            service_date: NaiveDate::from_ymd_opt(2019, 10, 21).unwrap(),
        }
    }

    fn event(stop_id: &str, departure: Option<i64>) -> StopTimeEvent {
        StopTimeEvent {
            stop_id: stop_id.to_string(),
            arrival: None,
            departure: departure.map(ts),
        }
    }

    fn reconciler(store: Arc<MemoryStore>) -> Reconciler {
        Reconciler::new(Arc::new(TripMatcher::new(TransitSystem::NycMta, store)))
    }

    fn store_with_stops(stops: &[&str]) -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        for stop in stops {
            store.insert_stop(TransitSystem::NycMta, stop);
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_drops_invalid_stop_events_in_order() {
        let store = store_with_stops(&["S1", "S2", "S3"]);
        let mut message = FeedMessage::new(TransitSystem::NycMta, "1", ts(1000));
        message.trip_updates.push(TripUpdate {
            trip: trip("X", Some("R1")),
            stop_time_events: vec![
                event("S1", Some(1050)),
                event("UNKNOWN", Some(1060)),
                event("S2", None),
                event("S3", Some(1070)),
            ],
            timestamp: None,
        });

        let reconciled = reconciler(store).reconcile(message).await.unwrap();
        let stops: Vec<_> = reconciled.trip_updates[0]
            .stop_time_events
            .iter()
            .map(|e| e.stop_id.as_str())
            .collect();
        assert_eq!(stops, vec!["S1", "S3"]);
    }

    #[tokio::test]
    async fn test_drops_trip_updates_without_route() {
        let store = store_with_stops(&["S1"]);
        store.insert_trip(ScheduledTrip {
            system: TransitSystem::NycMta,
            trip_id: "Y".into(),
            route_id: "6".into(),
            service_id: "service".into(),
            trip_headsign: None,
            direction_id: None,
        });

        let mut message = FeedMessage::new(TransitSystem::NycMta, "1", ts(1000));
        message.replacement_windows.insert("6".into(), ts(2000));
        for descriptor in [trip("X", Some("R1")), trip("Y", None), trip("020600_6..N01R", None)] {
            message.trip_updates.push(TripUpdate {
                trip: descriptor,
                stop_time_events: vec![event("S1", Some(1050))],
                timestamp: None,
            });
        }

        let reconciled = reconciler(store).reconcile(message).await.unwrap();
        assert_eq!(reconciled.trip_updates.len(), 1);
        assert_eq!(reconciled.trip_updates[0].trip.trip_id, "X");
    }

    #[tokio::test]
    async fn test_keeps_vehicle_positions_and_header() {
        let store = store_with_stops(&[]);
        let mut message = FeedMessage::new(TransitSystem::NycMta, "26", ts(1000));
        message.replacement_windows.insert("A".into(), ts(900));
        message.vehicle_positions.push(VehiclePosition {
            trip: trip("X", Some("A")),
            current_stop_sequence: Some(4),
            stop_id: None,
            status: VehicleStopStatus::InTransitTo,
            timestamp: Some(ts(990)),
        });

        let reconciled = reconciler(store).reconcile(message.clone()).await.unwrap();
        assert_eq!(reconciled, message);
    }

    #[tokio::test]
    async fn test_grammar_errors_propagate_for_routeless_updates() {
        let store = store_with_stops(&[]);
        let mut message = FeedMessage::new(TransitSystem::NycMta, "1", ts(1000));
        message.trip_updates.push(TripUpdate {
            trip: trip("not-a-trip-id", None),
            stop_time_events: Vec::new(),
            timestamp: None,
        });

        let err = reconciler(store).reconcile(message).await.unwrap_err();
        assert!(matches!(err, MatchError::Grammar(_)));
    }
}
