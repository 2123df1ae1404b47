//! Typed records shared by the decoder, matcher, reconciler and writer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Transit systems with a real-time feed handled by this crate.
///
/// The reconciliation rules are specific to each system; only the NYC subway
/// is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitSystem {
    NycMta,
}

impl TransitSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitSystem::NycMta => "nyc_mta",
        }
    }

    /// Whether real-time trip ids are a compressed form of the scheduled
    /// trip id and need the alternate-id lookup.
    pub fn uses_compound_trip_ids(&self) -> bool {
        matches!(self, TransitSystem::NycMta)
    }

    /// Whether `current_stop_sequence` in vehicle positions can be mapped
    /// onto `stop_times.stop_sequence`.
    ///
    /// NYCT sequences start at 0 and run past the number of scheduled stops.
    pub fn trusts_stop_sequences(&self) -> bool {
        !matches!(self, TransitSystem::NycMta)
    }
}

impl fmt::Display for TransitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one trip instance in the real-time feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TripDescriptor {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub service_date: NaiveDate,
}

/// Predicted or observed arrival/departure at one stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopTimeEvent {
    pub stop_id: String,
    pub arrival: Option<DateTime<Utc>>,
    pub departure: Option<DateTime<Utc>>,
}

impl StopTimeEvent {
    /// A stop event without any time carries no information and is dropped.
    pub fn has_time(&self) -> bool {
        self.arrival.is_some() || self.departure.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TripUpdate {
    pub trip: TripDescriptor,
    pub stop_time_events: Vec<StopTimeEvent>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStopStatus {
    IncomingAt,
    StoppedAt,
    InTransitTo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VehiclePosition {
    pub trip: TripDescriptor,
    pub current_stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    pub status: VehicleStopStatus,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One decoded feed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedMessage {
    pub system: TransitSystem,
    pub feed_id: String,
    pub header_timestamp: DateTime<Utc>,
    /// route_id -> end of the replacement period.
    pub replacement_windows: BTreeMap<String, DateTime<Utc>>,
    pub trip_updates: Vec<TripUpdate>,
    pub vehicle_positions: Vec<VehiclePosition>,
}

impl FeedMessage {
    pub fn new(system: TransitSystem, feed_id: &str, header_timestamp: DateTime<Utc>) -> Self {
        Self {
            system,
            feed_id: feed_id.to_string(),
            header_timestamp,
            replacement_windows: BTreeMap::new(),
            trip_updates: Vec::new(),
            vehicle_positions: Vec::new(),
        }
    }

    /// True if scheduled trips on `route_id` are currently replaced by the
    /// trips in this message.
    pub fn is_trip_replaced(&self, route_id: &str) -> bool {
        replacement_active(&self.replacement_windows, self.header_timestamp, route_id)
    }
}

/// A window is active while its end is not before the message's own time.
fn replacement_active(
    windows: &BTreeMap<String, DateTime<Utc>>,
    header_timestamp: DateTime<Utc>,
    route_id: &str,
) -> bool {
    windows
        .get(route_id)
        .is_some_and(|end| *end >= header_timestamp)
}

/// A trip update that survived reconciliation, with the scheduled trip it
/// resolved to (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledTripUpdate {
    pub update: TripUpdate,
    pub scheduled_trip: Option<ScheduledTrip>,
}

impl ReconciledTripUpdate {
    /// Trip id rows are written under: the scheduled id when matched,
    /// otherwise the real-time id.
    pub fn trip_id(&self) -> &str {
        self.scheduled_trip
            .as_ref()
            .map_or(self.update.trip.trip_id.as_str(), |trip| trip.trip_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledFeedMessage {
    pub system: TransitSystem,
    pub feed_id: String,
    pub header_timestamp: DateTime<Utc>,
    pub replacement_windows: BTreeMap<String, DateTime<Utc>>,
    pub trip_updates: Vec<ReconciledTripUpdate>,
    pub vehicle_positions: Vec<VehiclePosition>,
}

impl ReconciledFeedMessage {
    pub fn is_trip_replaced(&self, route_id: &str) -> bool {
        replacement_active(&self.replacement_windows, self.header_timestamp, route_id)
    }
}

/// A row from the static `trips` table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledTrip {
    pub system: TransitSystem,
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub trip_headsign: Option<String>,
    pub direction_id: Option<i64>,
}

/// Ordering key of captured snapshots: `(captured_at, feed_id)`.
///
/// Field order matters: the derived `Ord` compares `captured_at` first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotKey {
    pub captured_at: DateTime<Utc>,
    pub feed_id: String,
}

/// Raw feed bytes as captured from the agency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSnapshot {
    pub system: TransitSystem,
    pub feed_id: String,
    /// Header timestamp of the captured message.
    pub captured_at: DateTime<Utc>,
    pub raw_bytes: Vec<u8>,
    pub json_mirror: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

impl RawSnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            captured_at: self.captured_at,
            feed_id: self.feed_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StopEventKey {
    pub system: TransitSystem,
    pub route_id: String,
    pub stop_id: String,
    pub service_date: NaiveDate,
    pub trip_id: String,
}

/// A persisted real-time stop arrival/departure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledStopEvent {
    pub system: TransitSystem,
    pub route_id: String,
    pub stop_id: String,
    pub service_date: NaiveDate,
    pub trip_id: String,
    /// Timestamp of the trip update itself, when the feed provides one.
    pub trip_timestamp: Option<DateTime<Utc>>,
    pub arrival: Option<DateTime<Utc>>,
    pub departure: Option<DateTime<Utc>>,
    /// Header timestamp of the message the row came from. Writes with an
    /// older freshness than the stored row are ignored.
    pub freshness: DateTime<Utc>,
}

impl ReconciledStopEvent {
    pub fn key(&self) -> StopEventKey {
        StopEventKey {
            system: self.system,
            route_id: self.route_id.clone(),
            stop_id: self.stop_id.clone(),
            service_date: self.service_date,
            trip_id: self.trip_id.clone(),
        }
    }
}
