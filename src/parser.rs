//! Protobuf decoder for GTFS Realtime feeds.
//!
//! [`parse_feed`] only decodes the wire format; [`decode_feed`] also turns
//! the protobuf into a typed [`FeedMessage`], validating the header and
//! applying the NYCT replacement-window backfill.

use chrono::{DateTime, NaiveDate, Utc};
use prost::Message;
use tracing::debug;

use crate::error::DecodeError;
use crate::gtfs_rt;
use crate::model::{
    FeedMessage, StopTimeEvent, TransitSystem, TripDescriptor, TripUpdate, VehiclePosition,
    VehicleStopStatus,
};

/// Decodes a protobuf-encoded GTFS-RT [`gtfs_rt::FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<gtfs_rt::FeedMessage, DecodeError> {
    Ok(gtfs_rt::FeedMessage::decode(bytes)?)
}

/// Decodes raw snapshot bytes into a [`FeedMessage`].
///
/// # Errors
///
/// Fails when the bytes are not a valid `FeedMessage`, or when the message
/// is not fully initialized (required header fields absent).
pub fn decode_feed(
    system: TransitSystem,
    feed_id: &str,
    bytes: &[u8],
) -> Result<FeedMessage, DecodeError> {
    let pb = parse_feed(bytes)?;
    feed_message_from_pb(system, feed_id, &pb)
}

/// Converts an already-decoded protobuf into a [`FeedMessage`].
pub fn feed_message_from_pb(
    system: TransitSystem,
    feed_id: &str,
    pb: &gtfs_rt::FeedMessage,
) -> Result<FeedMessage, DecodeError> {
    let header = &pb.header;
    if header.gtfs_realtime_version.is_empty() {
        return Err(DecodeError::Uninitialized("header.gtfs_realtime_version"));
    }
    let timestamp = header
        .timestamp
        .ok_or(DecodeError::Uninitialized("header.timestamp"))?;

    let mut message = FeedMessage::new(system, feed_id, unsigned_timestamp(timestamp)?);

    if let Some(nyct) = &header.nyct_feed_header {
        for replacement in &nyct.trip_replacement_period {
            let (Some(route_id), Some(end)) = (
                replacement.route_id.as_ref(),
                replacement.replacement_period.as_ref().and_then(|p| p.end),
            ) else {
                continue;
            };
            message
                .replacement_windows
                .insert(route_id.clone(), unsigned_timestamp(end)?);
        }
        backfill_replacement_windows(&mut message);
    }

    for entity in &pb.entity {
        if let Some(trip_update) = &entity.trip_update {
            message
                .trip_updates
                .push(trip_update_from_pb(trip_update, system)?);
        }
        if let Some(vehicle) = &entity.vehicle {
            match vehicle_position_from_pb(vehicle, system)? {
                Some(position) => message.vehicle_positions.push(position),
                None => debug!(entity_id = %entity.id, "Vehicle position without trip, skipping"),
            }
        }
    }

    Ok(message)
}

/// Route whose trips are replaced together with `route_id`, if any.
///
/// Feed 1 uses route `S` for the 42nd St shuttle, which is `GS` in the
/// static schedule (`S` is not a valid route there).
fn related_route(feed_id: &str, route_id: &str) -> Option<&'static str> {
    match route_id {
        "6" => Some("6X"),
        "7" => Some("7X"),
        "S" if feed_id == "1" => Some("GS"),
        _ => None,
    }
}

/// Adds derived replacement windows for related routes. Explicit entries
/// always win over derived ones.
fn backfill_replacement_windows(message: &mut FeedMessage) {
    let derived: Vec<(&'static str, DateTime<Utc>)> = message
        .replacement_windows
        .iter()
        .filter_map(|(route_id, end)| {
            related_route(&message.feed_id, route_id).map(|related| (related, *end))
        })
        .collect();

    for (route_id, end) in derived {
        message
            .replacement_windows
            .entry(route_id.to_string())
            .or_insert(end);
    }
}

fn trip_descriptor_from_pb(
    trip: &gtfs_rt::TripDescriptor,
    system: TransitSystem,
) -> Result<TripDescriptor, DecodeError> {
    let start_date = trip.start_date.as_deref().unwrap_or_default();
    let service_date = parse_service_date(start_date)?;

    // Sometimes the route_id is an empty string
    let mut route_id = trip.route_id.clone().filter(|r| !r.is_empty());

    // Staten Island Railway trips arrive as `SS`, which is `SI` in routes.txt
    if system == TransitSystem::NycMta && route_id.as_deref() == Some("SS") {
        route_id = Some("SI".to_string());
    }

    Ok(TripDescriptor {
        trip_id: trip.trip_id.clone().unwrap_or_default(),
        route_id,
        service_date,
    })
}

fn trip_update_from_pb(
    update: &gtfs_rt::TripUpdate,
    system: TransitSystem,
) -> Result<TripUpdate, DecodeError> {
    let stop_time_events = update
        .stop_time_update
        .iter()
        .map(|stu| {
            Ok(StopTimeEvent {
                stop_id: stu.stop_id.clone().unwrap_or_default(),
                arrival: event_time(stu.arrival.as_ref())?,
                departure: event_time(stu.departure.as_ref())?,
            })
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    Ok(TripUpdate {
        trip: trip_descriptor_from_pb(&update.trip, system)?,
        stop_time_events,
        timestamp: update.timestamp.map(unsigned_timestamp).transpose()?,
    })
}

fn vehicle_position_from_pb(
    vehicle: &gtfs_rt::VehiclePosition,
    system: TransitSystem,
) -> Result<Option<VehiclePosition>, DecodeError> {
    let Some(trip) = &vehicle.trip else {
        return Ok(None);
    };

    let status = match vehicle.current_status {
        None => VehicleStopStatus::InTransitTo,
        Some(value) => {
            use gtfs_rt::vehicle_position::VehicleStopStatus as Pb;
            match Pb::try_from(value) {
                Ok(Pb::IncomingAt) => VehicleStopStatus::IncomingAt,
                Ok(Pb::StoppedAt) => VehicleStopStatus::StoppedAt,
                Ok(Pb::InTransitTo) => VehicleStopStatus::InTransitTo,
                Err(_) => return Err(DecodeError::UnknownStopStatus(value)),
            }
        }
    };

    Ok(Some(VehiclePosition {
        trip: trip_descriptor_from_pb(trip, system)?,
        current_stop_sequence: vehicle.current_stop_sequence,
        stop_id: vehicle.stop_id.clone(),
        status,
        timestamp: vehicle.timestamp.map(unsigned_timestamp).transpose()?,
    }))
}

fn event_time(
    event: Option<&gtfs_rt::trip_update::StopTimeEvent>,
) -> Result<Option<DateTime<Utc>>, DecodeError> {
    event.and_then(|e| e.time).map(signed_timestamp).transpose()
}

fn signed_timestamp(secs: i64) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::from_timestamp(secs, 0).ok_or(DecodeError::TimestampOutOfRange(secs))
}

fn unsigned_timestamp(secs: u64) -> Result<DateTime<Utc>, DecodeError> {
    let secs = i64::try_from(secs).map_err(|_| DecodeError::TimestampOutOfRange(i64::MAX))?;
    signed_timestamp(secs)
}

/// Parses a GTFS service date, formatted as `YYYYMMDD`.
fn parse_service_date(s: &str) -> Result<NaiveDate, DecodeError> {
    if s.len() != 8 {
        return Err(DecodeError::InvalidStartDate(s.to_string()));
    }
    NaiveDate::parse_from_str(s, "%Y%m%d").map_err(|_| DecodeError::InvalidStartDate(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{
        FeedEntity, FeedHeader, NyctFeedHeader, TimeRange, TripReplacementPeriod,
        trip_update::{StopTimeEvent as PbEvent, StopTimeUpdate},
    };

    fn header(timestamp: Option<u64>) -> FeedHeader {
        FeedHeader {
            gtfs_realtime_version: "1.0".to_string(),
            incrementality: None,
            timestamp,
            feed_version: None,
            nyct_feed_header: None,
        }
    }

    fn replacement(route_id: &str, end: u64) -> TripReplacementPeriod {
        TripReplacementPeriod {
            route_id: Some(route_id.to_string()),
            replacement_period: Some(TimeRange { start: None, end: Some(end) }),
        }
    }

    fn with_replacements(periods: Vec<TripReplacementPeriod>) -> gtfs_rt::FeedMessage {
        let mut header = header(Some(1000));
        header.nyct_feed_header = Some(NyctFeedHeader {
            nyct_subway_version: "1.0".to_string(),
            trip_replacement_period: periods,
        });
        gtfs_rt::FeedMessage { header, entity: vec![] }
    }

    fn trip(trip_id: &str, route_id: Option<&str>, start_date: &str) -> gtfs_rt::TripDescriptor {
        gtfs_rt::TripDescriptor {
            trip_id: Some(trip_id.to_string()),
            route_id: route_id.map(str::to_string),
            direction_id: None,
            start_time: None,
            start_date: Some(start_date.to_string()),
            schedule_relationship: None,
        }
    }

    fn trip_update_entity(trip: gtfs_rt::TripDescriptor, stops: Vec<StopTimeUpdate>) -> FeedEntity {
        FeedEntity {
            id: "1".to_string(),
            is_deleted: None,
            trip_update: Some(gtfs_rt::TripUpdate {
                trip,
                stop_time_update: stops,
                timestamp: Some(990),
                delay: None,
            }),
            vehicle: None,
        }
    }

    fn stop(stop_id: &str, arrival: Option<i64>, departure: Option<i64>) -> StopTimeUpdate {
        let event = |time: i64| PbEvent { delay: None, time: Some(time), uncertainty: None };
        StopTimeUpdate {
            stop_sequence: None,
            stop_id: Some(stop_id.to_string()),
            arrival: arrival.map(event),
            departure: departure.map(event),
            schedule_relationship: None,
        }
    }

    fn decode(feed_id: &str, pb: &gtfs_rt::FeedMessage) -> Result<FeedMessage, DecodeError> {
        decode_feed(TransitSystem::NycMta, feed_id, &pb.encode_to_vec())
    }

    #[test]
    fn test_parse_invalid_bytes() {
        let invalid_bytes = vec![0xFF, 0xFE, 0x00, 0x01];
        assert!(parse_feed(&invalid_bytes).is_err());
    }

    #[test]
    fn test_empty_bytes_are_not_initialized() {
        // Empty bytes are valid protobuf, but the required header is absent
        let result = decode_feed(TransitSystem::NycMta, "1", &[]);
        assert!(matches!(
            result,
            Err(DecodeError::Uninitialized("header.gtfs_realtime_version"))
        ));
    }

    #[test]
    fn test_missing_header_timestamp() {
        let pb = gtfs_rt::FeedMessage { header: header(None), entity: vec![] };
        assert!(matches!(
            decode("1", &pb),
            Err(DecodeError::Uninitialized("header.timestamp"))
        ));
    }

    #[test]
    fn test_decode_minimal_feed() {
        let pb = gtfs_rt::FeedMessage { header: header(Some(1234567890)), entity: vec![] };
        let message = decode("16", &pb).unwrap();
        assert_eq!(message.feed_id, "16");
        assert_eq!(message.header_timestamp.timestamp(), 1234567890);
        assert!(message.trip_updates.is_empty());
        assert!(message.replacement_windows.is_empty());
    }

    #[test]
    fn test_backfill_derives_related_route() {
        let message = decode("1", &with_replacements(vec![replacement("6", 2000)])).unwrap();
        assert_eq!(message.replacement_windows["6"].timestamp(), 2000);
        assert_eq!(message.replacement_windows["6X"].timestamp(), 2000);
    }

    #[test]
    fn test_backfill_never_overwrites_explicit_entry() {
        // Explicit entry listed before and after the base route
        for periods in [
            vec![replacement("6X", 3000), replacement("6", 2000)],
            vec![replacement("6", 2000), replacement("6X", 3000)],
        ] {
            let message = decode("1", &with_replacements(periods)).unwrap();
            assert_eq!(message.replacement_windows["6X"].timestamp(), 3000);
        }
    }

    #[test]
    fn test_backfill_seven_express() {
        let message = decode("51", &with_replacements(vec![replacement("7", 2500)])).unwrap();
        assert_eq!(message.replacement_windows["7X"].timestamp(), 2500);
    }

    #[test]
    fn test_shuttle_backfill_only_for_feed_one() {
        let message = decode("1", &with_replacements(vec![replacement("S", 2000)])).unwrap();
        assert_eq!(message.replacement_windows["GS"].timestamp(), 2000);

        let message = decode("26", &with_replacements(vec![replacement("S", 2000)])).unwrap();
        assert!(!message.replacement_windows.contains_key("GS"));
    }

    #[test]
    fn test_decode_trip_update() {
        let pb = gtfs_rt::FeedMessage {
            header: header(Some(1000)),
            entity: vec![trip_update_entity(
                trip("010600_1..S03R", Some("1"), "20191020"),
                vec![stop("101S", Some(1040), Some(1050)), stop("103S", None, None)],
            )],
        };
        let message = decode("1", &pb).unwrap();
        let update = &message.trip_updates[0];
        assert_eq!(update.trip.trip_id, "010600_1..S03R");
        assert_eq!(update.trip.route_id.as_deref(), Some("1"));
        assert_eq!(update.trip.service_date, NaiveDate::from_ymd_opt(2019, 10, 20).unwrap());
        assert_eq!(update.timestamp.map(|t| t.timestamp()), Some(990));
        assert_eq!(update.stop_time_events.len(), 2);
        assert_eq!(update.stop_time_events[0].departure.map(|t| t.timestamp()), Some(1050));
        assert!(!update.stop_time_events[1].has_time());
    }

    #[test]
    fn test_route_normalisation() {
        let pb = gtfs_rt::FeedMessage {
            header: header(Some(1000)),
            entity: vec![
                trip_update_entity(trip("a", Some(""), "20191020"), vec![]),
                trip_update_entity(trip("b", Some("SS"), "20191020"), vec![]),
            ],
        };
        let message = decode("11", &pb).unwrap();
        assert_eq!(message.trip_updates[0].trip.route_id, None);
        assert_eq!(message.trip_updates[1].trip.route_id.as_deref(), Some("SI"));
    }

    #[test]
    fn test_invalid_start_date() {
        let pb = gtfs_rt::FeedMessage {
            header: header(Some(1000)),
            entity: vec![trip_update_entity(trip("a", Some("1"), "2019-10-20"), vec![])],
        };
        assert!(matches!(decode("1", &pb), Err(DecodeError::InvalidStartDate(_))));
    }

    #[test]
    fn test_decode_vehicle_position() {
        let vehicle = |status: Option<i32>| FeedEntity {
            id: "v".to_string(),
            is_deleted: None,
            trip_update: None,
            vehicle: Some(gtfs_rt::VehiclePosition {
                trip: Some(trip("a", Some("L"), "20191020")),
                current_stop_sequence: Some(4),
                stop_id: None,
                current_status: status,
                timestamp: Some(995),
            }),
        };

        let pb = gtfs_rt::FeedMessage {
            header: header(Some(1000)),
            entity: vec![vehicle(None), vehicle(Some(1))],
        };
        let message = decode("2", &pb).unwrap();
        assert_eq!(message.vehicle_positions[0].status, VehicleStopStatus::InTransitTo);
        assert_eq!(message.vehicle_positions[1].status, VehicleStopStatus::StoppedAt);
        assert_eq!(message.vehicle_positions[1].current_stop_sequence, Some(4));

        let pb = gtfs_rt::FeedMessage { header: header(Some(1000)), entity: vec![vehicle(Some(9))] };
        assert!(matches!(decode("2", &pb), Err(DecodeError::UnknownStopStatus(9))));
    }
}
