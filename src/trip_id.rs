//! NYCT compound trip identifiers.
//!
//! Scheduled trip ids in the static feed look like
//! `AFA19GEN-1037-Sunday-00_010600_1..S03R`:
//!
//! - `A`: sub-division (`A`, `B` or `SIR`)
//! - `FA19GEN`: effective-date tag
//! - `1037`: starts with the route id, remainder unknown
//! - `Sunday`: service label (`Weekday`, `Saturday` or `Sunday`)
//! - `00`: unknown
//! - `010600`: origin time, in hundredths of a minute past midnight
//! - `1..S03R`: trip path: route `1`, one or two dots, direction `S`,
//!   optional path identifier `03R`
//!
//! Real-time feeds only carry `<origin time>_<trip path>`, sometimes without
//! the path identifier. There is no published grammar, so parsing is strict
//! and anything unexpected is an error rather than a miss.

use std::fmt;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, Weekday};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::TripIdGrammarError;
use crate::model::TransitSystem;

static SCHEDULED_TRIP_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^
        (?P<sub_division>A|B|SIR)-?
        (?P<effective_date>FA\d+(?:GEN|SUPP)?)-
        (?P<unknown_1>.+)-
        (?P<service_code>Weekday|Saturday|Sunday)-
        (?P<unknown_2>\d{2})_
        (?P<origin_time>\d{6})_
        (?P<trip_path>
            (?P<route_id_and_dots>.+)\.{1,2}
            (?P<direction>[NSEW])
            (?P<path_identifier>.*)
        )$",
    )
    .expect("valid scheduled trip id pattern")
});

static REALTIME_TRIP_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^
        (?P<origin_time>\d{6})_
        (?P<trip_path>
            (?P<route_id_and_dots>.+)\.{1,2}
            (?P<direction>[NSEW])
            (?P<path_identifier>.*)
        )$",
    )
    .expect("valid real-time trip id pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceDay {
    Weekday,
    Saturday,
    Sunday,
}

impl ServiceDay {
    /// Service day implied by the calendar weekday of `date`.
    pub fn from_date(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Sat => ServiceDay::Saturday,
            Weekday::Sun => ServiceDay::Sunday,
            _ => ServiceDay::Weekday,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Weekday" => Some(ServiceDay::Weekday),
            "Saturday" => Some(ServiceDay::Saturday),
            "Sunday" => Some(ServiceDay::Sunday),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceDay::Weekday => "Weekday",
            ServiceDay::Saturday => "Saturday",
            ServiceDay::Sunday => "Sunday",
        }
    }
}

impl fmt::Display for ServiceDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decomposed trip id. Fields only present in the scheduled form are
/// `None` for real-time ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripId {
    pub sub_division: Option<String>,
    pub effective_date: Option<String>,
    pub service_day: Option<ServiceDay>,
    pub origin_time: String,
    pub trip_path: String,
    pub route_id: String,
    pub direction: String,
    pub path_identifier: String,
}

impl TripId {
    /// Parses either a scheduled or a real-time trip id.
    pub fn parse(trip_id: &str) -> Result<Self, TripIdGrammarError> {
        if let Some(caps) = SCHEDULED_TRIP_ID.captures(trip_id) {
            return Self::from_scheduled_captures(trip_id, &caps);
        }
        match REALTIME_TRIP_ID.captures(trip_id) {
            Some(caps) => Ok(Self::from_path_captures(&caps, None, None, None)),
            None => Err(TripIdGrammarError::NoMatch(trip_id.to_string())),
        }
    }

    /// Parses a trip id from the static schedule; the real-time short form
    /// is rejected.
    pub fn parse_scheduled(trip_id: &str) -> Result<Self, TripIdGrammarError> {
        let caps = SCHEDULED_TRIP_ID
            .captures(trip_id)
            .ok_or_else(|| TripIdGrammarError::NoMatch(trip_id.to_string()))?;
        Self::from_scheduled_captures(trip_id, &caps)
    }

    fn from_scheduled_captures(
        trip_id: &str,
        caps: &Captures<'_>,
    ) -> Result<Self, TripIdGrammarError> {
        let service_day = ServiceDay::from_label(&caps["service_code"])
            .ok_or_else(|| TripIdGrammarError::NoMatch(trip_id.to_string()))?;
        let parsed = Self::from_path_captures(
            caps,
            Some(caps["sub_division"].to_string()),
            Some(caps["effective_date"].to_string()),
            Some(service_day),
        );

        let segment = &caps["unknown_1"];
        if !segment.starts_with(&parsed.route_id) {
            return Err(TripIdGrammarError::RoutePrefixMismatch {
                trip_id: trip_id.to_string(),
                segment: segment.to_string(),
                route_id: parsed.route_id,
            });
        }
        Ok(parsed)
    }

    fn from_path_captures(
        caps: &Captures<'_>,
        sub_division: Option<String>,
        effective_date: Option<String>,
        service_day: Option<ServiceDay>,
    ) -> Self {
        Self {
            sub_division,
            effective_date,
            service_day,
            origin_time: caps["origin_time"].to_string(),
            trip_path: caps["trip_path"].to_string(),
            route_id: caps["route_id_and_dots"].trim_end_matches('.').to_string(),
            direction: caps["direction"].to_string(),
            path_identifier: caps["path_identifier"].to_string(),
        }
    }

    /// Resolves the service day for a trip running on `service_date`.
    ///
    /// When the id embeds a service label it must agree with the calendar.
    pub fn service_day_on(
        &self,
        trip_id: &str,
        service_date: NaiveDate,
    ) -> Result<ServiceDay, TripIdGrammarError> {
        let expected = ServiceDay::from_date(service_date);
        match self.service_day {
            Some(label) if label != expected => Err(TripIdGrammarError::ServiceDayMismatch {
                trip_id: trip_id.to_string(),
                label: label.to_string(),
                expected: expected.to_string(),
            }),
            _ => Ok(expected),
        }
    }

    /// Candidate real-time ids: `<origin>_<path>` with and without the
    /// path identifier.
    ///
    /// `(origin time, route, direction)` is supposed to identify a trip but
    /// is not always unique, which is why the identifier variant exists.
    pub fn short_ids(&self) -> Vec<String> {
        let without_identifier =
            &self.trip_path[..self.trip_path.len() - self.path_identifier.len()];
        let mut ids = vec![
            format!("{}_{}", self.origin_time, self.trip_path),
            format!("{}_{}", self.origin_time, without_identifier),
        ];
        ids.dedup();
        ids
    }
}

/// One row of the `(system, alternate_trip_id, service_day) -> trip_id`
/// mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlternateTripId {
    pub system: TransitSystem,
    pub alternate_trip_id: String,
    pub service_day: ServiceDay,
    pub trip_id: String,
}

impl AlternateTripId {
    /// Expands one scheduled trip id into a concrete mapping row per short id.
    pub fn enumerate(
        system: TransitSystem,
        trip_id: &str,
    ) -> Result<Vec<Self>, TripIdGrammarError> {
        let parsed = TripId::parse_scheduled(trip_id)?;
        let service_day = parsed
            .service_day
            .ok_or_else(|| TripIdGrammarError::NoMatch(trip_id.to_string()))?;

        Ok(parsed
            .short_ids()
            .into_iter()
            .map(|alternate_trip_id| AlternateTripId {
                system,
                alternate_trip_id,
                service_day,
                trip_id: trip_id.to_string(),
            })
            .collect())
    }
}
