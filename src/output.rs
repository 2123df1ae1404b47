//! Summaries of decoded snapshots for the `inspect` command.
//!
//! Supports pretty-printing, JSON serialization, and CSV append.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::model::FeedMessage;
use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::Path;

/// One CSV row describing a decoded feed message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedSummary {
    pub inspected_at: Option<DateTime<Utc>>,
    pub system: String,
    pub feed_id: String,
    pub header_timestamp: Option<DateTime<Utc>>,
    pub trip_updates: usize,
    pub routeless_trip_updates: usize,
    pub stop_time_events: usize,
    pub timeless_stop_time_events: usize,
    pub vehicle_positions: usize,
    pub vehicles_without_stop: usize,
    /// `route=end` pairs separated by `;`.
    pub replacement_windows: String,
}

impl FeedSummary {
    pub fn from_message(message: &FeedMessage, inspected_at: DateTime<Utc>) -> Self {
        let events = message.trip_updates.iter().flat_map(|u| &u.stop_time_events);
        Self {
            inspected_at: Some(inspected_at),
            system: message.system.to_string(),
            feed_id: message.feed_id.clone(),
            header_timestamp: Some(message.header_timestamp),
            trip_updates: message.trip_updates.len(),
            routeless_trip_updates: message
                .trip_updates
                .iter()
                .filter(|u| u.trip.route_id.is_none())
                .count(),
            stop_time_events: events.clone().count(),
            timeless_stop_time_events: events.filter(|e| !e.has_time()).count(),
            vehicle_positions: message.vehicle_positions.len(),
            vehicles_without_stop: message
                .vehicle_positions
                .iter()
                .filter(|v| v.stop_id.is_none())
                .count(),
            replacement_windows: message
                .replacement_windows
                .iter()
                .map(|(route, end)| format!("{route}={}", end.to_rfc3339()))
                .collect::<Vec<_>>()
                .join(";"),
        }
    }
}

/// Logs a summary using Rust's debug pretty-print format.
pub fn print_pretty(summary: &FeedSummary) {
    debug!("{:#?}", summary);
}

/// Logs a summary as pretty-printed JSON.
pub fn print_json(summary: &FeedSummary) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

/// Appends a [`FeedSummary`] record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, summary: &FeedSummary) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(summary)?;
    writer.flush()?;

    Ok(())
}
