//! Error types for the ingest pipeline.

use thiserror::Error;

/// A snapshot that cannot be turned into a [`crate::model::FeedMessage`].
///
/// Fatal for that snapshot's reconciliation only; the captured bytes stay
/// valid and replayable.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("FeedMessage not initialized: missing {0}")]
    Uninitialized(&'static str),
    #[error("Invalid start_date '{0}' (expected YYYYMMDD)")]
    InvalidStartDate(String),
    #[error("Unknown vehicle stop status {0}")]
    UnknownStopStatus(i32),
    #[error("Timestamp {0} out of range")]
    TimestampOutOfRange(i64),
}

/// A compound trip id that does not follow the expected format.
///
/// Signals that an assumption about the agency's data no longer holds; it
/// is never downgraded to "no match".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TripIdGrammarError {
    #[error("Unable to parse trip_id {0}")]
    NoMatch(String),
    #[error("trip_id {trip_id}: segment '{segment}' does not start with route {route_id}")]
    RoutePrefixMismatch {
        trip_id: String,
        segment: String,
        route_id: String,
    },
    #[error("trip_id {trip_id}: service label {label} disagrees with service date ({expected})")]
    ServiceDayMismatch {
        trip_id: String,
        label: String,
        expected: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error(transparent)]
    Grammar(#[from] TripIdGrammarError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
    #[error("Feed HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("Feed response too large: {size} bytes (max {max} bytes)")]
    TooLarge { size: usize, max: usize },
    #[error("Invalid auth configuration: {0}")]
    InvalidAuth(String),
}

/// A checkpoint cursor that cannot be (de)serialized.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Malformed checkpoint: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Checkpoint must be a JSON object")]
    NotAnObject,
    #[error("Cannot deserialize type {kind}, value {value}")]
    UnsupportedType { kind: String, value: String },
    #[error("Checkpoint is missing field {0}")]
    MissingField(&'static str),
    #[error("Checkpoint field {field} has unexpected type")]
    WrongType { field: &'static str },
    #[error("Invalid timestamp '{0}' in checkpoint")]
    InvalidTimestamp(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Processing failed: {0}")]
    Process(#[from] PipelineError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Unable to read checkpoint for job {job_name}: {source}")]
    CheckpointRead {
        job_name: String,
        #[source]
        source: CheckpointError,
    },
    #[error("Unable to encode checkpoint: {0}")]
    CheckpointEncode(#[from] CheckpointError),
    #[error("Checkpoint {next} does not advance past {previous}")]
    CheckpointRegression { previous: String, next: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_uninitialized() {
        let err = DecodeError::Uninitialized("header.timestamp");
        assert_eq!(
            err.to_string(),
            "FeedMessage not initialized: missing header.timestamp"
        );
    }

    #[test]
    fn error_display_grammar() {
        let err = TripIdGrammarError::NoMatch("garbage".into());
        assert_eq!(err.to_string(), "Unable to parse trip_id garbage");
    }

    #[test]
    fn error_from_prost_decode_error() {
        let bad_bytes: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        let decode_err =
            <crate::gtfs_rt::FeedMessage as prost::Message>::decode(bad_bytes).unwrap_err();
        let err: DecodeError = decode_err.into();
        assert!(matches!(err, DecodeError::Protobuf(_)));
    }

    #[test]
    fn match_error_is_transparent() {
        let err: MatchError = TripIdGrammarError::NoMatch("x".into()).into();
        assert_eq!(err.to_string(), "Unable to parse trip_id x");
    }
}
