//! Decode → reconcile → match → write, shared by live capture and replay.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, warn};

use crate::batch::RowProcessor;
use crate::error::PipelineError;
use crate::matcher::TripMatcher;
use crate::model::{
    FeedMessage, RawSnapshot, ReconciledFeedMessage, ReconciledTripUpdate, TransitSystem,
    TripUpdate,
};
use crate::parser::decode_feed;
use crate::reconcile::Reconciler;
use crate::store::{StaticScheduleStore, StopEventStore};
use crate::writer::IdempotentWriter;

pub struct Pipeline {
    matcher: Arc<TripMatcher>,
    reconciler: Reconciler,
    writer: IdempotentWriter,
}

impl Pipeline {
    /// Builds a pipeline with a fresh matcher; its caches live as long as
    /// the pipeline.
    pub fn new(
        system: TransitSystem,
        schedule: Arc<dyn StaticScheduleStore>,
        events: Arc<dyn StopEventStore>,
    ) -> Self {
        let matcher = Arc::new(TripMatcher::new(system, schedule));
        Self {
            reconciler: Reconciler::new(matcher.clone()),
            writer: IdempotentWriter::new(events),
            matcher,
        }
    }

    pub fn system(&self) -> TransitSystem {
        self.matcher.system()
    }

    pub fn matcher(&self) -> &TripMatcher {
        &self.matcher
    }

    /// Reconciles a message and resolves every remaining trip update.
    /// Unmatched updates are kept and written under their real-time id.
    pub async fn process_feed_message(
        &self,
        message: FeedMessage,
    ) -> Result<ReconciledFeedMessage, PipelineError> {
        let FeedMessage {
            system,
            feed_id,
            header_timestamp,
            replacement_windows,
            trip_updates,
            vehicle_positions,
        } = self.reconciler.reconcile(message).await?;

        let mut reconciled = ReconciledFeedMessage {
            system,
            feed_id,
            header_timestamp,
            replacement_windows,
            trip_updates: Vec::new(),
            vehicle_positions,
        };
        let matched = try_join_all(
            trip_updates
                .into_iter()
                .map(|update| self.match_trip_update(&reconciled, update)),
        )
        .await?;
        reconciled.trip_updates = matched;
        Ok(reconciled)
    }

    async fn match_trip_update(
        &self,
        message: &ReconciledFeedMessage,
        update: TripUpdate,
    ) -> Result<ReconciledTripUpdate, PipelineError> {
        let scheduled_trip = self.matcher.resolve(&update.trip).await?;
        if scheduled_trip.is_none() {
            let route_id = update.trip.route_id.as_deref().unwrap_or_default();
            if message.is_trip_replaced(route_id) {
                debug!(trip_id = %update.trip.trip_id, route_id, "Replacement trip not in schedule");
            } else {
                warn!(
                    trip_id = %update.trip.trip_id,
                    route_id,
                    service_date = %update.trip.service_date,
                    "No scheduled trip for trip update"
                );
            }
        }
        Ok(ReconciledTripUpdate {
            update,
            scheduled_trip,
        })
    }

    /// Writes every trip update of a reconciled message. Returns the number
    /// of rows changed.
    pub async fn write(&self, message: &ReconciledFeedMessage) -> Result<u64, PipelineError> {
        let written = try_join_all(message.trip_updates.iter().map(|update| {
            self.writer
                .write(message.system, message.header_timestamp, update)
        }))
        .await?;
        Ok(written.into_iter().sum())
    }

    #[tracing::instrument(skip_all, fields(feed_id = %message.feed_id, header_timestamp = %message.header_timestamp))]
    pub async fn ingest(&self, message: FeedMessage) -> Result<u64, PipelineError> {
        let reconciled = self.process_feed_message(message).await?;
        let rows = self.write(&reconciled).await?;
        debug!(
            trip_updates = reconciled.trip_updates.len(),
            rows,
            "Wrote reconciled feed message"
        );
        Ok(rows)
    }
}

/// Replays captured snapshots through a [`Pipeline`].
///
/// A snapshot that fails to decode is logged and skipped; it stays in the
/// snapshot store for later inspection.
pub struct SnapshotProcessor {
    pipeline: Arc<Pipeline>,
}

impl SnapshotProcessor {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl RowProcessor for SnapshotProcessor {
    async fn process(&self, row: &RawSnapshot) -> Result<(), PipelineError> {
        let message = match decode_feed(row.system, &row.feed_id, &row.raw_bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    feed_id = %row.feed_id,
                    captured_at = %row.captured_at,
                    error = %e,
                    "Skipping undecodable snapshot"
                );
                return Ok(());
            }
        };
        self.pipeline.ingest(message).await?;
        Ok(())
    }
}
