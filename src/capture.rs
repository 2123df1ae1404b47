//! Live capture: fetch every configured feed concurrently, store the raw
//! snapshot, optionally run it through the pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{Instrument, error, info, info_span, warn};

use crate::error::{CaptureError, StoreError};
use crate::fetch::FeedFetcher;
use crate::model::{FeedMessage, RawSnapshot, TransitSystem};
use crate::parser::decode_feed;
use crate::pipeline::Pipeline;
use crate::store::SnapshotStore;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub trait Backoff: Send + Sync {
    /// Delay before retry number `retry` (starting at 1).
    fn delay(&self, retry: u32) -> Duration;
}

pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _retry: u32) -> Duration {
        self.0
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Arc<dyn Backoff>,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Arc::new(FixedBackoff(delay)),
        }
    }
}

/// What one successful capture produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFeed {
    pub captured_at: DateTime<Utc>,
    pub trip_updates: usize,
    pub vehicle_positions: usize,
    /// Rows changed by the pipeline, when processing is enabled.
    pub rows_written: Option<u64>,
}

#[derive(Debug)]
pub struct SourceOutcome {
    pub feed_id: String,
    pub retries: u32,
    pub result: Result<CapturedFeed, CaptureError>,
}

#[derive(Debug, Default)]
pub struct CaptureReport {
    pub outcomes: Vec<SourceOutcome>,
}

impl CaptureReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

pub struct LiveCapture {
    system: TransitSystem,
    feed_url: String,
    fetcher: Arc<dyn FeedFetcher>,
    snapshots: Arc<dyn SnapshotStore>,
    pipeline: Option<Arc<Pipeline>>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl LiveCapture {
    pub fn new(
        system: TransitSystem,
        feed_url: &str,
        fetcher: Arc<dyn FeedFetcher>,
        snapshots: Arc<dyn SnapshotStore>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            system,
            feed_url: feed_url.to_string(),
            fetcher,
            snapshots,
            pipeline: None,
            retry,
            clock,
        }
    }

    /// Also reconcile and write every captured message.
    pub fn with_pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Captures every feed concurrently. A failing feed never affects the
    /// others.
    pub async fn capture_all(&self, feed_ids: &[String]) -> CaptureReport {
        let tasks = feed_ids.iter().map(|feed_id| {
            let span = info_span!("feed", system = %self.system, feed_id = %feed_id);
            self.capture_source(feed_id).instrument(span)
        });
        let report = CaptureReport {
            outcomes: join_all(tasks).await,
        };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Capture round complete"
        );
        report
    }

    async fn capture_source(&self, feed_id: &str) -> SourceOutcome {
        let mut retries = 0;
        // Reported once retries run out
        let mut first_error = None;
        let captured = loop {
            match self.attempt(feed_id).await {
                Ok(message) => break Ok(message),
                Err(e) if retries < self.retry.max_retries => {
                    retries += 1;
                    warn!(retry = retries, error = %e, "Capture attempt failed, retrying");
                    first_error.get_or_insert(e);
                    self.clock.sleep(self.retry.backoff.delay(retries)).await;
                }
                Err(e) => break Err(first_error.unwrap_or(e)),
            }
        };

        // Processing failures are not retried: the snapshot is already stored
        // and can be replayed.
        let result = match captured {
            Ok(message) => self.process(message).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(feed) => info!(
                retries,
                captured_at = %feed.captured_at,
                trip_updates = feed.trip_updates,
                rows_written = feed.rows_written,
                "Captured feed"
            ),
            Err(e) => error!(retries, error = %e, "Failed to capture feed"),
        }

        SourceOutcome {
            feed_id: feed_id.to_string(),
            retries,
            result,
        }
    }

    async fn attempt(&self, feed_id: &str) -> Result<FeedMessage, CaptureError> {
        let bytes = self
            .fetcher
            .fetch(&self.feed_url, &[("feed_id", feed_id)])
            .await?;
        let message = decode_feed(self.system, feed_id, &bytes)?;

        let json_mirror = serde_json::to_string(&message).map_err(StoreError::from)?;
        let snapshot = RawSnapshot {
            system: self.system,
            feed_id: feed_id.to_string(),
            captured_at: message.header_timestamp,
            raw_bytes: bytes,
            json_mirror: Some(json_mirror),
            ingested_at: self.clock.now(),
        };
        self.snapshots.put_snapshot(&snapshot).await?;
        Ok(message)
    }

    async fn process(&self, message: FeedMessage) -> Result<CapturedFeed, CaptureError> {
        let mut feed = CapturedFeed {
            captured_at: message.header_timestamp,
            trip_updates: message.trip_updates.len(),
            vehicle_positions: message.vehicle_positions.len(),
            rows_written: None,
        };
        if let Some(pipeline) = &self.pipeline {
            feed.rows_written = Some(pipeline.ingest(message).await?);
        }
        Ok(feed)
    }
}
