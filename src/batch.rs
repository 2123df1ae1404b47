//! Checkpointed replay of captured snapshots.
//!
//! Pages of snapshots are read in `(captured_at, feed_id)` order. After a
//! page has been fully processed its last key is appended to the checkpoint
//! log, so an interrupted run redoes at most one page.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::capture::Clock;
use crate::checkpoint::{dump_snapshot_key, load_snapshot_key};
use crate::error::PipelineError;
use crate::model::{RawSnapshot, SnapshotKey, TransitSystem};
use crate::store::{CheckpointStore, PageQuery, SnapshotStore};

/// Work done for each replayed snapshot. Must be safe to repeat.
#[async_trait]
pub trait RowProcessor: Send + Sync {
    async fn process(&self, row: &RawSnapshot) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    /// Rows of one feed run in order; feeds run concurrently.
    ByFeed,
    /// Fixed-size concurrent chunks, no ordering.
    Ungrouped,
}

#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Checkpoints are only read and written for named jobs.
    pub job_name: Option<String>,
    /// Serialized cursor to start after. Takes precedence over the job's
    /// persisted checkpoint.
    pub start_cursor: Option<String>,
    pub from_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub page_size: usize,
    pub chunk_size: usize,
    pub grouping: Grouping,
}

impl Default for BatchJob {
    fn default() -> Self {
        Self {
            job_name: None,
            start_cursor: None,
            from_time: None,
            limit: None,
            page_size: 100,
            chunk_size: 20,
            grouping: Grouping::ByFeed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    FetchingPage,
    ProcessingPage,
    Checkpointing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub pages: usize,
    pub rows: usize,
    pub last_cursor: Option<String>,
}

pub struct CheckpointedBatchRunner {
    system: TransitSystem,
    snapshots: Arc<dyn SnapshotStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    processor: Arc<dyn RowProcessor>,
    clock: Arc<dyn Clock>,
    state: Mutex<BatchState>,
}

impl CheckpointedBatchRunner {
    pub fn new(
        system: TransitSystem,
        snapshots: Arc<dyn SnapshotStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        processor: Arc<dyn RowProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            system,
            snapshots,
            checkpoints,
            processor,
            clock,
            state: Mutex::new(BatchState::Idle),
        }
    }

    pub fn state(&self) -> BatchState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: BatchState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    #[tracing::instrument(skip_all, fields(job = job.job_name.as_deref().unwrap_or("-")))]
    pub async fn run(&self, job: &BatchJob) -> Result<BatchSummary, PipelineError> {
        self.set_state(BatchState::Idle);
        match self.run_pages(job).await {
            Ok(summary) => {
                self.set_state(BatchState::Done);
                info!(pages = summary.pages, rows = summary.rows, "Batch job finished");
                Ok(summary)
            }
            Err(e) => {
                self.set_state(BatchState::Failed);
                Err(e)
            }
        }
    }

    async fn run_pages(&self, job: &BatchJob) -> Result<BatchSummary, PipelineError> {
        let mut after = self.start_key(job).await?;
        let mut summary = BatchSummary::default();
        let page_size = job.page_size.max(1);

        loop {
            let requested = match job.limit {
                Some(limit) if summary.rows >= limit => break,
                Some(limit) => page_size.min(limit - summary.rows),
                None => page_size,
            };

            self.set_state(BatchState::FetchingPage);
            let page = self
                .snapshots
                .fetch_page(&PageQuery {
                    system: self.system,
                    after: after.clone(),
                    from_time: job.from_time,
                    limit: requested,
                })
                .await?;
            let Some(last) = page.last().map(RawSnapshot::key) else {
                break;
            };

            self.set_state(BatchState::ProcessingPage);
            self.process_page(job, &page).await?;

            self.set_state(BatchState::Checkpointing);
            let cursor = self.checkpoint(job, after.as_ref(), &last).await?;

            summary.pages += 1;
            summary.rows += page.len();
            info!(
                page = summary.pages,
                rows = summary.rows,
                checkpoint = %cursor,
                "Processed page"
            );
            summary.last_cursor = Some(cursor);
            after = Some(last);

            if page.len() < requested {
                break;
            }
        }
        Ok(summary)
    }

    /// Explicit cursor first, then the job's latest checkpoint.
    async fn start_key(&self, job: &BatchJob) -> Result<Option<SnapshotKey>, PipelineError> {
        let job_name = job.job_name.clone().unwrap_or_default();
        let cursor = match (&job.start_cursor, &job.job_name) {
            (Some(cursor), _) => Some(cursor.clone()),
            (None, Some(name)) => self.checkpoints.latest_checkpoint(name).await?,
            (None, None) => None,
        };
        let Some(cursor) = cursor else {
            return Ok(None);
        };

        let key = load_snapshot_key(&cursor)
            .map_err(|source| PipelineError::CheckpointRead { job_name, source })?;
        info!(checkpoint = %cursor, "Resuming after checkpoint");
        Ok(Some(key))
    }

    async fn checkpoint(
        &self,
        job: &BatchJob,
        previous: Option<&SnapshotKey>,
        last: &SnapshotKey,
    ) -> Result<String, PipelineError> {
        let cursor = dump_snapshot_key(last)?;
        if let Some(previous) = previous {
            if last <= previous {
                return Err(PipelineError::CheckpointRegression {
                    previous: dump_snapshot_key(previous)?,
                    next: cursor,
                });
            }
        }
        if let Some(job_name) = &job.job_name {
            self.checkpoints
                .append_checkpoint(job_name, self.clock.now(), &cursor)
                .await?;
        }
        Ok(cursor)
    }

    async fn process_page(&self, job: &BatchJob, page: &[RawSnapshot]) -> Result<(), PipelineError> {
        match job.grouping {
            Grouping::ByFeed => {
                let mut groups: BTreeMap<&str, Vec<&RawSnapshot>> = BTreeMap::new();
                for row in page {
                    groups.entry(row.feed_id.as_str()).or_default().push(row);
                }
                debug!(groups = groups.len(), rows = page.len(), "Processing page by feed");

                try_join_all(groups.into_values().map(|rows| async move {
                    for row in rows {
                        self.processor.process(row).await?;
                    }
                    Ok::<_, PipelineError>(())
                }))
                .await?;
            }
            Grouping::Ungrouped => {
                for chunk in page.chunks(job.chunk_size.max(1)) {
                    try_join_all(chunk.iter().map(|row| self.processor.process(row))).await?;
                }
            }
        }
        Ok(())
    }
}
