use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use super::{CheckpointStore, PageQuery, SnapshotStore, StaticScheduleStore, StopEventStore};
use crate::error::StoreError;
use crate::model::{
    RawSnapshot, ReconciledStopEvent, ScheduledTrip, StopEventKey, TransitSystem,
};
use crate::trip_id::{AlternateTripId, ServiceDay};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed implementation of every store trait.
///
/// Timestamps are stored as microseconds since the epoch, service dates as
/// `YYYY-MM-DD` text.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects to `url` (e.g. `sqlite:database/transit.db?mode=rwc`) and
    /// applies the bundled migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new().connect(url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database. Single connection, since every SQLite
    /// memory connection is its own database.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let migrator = sqlx::migrate!("./migrations");
        migrator.run(&self.pool).await?;
        info!(migrations = migrator.migrations.len(), "Database migrations completed");
        Ok(())
    }

    pub async fn insert_stop(&self, system: TransitSystem, stop_id: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO stops (system, stop_id) VALUES (?, ?)")
            .bind(system.as_str())
            .bind(stop_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_trip(&self, trip: &ScheduledTrip) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trips (system, trip_id, route_id, service_id, trip_headsign, direction_id)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(system, trip_id) DO UPDATE SET
                route_id = excluded.route_id,
                service_id = excluded.service_id,
                trip_headsign = excluded.trip_headsign,
                direction_id = excluded.direction_id
            "#,
        )
        .bind(trip.system.as_str())
        .bind(&trip.trip_id)
        .bind(&trip.route_id)
        .bind(&trip.service_id)
        .bind(&trip.trip_headsign)
        .bind(trip.direction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_alternate_ids(&self, rows: &[AlternateTripId]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO mta_trip_id (system, alternate_trip_id, service_day, trip_id) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.system.as_str())
                .push_bind(row.alternate_trip_id.clone())
                .push_bind(row.service_day.as_str())
                .push_bind(row.trip_id.clone());
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_stop_time(
        &self,
        system: TransitSystem,
        trip_id: &str,
        stop_sequence: u32,
        stop_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO stop_times (system, trip_id, stop_sequence, stop_id) VALUES (?, ?, ?, ?)",
        )
        .bind(system.as_str())
        .bind(trip_id)
        .bind(i64::from(stop_sequence))
        .bind(stop_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(table: &'static str, value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(value).ok_or_else(|| StoreError::CorruptRow {
        table,
        message: format!("timestamp {value} out of range"),
    })
}

fn opt_from_micros(
    table: &'static str,
    value: Option<i64>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|v| from_micros(table, v)).transpose()
}

#[async_trait]
impl StaticScheduleStore for SqliteStore {
    async fn trip_by_id(
        &self,
        system: TransitSystem,
        trip_id: &str,
    ) -> Result<Option<ScheduledTrip>, StoreError> {
        let row: Option<(String, String, String, Option<String>, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT trip_id, route_id, service_id, trip_headsign, direction_id
            FROM trips WHERE system = ? AND trip_id = ?
            "#,
        )
        .bind(system.as_str())
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(trip_id, route_id, service_id, trip_headsign, direction_id)| ScheduledTrip {
                system,
                trip_id,
                route_id,
                service_id,
                trip_headsign,
                direction_id,
            },
        ))
    }

    async fn stop_exists(&self, system: TransitSystem, stop_id: &str) -> Result<bool, StoreError> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT stop_id FROM stops WHERE system = ? AND stop_id = ?")
                .bind(system.as_str())
                .bind(stop_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn alternate_trip_ids(
        &self,
        system: TransitSystem,
        alternate_trip_id: &str,
        service_day: ServiceDay,
    ) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT trip_id FROM mta_trip_id
            WHERE system = ? AND alternate_trip_id = ? AND service_day = ?
            ORDER BY trip_id
            "#,
        )
        .bind(system.as_str())
        .bind(alternate_trip_id)
        .bind(service_day.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(trip_id,)| trip_id).collect())
    }

    async fn stop_id_from_sequence(
        &self,
        system: TransitSystem,
        trip_id: &str,
        stop_sequence: u32,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT stop_id FROM stop_times WHERE system = ? AND trip_id = ? AND stop_sequence = ?",
        )
        .bind(system.as_str())
        .bind(trip_id)
        .bind(i64::from(stop_sequence))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(stop_id,)| stop_id))
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn put_snapshot(&self, snapshot: &RawSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO realtime_raw (system, feed_id, captured_at, raw, json, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(system, feed_id, captured_at) DO UPDATE SET
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(snapshot.system.as_str())
        .bind(&snapshot.feed_id)
        .bind(micros(snapshot.captured_at))
        .bind(&snapshot.raw_bytes)
        .bind(&snapshot.json_mirror)
        .bind(micros(snapshot.ingested_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<RawSnapshot>, StoreError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT feed_id, captured_at, raw, json, ingested_at FROM realtime_raw WHERE system = ",
        );
        builder.push_bind(query.system.as_str());
        if let Some(from_time) = query.from_time {
            builder.push(" AND captured_at >= ").push_bind(micros(from_time));
        }
        if let Some(after) = &query.after {
            builder
                .push(" AND (captured_at, feed_id) > (")
                .push_bind(micros(after.captured_at))
                .push(", ")
                .push_bind(after.feed_id.clone())
                .push(")");
        }
        builder
            .push(" ORDER BY captured_at, feed_id LIMIT ")
            .push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX));

        let rows: Vec<(String, i64, Vec<u8>, Option<String>, i64)> =
            builder.build_query_as().fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|(feed_id, captured_at, raw_bytes, json_mirror, ingested_at)| {
                Ok(RawSnapshot {
                    system: query.system,
                    feed_id,
                    captured_at: from_micros("realtime_raw", captured_at)?,
                    raw_bytes,
                    json_mirror,
                    ingested_at: from_micros("realtime_raw", ingested_at)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn append_checkpoint(
        &self,
        job_name: &str,
        recorded_at: DateTime<Utc>,
        cursor: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO batch_checkpoints (job_name, recorded_at, cursor) VALUES (?, ?, ?)")
            .bind(job_name)
            .bind(micros(recorded_at))
            .bind(cursor)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_checkpoint(&self, job_name: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT cursor FROM batch_checkpoints
            WHERE job_name = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(cursor,)| cursor))
    }
}

#[async_trait]
impl StopEventStore for SqliteStore {
    async fn upsert_stop_events(&self, rows: &[ReconciledStopEvent]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"INSERT INTO realtime_stop_times
            (system, route_id, stop_id, start_date, trip_id, trip_timestamp, arrival, departure, update_time) "#,
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.system.as_str())
                .push_bind(row.route_id.clone())
                .push_bind(row.stop_id.clone())
                .push_bind(row.service_date.format(DATE_FORMAT).to_string())
                .push_bind(row.trip_id.clone())
                .push_bind(row.trip_timestamp.map(micros))
                .push_bind(row.arrival.map(micros))
                .push_bind(row.departure.map(micros))
                .push_bind(micros(row.freshness));
        });
        builder.push(
            r#"
            ON CONFLICT(system, route_id, stop_id, start_date, trip_id) DO UPDATE SET
                trip_timestamp = excluded.trip_timestamp,
                arrival = excluded.arrival,
                departure = excluded.departure,
                update_time = excluded.update_time
            WHERE realtime_stop_times.update_time <= excluded.update_time
            "#,
        );

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn stop_event(
        &self,
        key: &StopEventKey,
    ) -> Result<Option<ReconciledStopEvent>, StoreError> {
        let row: Option<(Option<i64>, Option<i64>, Option<i64>, i64)> = sqlx::query_as(
            r#"
            SELECT trip_timestamp, arrival, departure, update_time
            FROM realtime_stop_times
            WHERE system = ? AND route_id = ? AND stop_id = ? AND start_date = ? AND trip_id = ?
            "#,
        )
        .bind(key.system.as_str())
        .bind(&key.route_id)
        .bind(&key.stop_id)
        .bind(key.service_date.format(DATE_FORMAT).to_string())
        .bind(&key.trip_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((trip_timestamp, arrival, departure, update_time)) = row else {
            return Ok(None);
        };
        const TABLE: &str = "realtime_stop_times";
        Ok(Some(ReconciledStopEvent {
            system: key.system,
            route_id: key.route_id.clone(),
            stop_id: key.stop_id.clone(),
            service_date: key.service_date,
            trip_id: key.trip_id.clone(),
            trip_timestamp: opt_from_micros(TABLE, trip_timestamp)?,
            arrival: opt_from_micros(TABLE, arrival)?,
            departure: opt_from_micros(TABLE, departure)?,
            freshness: from_micros(TABLE, update_time)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SnapshotKey;
    use chrono::NaiveDate;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn snapshot(feed_id: &str, captured_at: i64, ingested_at: i64) -> RawSnapshot {
        RawSnapshot {
            system: TransitSystem::NycMta,
            feed_id: feed_id.to_string(),
            captured_at: ts(captured_at),
            raw_bytes: vec![1, 2, 3],
            json_mirror: None,
            ingested_at: ts(ingested_at),
        }
    }

    fn stop_event(freshness: i64, departure: i64) -> ReconciledStopEvent {
        ReconciledStopEvent {
            system: TransitSystem::NycMta,
            route_id: "R1".into(),
            stop_id: "S1".into(),
            service_date: NaiveDate::from_ymd_opt(2019, 10, 21).unwrap(),
            trip_id: "X".into(),
            trip_timestamp: None,
            arrival: None,
            departure: Some(ts(departure)),
            freshness: ts(freshness),
        }
    }

    #[tokio::test]
    async fn test_snapshot_reingest_only_touches_ingested_at() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        store.put_snapshot(&snapshot("1", 100, 200)).await.unwrap();

        let mut again = snapshot("1", 100, 300);
        again.raw_bytes = vec![9, 9];
        store.put_snapshot(&again).await.unwrap();

        let page = store
            .fetch_page(&PageQuery {
                system: TransitSystem::NycMta,
                after: None,
                from_time: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].raw_bytes, vec![1, 2, 3]);
        assert_eq!(page[0].ingested_at, ts(300));
    }

    #[tokio::test]
    async fn test_fetch_page_is_ordered_and_exclusive() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        for (feed_id, captured_at) in [("26", 10), ("1", 20), ("1", 10), ("31", 10)] {
            store.put_snapshot(&snapshot(feed_id, captured_at, 0)).await.unwrap();
        }

        let query = |after: Option<SnapshotKey>| PageQuery {
            system: TransitSystem::NycMta,
            after,
            from_time: None,
            limit: 10,
        };

        let keys: Vec<_> = store
            .fetch_page(&query(None))
            .await
            .unwrap()
            .iter()
            .map(|s| (s.captured_at.timestamp(), s.feed_id.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![(10, "1".into()), (10, "26".into()), (10, "31".into()), (20, "1".into())]
        );

        let after = SnapshotKey { captured_at: ts(10), feed_id: "26".into() };
        let page = store.fetch_page(&query(Some(after))).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].feed_id, "31");
    }

    #[tokio::test]
    async fn test_conditional_upsert_ignores_older_rows() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let key = stop_event(0, 0).key();

        assert_eq!(store.upsert_stop_events(&[stop_event(2000, 2050)]).await.unwrap(), 1);
        assert_eq!(store.upsert_stop_events(&[stop_event(1000, 1050)]).await.unwrap(), 0);
        let stored = store.stop_event(&key).await.unwrap().unwrap();
        assert_eq!(stored.departure, Some(ts(2050)));
        assert_eq!(stored.freshness, ts(2000));

        // Equal freshness still overwrites
        assert_eq!(store.upsert_stop_events(&[stop_event(2000, 2060)]).await.unwrap(), 1);
        let stored = store.stop_event(&key).await.unwrap().unwrap();
        assert_eq!(stored.departure, Some(ts(2060)));
    }

    #[tokio::test]
    async fn test_latest_checkpoint_wins() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        assert_eq!(store.latest_checkpoint("job").await.unwrap(), None);

        store.append_checkpoint("job", ts(10), "a").await.unwrap();
        store.append_checkpoint("job", ts(20), "b").await.unwrap();
        store.append_checkpoint("other", ts(30), "c").await.unwrap();

        assert_eq!(store.latest_checkpoint("job").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_alternate_trip_lookup() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let rows = AlternateTripId::enumerate(
            TransitSystem::NycMta,
            "AFA19GEN-1037-Sunday-00_010600_1..S03R",
        )
        .unwrap();
        store.insert_alternate_ids(&rows).await.unwrap();

        let found = store
            .alternate_trip_ids(TransitSystem::NycMta, "010600_1..S", ServiceDay::Sunday)
            .await
            .unwrap();
        assert_eq!(found, vec!["AFA19GEN-1037-Sunday-00_010600_1..S03R".to_string()]);

        let found = store
            .alternate_trip_ids(TransitSystem::NycMta, "010600_1..S", ServiceDay::Weekday)
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
