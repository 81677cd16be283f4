//! Local mirror of imported records.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use parlsync_core::{weeks_in_window, FilterSet, MappedRecord, RecordKind, WeeklyCount};
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migration(String),
}

impl StoreError {
    /// Connection-level failures that are worth replaying once.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
            ),
            _ => false,
        }
    }

    fn classify(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if matches!(
                db_err.kind(),
                ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation
            ) {
                return StoreError::Integrity(db_err.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

/// Transactional sink for mapped records plus the per-period count query used by reconciliation.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upserts every record of the batch (children included) in one transaction.
    /// Returns the number of top-level records committed.
    async fn upsert_batch(&self, records: &[MappedRecord]) -> Result<usize, StoreError>;

    /// Local record counts per Monday-aligned week of `[start, end]`, restricted by `filters`.
    async fn count_per_period(
        &self,
        kind: RecordKind,
        start: NaiveDate,
        end: NaiveDate,
        filters: &FilterSet,
    ) -> Result<Vec<WeeklyCount>, StoreError>;
}

fn align_to_weeks(start: NaiveDate, end: NaiveDate, counts: &HashMap<NaiveDate, u64>) -> Vec<WeeklyCount> {
    weeks_in_window(start, end)
        .into_iter()
        .map(|week| WeeklyCount::new(week, counts.get(&week.start).copied().unwrap_or(0)))
        .collect()
}

fn matches_filters(record: &MappedRecord, filters: &FilterSet) -> bool {
    let type_ok = filters.document_types.is_empty()
        || record
            .type_tag
            .as_ref()
            .is_some_and(|tag| filters.document_types.contains(tag));
    let process_ok = filters.process_types.is_empty()
        || record.tags.iter().any(|tag| filters.process_types.contains(tag));
    type_ok && process_ok
}

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One connection: the importer is the single writer.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Migration(err.to_string()))?;
        info!("migrations applied");
        Ok(())
    }

    async fn write_batch(tx: &mut Transaction<'_, Postgres>, records: &[MappedRecord]) -> Result<(), sqlx::Error> {
        for record in records {
            for (parent, entry) in record.walk() {
                sqlx::query(
                    r#"
                    INSERT INTO records (kind, id, period_date, type_tag, tags, updated_at, payload, imported_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                    ON CONFLICT (kind, id) DO UPDATE SET
                        period_date = EXCLUDED.period_date,
                        type_tag = EXCLUDED.type_tag,
                        tags = EXCLUDED.tags,
                        updated_at = EXCLUDED.updated_at,
                        payload = EXCLUDED.payload,
                        imported_at = NOW()
                    "#,
                )
                .bind(entry.kind.as_str())
                .bind(entry.id)
                .bind(entry.period_date)
                .bind(entry.type_tag.as_deref())
                .bind(&entry.tags)
                .bind(entry.updated_at)
                .bind(&entry.payload)
                .execute(&mut **tx)
                .await?;

                if let Some((parent_kind, parent_id)) = parent {
                    sqlx::query(
                        r#"
                        INSERT INTO record_links (parent_kind, parent_id, child_kind, child_id)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(parent_kind.as_str())
                    .bind(parent_id)
                    .bind(entry.kind.as_str())
                    .bind(entry.id)
                    .execute(&mut **tx)
                    .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_batch(&self, records: &[MappedRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::classify)?;
        if let Err(err) = Self::write_batch(&mut tx, records).await {
            let _ = tx.rollback().await;
            return Err(StoreError::classify(err));
        }
        tx.commit().await.map_err(StoreError::classify)?;
        debug!(records = records.len(), "batch committed");
        Ok(records.len())
    }

    async fn count_per_period(
        &self,
        kind: RecordKind,
        start: NaiveDate,
        end: NaiveDate,
        filters: &FilterSet,
    ) -> Result<Vec<WeeklyCount>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT GREATEST(date_trunc('week', period_date)::date, $2::date) AS period_start,
                   COUNT(*) AS record_count
            FROM records
            WHERE kind = $1
              AND period_date BETWEEN $2 AND $3
              AND (cardinality($4::text[]) = 0 OR type_tag = ANY($4))
              AND (cardinality($5::text[]) = 0 OR tags && $5)
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(kind.as_str())
        .bind(start)
        .bind(end)
        .bind(&filters.document_types)
        .bind(&filters.process_types)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::classify)?;

        let mut counts = HashMap::new();
        for row in rows {
            let period_start: NaiveDate = row.try_get("period_start")?;
            let count: i64 = row.try_get("record_count")?;
            counts.insert(period_start, u64::try_from(count).unwrap_or_default());
        }
        Ok(align_to_weeks(start, end, &counts))
    }
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<(RecordKind, i64), MappedRecord>,
    links: BTreeSet<((RecordKind, i64), (RecordKind, i64))>,
    commits: usize,
}

/// In-process store for dry runs and tests. Batches are applied all-or-nothing.
#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
    fail_ids: HashSet<i64>,
    transient_failures: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any batch containing one of these ids fails with an integrity violation.
    pub fn with_failing_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.fail_ids.extend(ids);
        self
    }

    /// The next `n` upserts fail with a connection-level error.
    pub fn with_transient_failures(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_kind(&self, kind: RecordKind) -> usize {
        self.lock().records.keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn get(&self, kind: RecordKind, id: i64) -> Option<MappedRecord> {
        self.lock().records.get(&(kind, id)).cloned()
    }

    pub fn links(&self) -> Vec<((RecordKind, i64), (RecordKind, i64))> {
        self.lock().links.iter().copied().collect()
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    /// Inserts records directly, bypassing failure injection.
    pub fn seed(&self, records: impl IntoIterator<Item = MappedRecord>) {
        let mut state = self.lock();
        for record in records {
            state.records.insert(record.key(), record);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_batch(&self, records: &[MappedRecord]) -> Result<usize, StoreError> {
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection reset".into()));
        }

        let mut rows = Vec::new();
        let mut links = Vec::new();
        for record in records {
            for (parent, entry) in record.walk() {
                if self.fail_ids.contains(&entry.id) {
                    return Err(StoreError::Integrity(format!(
                        "record {}/{} violates a constraint",
                        entry.kind, entry.id
                    )));
                }
                let mut row = entry.clone();
                row.children.clear();
                rows.push(row);
                if let Some(parent) = parent {
                    links.push((parent, entry.key()));
                }
            }
        }

        let mut state = self.lock();
        for row in rows {
            state.records.insert(row.key(), row);
        }
        state.links.extend(links);
        state.commits += 1;
        Ok(records.len())
    }

    async fn count_per_period(
        &self,
        kind: RecordKind,
        start: NaiveDate,
        end: NaiveDate,
        filters: &FilterSet,
    ) -> Result<Vec<WeeklyCount>, StoreError> {
        let weeks = weeks_in_window(start, end);
        let mut counts: HashMap<NaiveDate, u64> = HashMap::new();
        let state = self.lock();
        for record in state.records.values() {
            if record.kind != kind || !matches_filters(record, filters) {
                continue;
            }
            let Some(date) = record.period_date else {
                continue;
            };
            if let Some(week) = weeks.iter().find(|week| week.contains(date)) {
                *counts.entry(week.start).or_default() += 1;
            }
        }
        Ok(align_to_weeks(start, end, &counts))
    }
}
