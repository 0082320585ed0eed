//! Job persistence: the total-replace upsert engine and read queries.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use geojobs_core::{
    AreaCount, AreaLevel, Job, JobFilters, JobProjection, JobStats, QueryError, QueryParam,
    SpatialQuery, TableRef, SRID,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Rows per multi-row upsert statement (20 binds each, well under the 65535 cap).
pub const BATCH_CHUNK_ROWS: usize = 1000;

/// Persisted columns in bind order; `location` is derived from `lon`/`lat`.
const COLUMNS: [&str; 20] = [
    "job_id",
    "source_id",
    "title",
    "company",
    "occupation",
    "employment_type",
    "work_time_extent",
    "duration",
    "positions",
    "unspecified_workplace",
    "municipality",
    "region",
    "city",
    "street_address",
    "postal_code",
    "published_at",
    "last_application_at",
    "expiration_at",
    "lon",
    "lat",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub failed: Vec<(i64, String)>,
}

impl BatchOutcome {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }

    pub fn upserted(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence engine unavailable: {0}")]
    Unavailable(String),
    #[error("job {job_id} rejected: {message}")]
    Rejected { job_id: i64, message: String },
    #[error("query failed: {0}")]
    Query(String),
    #[error(transparent)]
    InvalidQuery(#[from] QueryError),
}

impl StoreError {
    /// Connection-level failures; everything else is confined to one statement.
    pub fn from_sqlx(err: sqlx::Error, job_id: Option<i64>) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
            other => match job_id {
                Some(job_id) => StoreError::Rejected {
                    job_id,
                    message: other.to_string(),
                },
                None => StoreError::Query(other.to_string()),
            },
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Write side. The only component that mutates persisted jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomic insert-or-replace keyed by `job_id`; every column is overwritten.
    async fn upsert(&self, job: &Job) -> Result<UpsertOutcome, StoreError>;

    /// Per-record rejections land in [`BatchOutcome::failed`]; only an outage
    /// is returned as `Err`.
    async fn upsert_batch(&self, jobs: &[Job]) -> Result<BatchOutcome, StoreError>;
}

#[async_trait]
pub trait JobReader: Send + Sync {
    async fn query(&self, filters: &JobFilters) -> Result<Vec<JobProjection>, StoreError>;
    async fn stats(&self) -> Result<JobStats, StoreError>;
    async fn top_areas(&self, level: AreaLevel, limit: u32) -> Result<Vec<AreaCount>, StoreError>;
}

/// Last occurrence of each key, kept at its original position.
fn last_occurrence_per_key(jobs: &[Job]) -> Vec<&Job> {
    let mut seen = HashSet::new();
    let mut kept: Vec<&Job> = jobs
        .iter()
        .rev()
        .filter(|job| seen.insert(job.job_id))
        .collect();
    kept.reverse();
    kept
}

/// Multi-row and single-row writes behind [`write_in_chunks`].
#[async_trait]
trait ChunkWriter: Sync {
    async fn write_chunk(&self, jobs: &[&Job]) -> Result<Vec<UpsertOutcome>, StoreError>;
    async fn write_one(&self, job: &Job) -> Result<UpsertOutcome, StoreError>;
}

/// Writes `jobs` in chunks; a rejected chunk is replayed row by row so only
/// the offending rows end up in [`BatchOutcome::failed`]. An outage aborts.
async fn write_in_chunks<W: ChunkWriter + ?Sized>(
    writer: &W,
    jobs: &[Job],
    chunk_rows: usize,
) -> Result<BatchOutcome, StoreError> {
    let jobs = last_occurrence_per_key(jobs);
    let mut outcome = BatchOutcome::default();
    for chunk in jobs.chunks(chunk_rows.max(1)) {
        match writer.write_chunk(chunk).await {
            Ok(results) => results.into_iter().for_each(|r| outcome.record(r)),
            Err(err) if err.is_unavailable() => return Err(err),
            Err(err) => {
                warn!(rows = chunk.len(), error = %err, "batch chunk rejected; retrying row by row");
                for job in chunk {
                    match writer.write_one(job).await {
                        Ok(r) => outcome.record(r),
                        Err(e) if e.is_unavailable() => return Err(e),
                        Err(e) => {
                            warn!(job_id = job.job_id, error = %e, "upsert failed");
                            outcome.failed.push((job.job_id, e.to_string()));
                        }
                    }
                }
            }
        }
    }
    Ok(outcome)
}

pub fn schema_statements(table: &TableRef) -> Vec<String> {
    let quoted_index = |suffix: &str| format!("\"{}\"", table.index_name(suffix));
    let mut statements = vec![
        "CREATE EXTENSION IF NOT EXISTS postgis".to_string(),
        format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", table.schema()),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {table} (
    job_id BIGINT PRIMARY KEY,
    source_id BIGINT,
    title TEXT,
    company TEXT,
    occupation TEXT,
    employment_type TEXT,
    work_time_extent TEXT,
    duration TEXT,
    positions INTEGER,
    unspecified_workplace BOOLEAN NOT NULL DEFAULT FALSE,
    municipality TEXT,
    region TEXT,
    city TEXT,
    street_address TEXT,
    postal_code TEXT,
    published_at TIMESTAMP NULL,
    last_application_at TIMESTAMP NULL,
    expiration_at TIMESTAMP NULL,
    lon DOUBLE PRECISION CHECK (lon BETWEEN -180 AND 180),
    lat DOUBLE PRECISION CHECK (lat BETWEEN -90 AND 90),
    location geometry(Point, {SRID}),
    CONSTRAINT location_matches_coordinates
        CHECK ((location IS NOT NULL) = (lon IS NOT NULL AND lat IS NOT NULL))
)"#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} USING GIST (location)",
            quoted_index("location")
        ),
    ];
    for column in ["municipality", "region", "occupation"] {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} ({column})",
            quoted_index(column)
        ));
    }
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {} ON {table} (published_at)",
        quoted_index("published")
    ));
    statements
}

/// One `INSERT ... ON CONFLICT DO UPDATE` for all rows; the geometry is built
/// in the same statement from the bound coordinates.
pub fn upsert_statement<'a>(table: &TableRef, jobs: &[&'a Job]) -> QueryBuilder<'a, Postgres> {
    let columns = COLUMNS.join(", ");
    let selected = COLUMNS
        .iter()
        .map(|c| format!("v.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {table} ({columns}, location) SELECT {selected}, \
         CASE WHEN v.lon IS NOT NULL AND v.lat IS NOT NULL \
         THEN ST_SetSRID(ST_MakePoint(v.lon, v.lat), {SRID}) ELSE NULL END FROM ("
    ));
    qb.push_values(jobs.iter().copied(), |mut row, job| {
        let location = job.normalized_location();
        row.push_bind(job.job_id)
            .push_bind(job.source_id)
            .push_bind(job.title.clone())
            .push_bind(job.company.clone())
            .push_bind(job.occupation.clone())
            .push_bind(job.employment_type.clone())
            .push_bind(job.work_time_extent.clone())
            .push_bind(job.duration.clone())
            .push_bind(job.positions)
            .push_bind(job.unspecified_workplace)
            .push_bind(job.municipality.clone())
            .push_bind(job.region.clone())
            .push_bind(job.city.clone())
            .push_bind(job.street_address.clone())
            .push_bind(job.postal_code.clone())
            .push_bind(job.published_at)
            .push_bind(job.last_application_at)
            .push_bind(job.expiration_at)
            .push_bind(location.map(|p| p.lon))
            .push_bind(location.map(|p| p.lat));
    });
    let updates = COLUMNS
        .iter()
        .skip(1)
        .chain(std::iter::once(&"location"))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    qb.push(format!(
        ") AS v ({columns}) ON CONFLICT (job_id) DO UPDATE SET {updates} \
         RETURNING (xmax = 0) AS inserted"
    ));
    qb
}

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
    table: TableRef,
}

impl PgJobStore {
    pub fn new(pool: PgPool, table: TableRef) -> Self {
        Self { pool, table }
    }

    pub async fn connect(
        database_url: &str,
        acquire_timeout: Duration,
        table: TableRef,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool, table))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Creates the PostGIS extension, table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in schema_statements(&self.table) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx(e, None))?;
        }
        info!(table = %self.table, "schema ready");
        Ok(())
    }

    pub async fn postgis_version(&self) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar::<_, Option<String>>("SELECT postgis_full_version()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, None))
    }

    async fn write_rows(&self, jobs: &[&Job]) -> Result<Vec<UpsertOutcome>, sqlx::Error> {
        let mut qb = upsert_statement(&self.table, jobs);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let inserted: bool = row.try_get("inserted")?;
                Ok(if inserted {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Updated
                })
            })
            .collect()
    }
}

fn projection_from_row(row: &PgRow) -> Result<JobProjection, sqlx::Error> {
    Ok(JobProjection {
        job_id: row.try_get("job_id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        occupation: row.try_get("occupation")?,
        municipality: row.try_get("municipality")?,
        region: row.try_get("region")?,
        city: row.try_get("city")?,
        published_at: row.try_get("published_at")?,
        lat: row.try_get("lat")?,
        lon: row.try_get("lon")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn upsert(&self, job: &Job) -> Result<UpsertOutcome, StoreError> {
        let outcomes = self
            .write_rows(&[job])
            .await
            .map_err(|e| StoreError::from_sqlx(e, Some(job.job_id)))?;
        outcomes.into_iter().next().ok_or_else(|| StoreError::Rejected {
            job_id: job.job_id,
            message: "upsert returned no row".to_string(),
        })
    }

    async fn upsert_batch(&self, jobs: &[Job]) -> Result<BatchOutcome, StoreError> {
        write_in_chunks(self, jobs, BATCH_CHUNK_ROWS).await
    }
}

#[async_trait]
impl ChunkWriter for PgJobStore {
    async fn write_chunk(&self, jobs: &[&Job]) -> Result<Vec<UpsertOutcome>, StoreError> {
        self.write_rows(jobs)
            .await
            .map_err(|e| StoreError::from_sqlx(e, None))
    }

    async fn write_one(&self, job: &Job) -> Result<UpsertOutcome, StoreError> {
        self.upsert(job).await
    }
}

#[async_trait]
impl JobReader for PgJobStore {
    async fn query(&self, filters: &JobFilters) -> Result<Vec<JobProjection>, StoreError> {
        let (sql, params) = SpatialQuery::build(&self.table, filters)?.to_sql();
        let mut query = sqlx::query(&sql);
        for param in params {
            query = match param {
                QueryParam::Text(v) => query.bind(v),
                QueryParam::TextList(v) => query.bind(v),
                QueryParam::Float(v) => query.bind(v),
                QueryParam::Int(v) => query.bind(v),
            };
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, None))?;
        rows.iter()
            .map(projection_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::from_sqlx(e, None))
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS total, COUNT(location) AS with_location FROM {}",
            self.table
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, None))?;
        Ok(JobStats {
            total: row.try_get("total").map_err(|e| StoreError::from_sqlx(e, None))?,
            with_location: row
                .try_get("with_location")
                .map_err(|e| StoreError::from_sqlx(e, None))?,
        })
    }

    async fn top_areas(&self, level: AreaLevel, limit: u32) -> Result<Vec<AreaCount>, StoreError> {
        let column = level.column();
        let rows = sqlx::query(&format!(
            "SELECT {column} AS area, COUNT(*) AS c FROM {} \
             WHERE {column} IS NOT NULL AND {column} <> '' \
             GROUP BY {column} ORDER BY c DESC, {column} ASC LIMIT $1",
            self.table
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, None))?;
        rows.iter()
            .map(|row| {
                Ok(AreaCount {
                    area: row.try_get("area")?,
                    count: row.try_get("c")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(|e| StoreError::from_sqlx(e, None))
    }
}

/// In-process store with the same semantics, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    rows: Mutex<BTreeMap<i64, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: i64) -> Option<Job> {
        self.rows.lock().await.get(&job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, job: &Job) -> Result<UpsertOutcome, StoreError> {
        let stored = Job {
            coordinates: job.normalized_location(),
            ..job.clone()
        };
        let previous = self.rows.lock().await.insert(job.job_id, stored);
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn upsert_batch(&self, jobs: &[Job]) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        for job in last_occurrence_per_key(jobs) {
            outcome.record(self.upsert(job).await?);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl JobReader for MemoryJobStore {
    async fn query(&self, filters: &JobFilters) -> Result<Vec<JobProjection>, StoreError> {
        if filters.limit == 0 {
            return Err(QueryError::ZeroLimit.into());
        }
        let rows = self.rows.lock().await;
        Ok(filters.apply(rows.values()))
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = self.rows.lock().await;
        Ok(JobStats {
            total: rows.len() as i64,
            with_location: rows.values().filter(|j| j.coordinates.is_some()).count() as i64,
        })
    }

    async fn top_areas(&self, level: AreaLevel, limit: u32) -> Result<Vec<AreaCount>, StoreError> {
        let rows = self.rows.lock().await;
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for job in rows.values() {
            let value = match level {
                AreaLevel::Municipality => job.municipality.as_deref(),
                AreaLevel::Region => job.region.as_deref(),
            };
            if let Some(area) = value.filter(|a| !a.is_empty()) {
                *counts.entry(area.to_string()).or_default() += 1;
            }
        }
        let mut areas: Vec<AreaCount> = counts
            .into_iter()
            .map(|(area, count)| AreaCount { area, count })
            .collect();
        areas.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.area.cmp(&b.area)));
        areas.truncate(limit as usize);
        Ok(areas)
    }
}
