//! Ingestion orchestration: environment config, the incremental API fetch,
//! the bulk tabular load and the optional cron schedule.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use geojobs_adapters::{
    map_record, AdapterError, JobApi, MapError, PlatsbankenApi, SearchTemplate, SourceSchema,
    TabularExport, DEFAULT_DETAIL_URL, DEFAULT_SEARCH_URL,
};
use geojobs_core::{InvalidIdentifier, Job, TableRef};
use geojobs_storage::{
    HttpClientConfig, HttpFetcher, JobStore, PgJobStore, StoreError, UpsertOutcome,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "geojobs-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PG_DATABASE_URL is not set (DATABASE_URL is also accepted)")]
    MissingDatabaseUrl,
    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),
    #[error("{key} must be a number, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub table: TableRef,
    pub search_url: String,
    pub detail_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub db_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &'static str, default: u64| match var(key) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidNumber { key, value }),
            None => Ok(default),
        };

        let database_url = var("PG_DATABASE_URL")
            .or_else(|| var("DATABASE_URL"))
            .ok_or(ConfigError::MissingDatabaseUrl)?;
        let table = TableRef::new(
            &var("GEOJOBS_SCHEMA").unwrap_or_else(|| "public".to_string()),
            &var("GEOJOBS_TABLE").unwrap_or_else(|| "jobs".to_string()),
        )?;
        let web_port = number("GEOJOBS_WEB_PORT", 8000)?;

        Ok(Self {
            database_url,
            table,
            search_url: var("GEOJOBS_SEARCH_URL").unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            detail_url: var("GEOJOBS_DETAIL_URL").unwrap_or_else(|| DEFAULT_DETAIL_URL.to_string()),
            user_agent: var("GEOJOBS_USER_AGENT").unwrap_or_else(|| "geojobs/0.1".to_string()),
            http_timeout_secs: number("GEOJOBS_HTTP_TIMEOUT_SECS", 30)?,
            db_timeout_secs: number("GEOJOBS_DB_TIMEOUT_SECS", 30)?,
            scheduler_enabled: var("GEOJOBS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("GEOJOBS_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            web_port: u16::try_from(web_port).map_err(|_| ConfigError::InvalidNumber {
                key: "GEOJOBS_WEB_PORT",
                value: web_port.to_string(),
            })?,
        })
    }

    pub fn with_table(mut self, table: TableRef) -> Self {
        self.table = table;
        self
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub async fn connect_store(&self) -> Result<PgJobStore> {
        PgJobStore::connect(
            &self.database_url,
            Duration::from_secs(self.db_timeout_secs),
            self.table.clone(),
        )
        .await
        .with_context(|| format!("opening job store for {}", self.table))
    }

    pub fn job_api(&self) -> Result<PlatsbankenApi> {
        let http = HttpFetcher::new(self.http_client_config())?;
        Ok(PlatsbankenApi::new(
            http,
            self.search_url.clone(),
            self.detail_url.clone(),
        ))
    }
}

/// Collapses records sharing a `job_id` to the most recently published one.
///
/// Input is stable-sorted by `published_at` (missing timestamps first) and the
/// last record per key wins, so equal or missing timestamps fall back to input
/// order. Output is keyed by `job_id`.
pub fn dedupe_latest(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by_key(|job| job.published_at);
    let mut latest = BTreeMap::new();
    for job in jobs {
        latest.insert(job.job_id, job);
    }
    latest.into_values().collect()
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub pages: u32,
    pub page_size: u32,
    pub delay: Duration,
    pub start_index: u32,
    pub template: SearchTemplate,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            pages: 5,
            page_size: 25,
            delay: Duration::from_millis(500),
            start_index: 0,
            template: SearchTemplate::for_occupation_field(None),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub job_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub page_failures: u32,
    pub summaries_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub not_found: usize,
    pub failures: Vec<ItemFailure>,
}

impl FetchRunSummary {
    pub fn upserted(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Error)]
enum ItemError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pages through the remote search and upserts each detail record as it
/// arrives. One item failing never stops the run; a store outage does.
pub struct IncrementalFetcher {
    api: Arc<dyn JobApi>,
    store: Arc<dyn JobStore>,
    options: FetchOptions,
}

impl IncrementalFetcher {
    pub fn new(api: Arc<dyn JobApi>, store: Arc<dyn JobStore>, options: FetchOptions) -> Self {
        Self { api, store, options }
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    pub async fn run(&self) -> Result<FetchRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("incremental_fetch", %run_id);
        self.run_pages(run_id).instrument(span).await
    }

    async fn run_pages(&self, run_id: Uuid) -> Result<FetchRunSummary> {
        let mut summary = FetchRunSummary {
            run_id,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            pages_fetched: 0,
            page_failures: 0,
            summaries_seen: 0,
            inserted: 0,
            updated: 0,
            not_found: 0,
            failures: Vec::new(),
        };

        let mut start_index = self.options.start_index;
        for _ in 0..self.options.pages {
            let payload = self.options.template.page(start_index, self.options.page_size);
            let page = match self.api.search(&payload).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(start_index, error = %err, "search page failed");
                    summary.page_failures += 1;
                    start_index = start_index.saturating_add(self.options.page_size);
                    self.pause().await;
                    continue;
                }
            };
            summary.pages_fetched += 1;
            if page.ads.is_empty() {
                info!(start_index, "search exhausted");
                break;
            }

            for ad in page.ads {
                summary.summaries_seen += 1;
                let Some(job_id) = ad.id else {
                    warn!(start_index, "search result without an id");
                    summary.failures.push(ItemFailure {
                        job_id: String::new(),
                        error: "search result without an id".to_string(),
                    });
                    continue;
                };

                match self.ingest_one(&job_id).await {
                    Ok(Some(UpsertOutcome::Inserted)) => summary.inserted += 1,
                    Ok(Some(UpsertOutcome::Updated)) => summary.updated += 1,
                    Ok(None) => {
                        info!(job_id = %job_id, "listed job no longer available, skipping");
                        summary.not_found += 1;
                    }
                    Err(ItemError::Store(err)) if err.is_unavailable() => {
                        return Err(err).with_context(|| {
                            format!("job store unavailable while writing job {job_id}")
                        });
                    }
                    Err(err) => {
                        warn!(job_id = %job_id, error = %err, "job ingestion failed");
                        summary.failures.push(ItemFailure {
                            job_id,
                            error: err.to_string(),
                        });
                    }
                }
                self.pause().await;
            }

            start_index = start_index.saturating_add(self.options.page_size);
            self.pause().await;
        }

        summary.finished_at = Utc::now();
        info!(
            pages = summary.pages_fetched,
            upserted = summary.upserted(),
            not_found = summary.not_found,
            failed = summary.failures.len(),
            "incremental fetch finished"
        );
        Ok(summary)
    }

    async fn ingest_one(&self, job_id: &str) -> Result<Option<UpsertOutcome>, ItemError> {
        let Some(detail) = self.api.fetch_detail(job_id).await? else {
            return Ok(None);
        };
        let job = map_record(&detail, SourceSchema::ApiDetail)?;
        Ok(Some(self.store.upsert(&job).await?))
    }

    async fn pause(&self) {
        if !self.options.delay.is_zero() {
            tokio::time::sleep(self.options.delay).await;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BulkLoadOptions {
    /// Only the first N data rows.
    pub sample: Option<usize>,
    /// Drop rows whose coordinates did not survive normalization.
    pub require_location: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkLoadSummary {
    pub run_id: Uuid,
    pub rows_read: usize,
    pub rejected: usize,
    pub without_location: usize,
    pub duplicates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: Vec<(i64, String)>,
}

impl BulkLoadSummary {
    pub fn upserted(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Maps, deduplicates and batch-upserts a whole tabular export.
pub struct BulkLoader {
    store: Arc<dyn JobStore>,
    options: BulkLoadOptions,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn JobStore>, options: BulkLoadOptions) -> Self {
        Self { store, options }
    }

    pub async fn load_path(&self, path: impl AsRef<Path>) -> Result<BulkLoadSummary> {
        let export = TabularExport::from_path(path)?;
        self.load(&export).await
    }

    pub async fn load(&self, export: &TabularExport) -> Result<BulkLoadSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("bulk_load", %run_id);
        async move {
            let limit = self.options.sample.unwrap_or(usize::MAX);
            let mut rows_read = 0usize;
            let mut rejected = 0usize;
            let mut without_location = 0usize;
            let mut mapped = Vec::new();

            for (line, row) in export.rows().take(limit).enumerate() {
                rows_read += 1;
                match map_record(&row, SourceSchema::TabularExport) {
                    Ok(job) if self.options.require_location && job.coordinates.is_none() => {
                        without_location += 1;
                    }
                    Ok(job) => mapped.push(job),
                    Err(err) => {
                        // +2: header line and 1-based numbering.
                        warn!(line = line + 2, error = %err, "row rejected");
                        rejected += 1;
                    }
                }
            }

            let before_dedup = mapped.len();
            let survivors = dedupe_latest(mapped);
            let duplicates = before_dedup - survivors.len();
            info!(rows_read, rejected, without_location, duplicates, to_load = survivors.len(), "export mapped");

            let outcome = self
                .store
                .upsert_batch(&survivors)
                .await
                .context("writing tabular export")?;
            for (job_id, message) in &outcome.failed {
                warn!(job_id, error = %message, "job rejected by store");
            }
            info!(inserted = outcome.inserted, updated = outcome.updated, failed = outcome.failed.len(), "bulk load finished");

            Ok(BulkLoadSummary {
                run_id,
                rows_read,
                rejected,
                without_location,
                duplicates,
                inserted: outcome.inserted,
                updated: outcome.updated,
                failed: outcome.failed,
            })
        }
        .instrument(span)
        .await
    }
}

/// Registers the incremental fetch on `config.sync_cron` when scheduling is enabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    fetcher: Arc<IncrementalFetcher>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = CronJob::new_async(cron, move |_uuid, _l| {
        let fetcher = fetcher.clone();
        Box::pin(async move {
            match fetcher.run().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    upserted = summary.upserted(),
                    "scheduled fetch complete"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled fetch aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use geojobs_adapters::{JobSummary, SearchPage};
    use geojobs_storage::{BatchOutcome, FetchError, MemoryJobStore};
    use serde_json::{json, Value as JsonValue};
    use std::collections::HashMap;
    use std::io::Write;
    use tokio::sync::Mutex;

    fn day(y: i32, m: u32, d: u32) -> Option<chrono::NaiveDateTime> {
        NaiveDate::from_ymd_opt(y, m, d).and_then(|d| d.and_hms_opt(0, 0, 0))
    }

    fn job(job_id: i64, title: &str, published_at: Option<chrono::NaiveDateTime>) -> Job {
        Job {
            title: Some(title.to_string()),
            published_at,
            ..Job::new(job_id)
        }
    }

    fn detail(id: &str) -> JsonValue {
        json!({
            "id": id,
            "title": format!("Job {id}"),
            "publishedDate": "2024-05-01T10:00:00",
            "workplace": {"municipality": "Solna", "longitude": 18.0, "latitude": 59.36}
        })
    }

    /// Pages are served in order; detail ids absent from `details` are 404s
    /// and ids listed in `broken` fail with a server error.
    #[derive(Default)]
    struct ScriptedApi {
        pages: Vec<Vec<&'static str>>,
        details: HashMap<String, JsonValue>,
        broken: Vec<&'static str>,
        searches: Mutex<Vec<JsonValue>>,
    }

    impl ScriptedApi {
        fn with_pages(pages: Vec<Vec<&'static str>>) -> Self {
            let details = pages
                .iter()
                .flatten()
                .map(|id| (id.to_string(), detail(id)))
                .collect();
            Self {
                pages,
                details,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl JobApi for ScriptedApi {
        async fn search(&self, payload: &JsonValue) -> Result<SearchPage, AdapterError> {
            let mut searches = self.searches.lock().await;
            let ads = self
                .pages
                .get(searches.len())
                .map(|ids| {
                    ids.iter()
                        .map(|id| JobSummary { id: Some(id.to_string()) })
                        .collect()
                })
                .unwrap_or_default();
            searches.push(payload.clone());
            Ok(SearchPage { ads })
        }

        async fn fetch_detail(&self, job_id: &str) -> Result<Option<JsonValue>, AdapterError> {
            if self.broken.iter().any(|b| *b == job_id) {
                return Err(FetchError::HttpStatus {
                    status: 502,
                    url: format!("mock://job/{job_id}"),
                }
                .into());
            }
            Ok(self.details.get(job_id).cloned())
        }
    }

    struct DownStore;

    #[async_trait]
    impl JobStore for DownStore {
        async fn upsert(&self, _job: &Job) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }

        async fn upsert_batch(&self, _jobs: &[Job]) -> Result<BatchOutcome, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }
    }

    fn fast_options() -> FetchOptions {
        FetchOptions {
            pages: 5,
            page_size: 2,
            delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn sample_csv() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/tabular/job_details_sample.csv")
    }

    #[test]
    fn latest_publication_wins() {
        let survivors = dedupe_latest(vec![
            job(42, "newer", day(2024, 6, 1)),
            job(42, "older", day(2024, 1, 1)),
            job(7, "other", None),
        ]);
        assert_eq!(survivors.len(), 2);
        let kept = survivors.iter().find(|j| j.job_id == 42).unwrap();
        assert_eq!(kept.title.as_deref(), Some("newer"));
    }

    #[test]
    fn equal_or_missing_timestamps_keep_the_later_input() {
        let same_day = dedupe_latest(vec![
            job(42, "first", day(2024, 3, 1)),
            job(42, "second", day(2024, 3, 1)),
        ]);
        assert_eq!(same_day[0].title.as_deref(), Some("second"));

        let undated = dedupe_latest(vec![job(42, "first", None), job(42, "second", None)]);
        assert_eq!(undated[0].title.as_deref(), Some("second"));

        let dated_beats_undated = dedupe_latest(vec![job(42, "dated", day(2020, 1, 1)), job(42, "undated", None)]);
        assert_eq!(dated_beats_undated[0].title.as_deref(), Some("dated"));
    }

    #[tokio::test]
    async fn fetch_stops_on_first_empty_page() {
        let api = Arc::new(ScriptedApi::with_pages(vec![vec!["1", "2"], vec!["3"], vec![], vec!["4"]]));
        let store = Arc::new(MemoryJobStore::new());
        let fetcher = IncrementalFetcher::new(api.clone(), store.clone(), fast_options());

        let summary = fetcher.run().await.unwrap();
        assert_eq!(summary.pages_fetched, 3);
        assert_eq!(summary.inserted, 3);
        assert_eq!(store.len().await, 3);
        assert!(store.get(4).await.is_none());

        let searches = api.searches.lock().await;
        let offsets: Vec<_> = searches.iter().map(|p| p["startIndex"].clone()).collect();
        assert_eq!(offsets, vec![json!(0), json!(2), json!(4)]);
        assert!(searches.iter().all(|p| p["maxRecords"] == 2));
    }

    #[tokio::test]
    async fn page_count_bounds_the_run() {
        let api = Arc::new(ScriptedApi::with_pages(vec![vec!["1"], vec!["2"], vec!["3"]]));
        let store = Arc::new(MemoryJobStore::new());
        let options = FetchOptions {
            pages: 2,
            start_index: 10,
            ..fast_options()
        };
        let summary = IncrementalFetcher::new(api.clone(), store.clone(), options).run().await.unwrap();
        assert_eq!(summary.pages_fetched, 2);
        assert_eq!(store.len().await, 2);
        assert_eq!(api.searches.lock().await[0]["startIndex"], 10);
    }

    #[tokio::test]
    async fn missing_details_are_skipped_and_failures_isolated() {
        let mut api = ScriptedApi::with_pages(vec![vec!["1", "2", "3", "bad"]]);
        api.details.remove("2");
        api.broken.push("3");
        api.details.insert("bad".into(), json!({"id": "not-numeric", "title": "x"}));
        let store = Arc::new(MemoryJobStore::new());

        let summary = IncrementalFetcher::new(Arc::new(api), store.clone(), fast_options())
            .run()
            .await
            .unwrap();
        assert_eq!(summary.summaries_seen, 4);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.not_found, 1);
        let failed: Vec<_> = summary.failures.iter().map(|f| f.job_id.as_str()).collect();
        assert_eq!(failed, vec!["3", "bad"]);
        assert!(store.get(1).await.is_some());
    }

    #[tokio::test]
    async fn refetching_updates_in_place() {
        let store = Arc::new(MemoryJobStore::new());
        for expected_updates in [0, 2] {
            let api = Arc::new(ScriptedApi::with_pages(vec![vec!["1", "2"]]));
            let summary = IncrementalFetcher::new(api, store.clone(), fast_options()).run().await.unwrap();
            assert_eq!(summary.updated, expected_updates);
        }
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn store_outage_aborts_the_run() {
        let api = Arc::new(ScriptedApi::with_pages(vec![vec!["1", "2"]]));
        let err = IncrementalFetcher::new(api, Arc::new(DownStore), fast_options())
            .run()
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("unavailable"), "{err:#}");
    }

    #[tokio::test]
    async fn bulk_load_dedupes_and_rejects() {
        let store = Arc::new(MemoryJobStore::new());
        let summary = BulkLoader::new(store.clone(), BulkLoadOptions::default())
            .load_path(sample_csv())
            .await
            .unwrap();

        assert_eq!(summary.rows_read, 6);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.inserted, 4);
        assert!(summary.failed.is_empty());

        let kept = store.get(24000001).await.unwrap();
        assert_eq!(kept.title.as_deref(), Some("Lagerarbetare (ny)"));
        let unplaced = store.get(24000003).await.unwrap();
        assert_eq!(unplaced.coordinates, None);
        assert_eq!(unplaced.municipality.as_deref(), Some("Malmö"));
    }

    #[tokio::test]
    async fn bulk_load_options_limit_rows() {
        let store = Arc::new(MemoryJobStore::new());
        let summary = BulkLoader::new(
            store.clone(),
            BulkLoadOptions {
                sample: None,
                require_location: true,
            },
        )
        .load_path(sample_csv())
        .await
        .unwrap();
        assert_eq!(summary.without_location, 1);
        assert_eq!(store.len().await, 3);

        let sampled = Arc::new(MemoryJobStore::new());
        let summary = BulkLoader::new(
            sampled.clone(),
            BulkLoadOptions {
                sample: Some(2),
                require_location: false,
            },
        )
        .load_path(sample_csv())
        .await
        .unwrap();
        assert_eq!(summary.rows_read, 2);
        assert_eq!(sampled.len().await, 2);
    }

    #[tokio::test]
    async fn reloading_an_export_is_idempotent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "job_id,title,published_date,workplace_longitude,workplace_latitude").unwrap();
        writeln!(file, "10,a,2024-01-01,18.0,59.0").unwrap();
        writeln!(file, "11,b,,,").unwrap();

        let store = Arc::new(MemoryJobStore::new());
        let loader = BulkLoader::new(store.clone(), BulkLoadOptions::default());
        let first = loader.load_path(file.path()).await.unwrap();
        let second = loader.load_path(file.path()).await.unwrap();
        assert_eq!((first.inserted, first.updated), (2, 0));
        assert_eq!((second.inserted, second.updated), (0, 2));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn bulk_load_surfaces_outage() {
        let loader = BulkLoader::new(Arc::new(DownStore), BulkLoadOptions::default());
        assert!(loader.load_path(sample_csv()).await.is_err());
    }

    #[tokio::test]
    async fn missing_export_file_is_fatal() {
        let loader = BulkLoader::new(Arc::new(MemoryJobStore::new()), BulkLoadOptions::default());
        assert!(loader.load_path("/nonexistent/export.csv").await.is_err());
    }

    #[test]
    fn config_requires_database_url() {
        let vars: HashMap<&str, &str> = HashMap::from([("GEOJOBS_TABLE", "jobs")]);
        let err = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseUrl));
    }

    #[test]
    fn config_reads_overrides_and_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://fallback"),
            ("GEOJOBS_SCHEMA", "geo"),
            ("GEOJOBS_HTTP_TIMEOUT_SECS", "5"),
            ("GEOJOBS_SCHEDULER_ENABLED", "true"),
        ]);
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.database_url, "postgres://fallback");
        assert_eq!(config.table.to_string(), "\"geo\".\"jobs\"");
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.db_timeout_secs, 30);
        assert!(config.scheduler_enabled);
        assert_eq!(config.sync_cron, "0 0 6 * * *");
        assert_eq!(config.web_port, 8000);
        assert_eq!(config.search_url, DEFAULT_SEARCH_URL);
    }

    #[test]
    fn config_rejects_bad_identifiers_and_numbers() {
        let bad_table: HashMap<&str, &str> =
            HashMap::from([("PG_DATABASE_URL", "postgres://x"), ("GEOJOBS_TABLE", "jobs; drop")]);
        assert!(matches!(
            SyncConfig::from_lookup(|k| bad_table.get(k).map(|v| v.to_string())),
            Err(ConfigError::InvalidIdentifier(_))
        ));

        let bad_port: HashMap<&str, &str> =
            HashMap::from([("PG_DATABASE_URL", "postgres://x"), ("GEOJOBS_WEB_PORT", "99999")]);
        assert!(matches!(
            SyncConfig::from_lookup(|k| bad_port.get(k).map(|v| v.to_string())),
            Err(ConfigError::InvalidNumber { key: "GEOJOBS_WEB_PORT", .. })
        ));
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let vars: HashMap<&str, &str> = HashMap::from([("PG_DATABASE_URL", "postgres://x")]);
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        let fetcher = Arc::new(IncrementalFetcher::new(
            Arc::new(ScriptedApi::default()),
            Arc::new(MemoryJobStore::new()),
            fast_options(),
        ));
        assert!(maybe_build_scheduler(&config, fetcher).await.unwrap().is_none());
    }
}
