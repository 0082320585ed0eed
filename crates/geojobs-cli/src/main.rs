use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use geojobs_adapters::{SearchTemplate, TabularExport};
use geojobs_core::{GeoPoint, JobFilters, TableRef};
use geojobs_storage::{JobReader, PgJobStore};
use geojobs_sync::{
    maybe_build_scheduler, BulkLoadOptions, BulkLoadSummary, BulkLoader, FetchOptions,
    IncrementalFetcher, SyncConfig,
};
use geojobs_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

const STOCKHOLM: GeoPoint = GeoPoint {
    lon: 18.0686,
    lat: 59.3293,
};

#[derive(Debug, Parser)]
#[command(name = "geojobs")]
#[command(about = "Job listing geodata ingestion and query tool")]
struct Cli {
    /// Target schema (overrides GEOJOBS_SCHEMA).
    #[arg(long, global = true)]
    schema: Option<String>,
    /// Target table (overrides GEOJOBS_TABLE).
    #[arg(long, global = true)]
    table: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Page through the remote search API and upsert each job.
    Fetch(FetchArgs),
    /// Load a tabular export in one batch.
    Load(LoadArgs),
    /// Create the PostGIS extension, table and indexes.
    Migrate,
    /// Serve the KPI page and JSON query API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check connectivity, totals and a sample radius query.
    Smoke,
    /// Run the incremental fetch on GEOJOBS_SYNC_CRON until interrupted.
    Schedule(FetchArgs),
}

#[derive(Debug, Clone, Args)]
struct FetchArgs {
    /// occupationField filter value, e.g. apaJ_2ja_LuF.
    #[arg(long, conflicts_with = "payload_file")]
    occupation_field: Option<String>,
    /// JSON search payload; startIndex and maxRecords are rewritten per page.
    #[arg(long)]
    payload_file: Option<PathBuf>,
    #[arg(long, default_value_t = 25)]
    max_records: u32,
    #[arg(long, default_value_t = 5)]
    pages: u32,
    /// Seconds to wait between requests.
    #[arg(long, default_value_t = 0.5)]
    sleep: f64,
    #[arg(long, default_value_t = 0)]
    start_index: u32,
}

impl FetchArgs {
    fn options(&self) -> Result<FetchOptions> {
        let template = match &self.payload_file {
            Some(path) => SearchTemplate::from_path(path)?,
            None => SearchTemplate::for_occupation_field(self.occupation_field.as_deref()),
        };
        let delay = Duration::try_from_secs_f64(self.sleep)
            .with_context(|| format!("--sleep must be a non-negative number of seconds, got {}", self.sleep))?;
        Ok(FetchOptions {
            pages: self.pages,
            page_size: self.max_records,
            delay,
            start_index: self.start_index,
            template,
        })
    }
}

#[derive(Debug, Args)]
struct LoadArgs {
    #[arg(long)]
    csv: PathBuf,
    /// Only load the first N rows.
    #[arg(long)]
    sample: Option<usize>,
    /// Drop rows without valid coordinates instead of storing them unplaced.
    #[arg(long)]
    require_location: bool,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    if cli.schema.is_none() && cli.table.is_none() {
        return Ok(config);
    }
    let table = TableRef::new(
        cli.schema.as_deref().unwrap_or(config.table.schema()),
        cli.table.as_deref().unwrap_or(config.table.table()),
    )?;
    Ok(config.with_table(table))
}

async fn open_store(config: &SyncConfig) -> Result<PgJobStore> {
    let store = config.connect_store().await?;
    store.ensure_schema().await?;
    Ok(store)
}

/// Input files are resolved before the database is touched.
async fn build_fetcher(config: &SyncConfig, args: &FetchArgs) -> Result<IncrementalFetcher> {
    let options = args.options()?;
    let api = config.job_api()?;
    let store = open_store(config).await?;
    Ok(IncrementalFetcher::new(Arc::new(api), Arc::new(store), options))
}

async fn run_load(config: &SyncConfig, args: &LoadArgs) -> Result<BulkLoadSummary> {
    let export = TabularExport::from_path(&args.csv)?;
    let store = open_store(config).await?;
    let loader = BulkLoader::new(
        Arc::new(store),
        BulkLoadOptions {
            sample: args.sample,
            require_location: args.require_location,
        },
    );
    loader.load(&export).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Fetch(args) => {
            let fetcher = build_fetcher(&config, args).await?;
            let summary = fetcher.run().await?;
            println!(
                "fetch complete: run_id={} pages={} upserted={} inserted={} updated={} not_found={} failed={} table={}",
                summary.run_id,
                summary.pages_fetched,
                summary.upserted(),
                summary.inserted,
                summary.updated,
                summary.not_found,
                summary.failures.len(),
                config.table
            );
        }
        Commands::Load(args) => {
            let summary = run_load(&config, args).await?;
            println!(
                "load complete: run_id={} rows={} rejected={} without_location={} duplicates={} upserted={} failed={} table={}",
                summary.run_id,
                summary.rows_read,
                summary.rejected,
                summary.without_location,
                summary.duplicates,
                summary.upserted(),
                summary.failed.len(),
                config.table
            );
        }
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrate complete: table={}", config.table);
        }
        Commands::Serve { port } => {
            let store = Arc::new(config.connect_store().await?);
            let scheduler = if config.scheduler_enabled {
                let fetcher = Arc::new(IncrementalFetcher::new(
                    Arc::new(config.job_api()?),
                    store.clone(),
                    FetchOptions::default(),
                ));
                maybe_build_scheduler(&config, fetcher).await?
            } else {
                None
            };
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduled fetch enabled");
            }
            let state = AppState::new(store, config.table.to_string());
            geojobs_web::serve(state, port.unwrap_or(config.web_port)).await?;
        }
        Commands::Smoke => {
            let store = config.connect_store().await?;
            let version = store.postgis_version().await?;
            println!(
                "PostGIS: {}",
                version
                    .as_deref()
                    .and_then(|v| v.split(',').next())
                    .unwrap_or("unknown")
            );
            let stats = store.stats().await?;
            println!(
                "Jobs total: {}, with geometry: {} ({}%)",
                stats.total,
                stats.with_location,
                stats.coverage_percent()
            );
            let nearby = store
                .query(&JobFilters {
                    center: Some(STOCKHOLM),
                    radius_km: Some(50.0),
                    limit: 3,
                    ..Default::default()
                })
                .await?;
            if nearby.is_empty() {
                println!("No jobs within 50 km of Stockholm.");
            }
            for job in nearby {
                let distance = STOCKHOLM.haversine_m(&GeoPoint {
                    lon: job.lon,
                    lat: job.lat,
                });
                let title: String = job.title.unwrap_or_default().chars().take(60).collect();
                println!(" - {} {} ({} m)", job.job_id, title, distance.round() as i64);
            }
        }
        Commands::Schedule(args) => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config.clone()
            };
            let fetcher = Arc::new(build_fetcher(&config, args).await?);
            let Some(mut sched) = maybe_build_scheduler(&config, fetcher).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, table = %config.table, "waiting for scheduled fetches");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_defaults_match_documented_flags() {
        let cli = Cli::try_parse_from(["geojobs", "fetch"]).unwrap();
        let Commands::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        let options = args.options().unwrap();
        assert_eq!(options.pages, 5);
        assert_eq!(options.page_size, 25);
        assert_eq!(options.delay, Duration::from_millis(500));
        assert_eq!(options.start_index, 0);
    }

    #[test]
    fn occupation_field_and_payload_file_conflict() {
        let parsed = Cli::try_parse_from([
            "geojobs",
            "fetch",
            "--occupation-field",
            "apaJ_2ja_LuF",
            "--payload-file",
            "payload.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn negative_sleep_is_rejected() {
        let cli = Cli::try_parse_from(["geojobs", "fetch", "--sleep=-1"]).unwrap();
        let Commands::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        assert!(args.options().is_err());
    }

    fn unreachable_db_config() -> SyncConfig {
        SyncConfig::from_lookup(|key| {
            (key == "PG_DATABASE_URL").then(|| "postgres://nobody@127.0.0.1:1/none".to_string())
        })
        .unwrap()
    }

    #[tokio::test]
    async fn missing_payload_file_fails_before_connecting() {
        let cli = Cli::try_parse_from(["geojobs", "fetch", "--payload-file", "/nonexistent/payload.json"]).unwrap();
        let Commands::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        let err = build_fetcher(&unreachable_db_config(), &args).await.err().unwrap();
        let message = format!("{err:#}");
        assert!(message.contains("/nonexistent/payload.json"), "{message}");
        assert!(!message.contains("postgres"), "{message}");
    }

    #[tokio::test]
    async fn missing_csv_fails_before_connecting() {
        let cli = Cli::try_parse_from(["geojobs", "load", "--csv", "/nonexistent/jobs.csv"]).unwrap();
        let Commands::Load(args) = cli.command else {
            panic!("expected load");
        };
        let err = run_load(&unreachable_db_config(), &args).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("/nonexistent/jobs.csv"), "{message}");
        assert!(!message.contains("postgres"), "{message}");
    }

    #[test]
    fn table_flags_are_global() {
        let cli = Cli::try_parse_from([
            "geojobs",
            "load",
            "--csv",
            "jobs.csv",
            "--require-location",
            "--schema",
            "geo",
        ])
        .unwrap();
        assert_eq!(cli.schema.as_deref(), Some("geo"));
        let Commands::Load(args) = cli.command else {
            panic!("expected load");
        };
        assert!(args.require_location);
        assert_eq!(args.sample, None);
    }
}
