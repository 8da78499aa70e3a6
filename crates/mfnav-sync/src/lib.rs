//! Sync pipeline orchestration: gap fill, consolidation, masterdata refresh.

pub mod consolidate;
pub mod gap;
pub mod masterdata;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use mfnav_adapters::amfi::{DEFAULT_NAV_HISTORY_URL, DEFAULT_NAV_URL, DEFAULT_SCHEME_URL};
use mfnav_adapters::{chunk_ranges, AmfiNavSource, AmfiSchemeSource, NavSource, SchemeSource};
use mfnav_core::{MergeError, NavBounds, NavPartition, NavRecord};
use mfnav_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, ParquetCompression, TableStore,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use consolidate::{consolidate, Consolidated, ConsolidationConfig, ConsolidationReport};
pub use gap::{is_weekend, latest_date, missing_dates};
pub use masterdata::{merge_masterdata, MasterdataMerge, MergeSummary};

pub const CRATE_NAME: &str = "mfnav-sync";

const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub nav_url: String,
    pub nav_history_url: String,
    pub scheme_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub fetch_concurrency: usize,
    pub historical_fetch_days: u32,
    pub nav_bounds: NavBounds,
    pub compression: ParquetCompression,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = NavBounds::default();
        let compression = match std::env::var("MFNAV_PARQUET_COMPRESSION") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                warn!(%err, "falling back to snappy compression");
                ParquetCompression::default()
            }),
            Err(_) => ParquetCompression::default(),
        };
        Self {
            data_dir: std::env::var("MFNAV_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            nav_url: env_or("MFNAV_NAV_URL", DEFAULT_NAV_URL),
            nav_history_url: env_or("MFNAV_NAV_HISTORY_URL", DEFAULT_NAV_HISTORY_URL),
            scheme_url: env_or("MFNAV_SCHEME_URL", DEFAULT_SCHEME_URL),
            user_agent: env_or("MFNAV_USER_AGENT", "mfnav/0.1"),
            http_timeout_secs: env_parse("MFNAV_HTTP_TIMEOUT_SECS", 30),
            max_retries: env_parse("MFNAV_MAX_RETRIES", 3),
            fetch_concurrency: env_parse("MFNAV_FETCH_CONCURRENCY", 4),
            historical_fetch_days: env_parse("MFNAV_HISTORICAL_FETCH_DAYS", 90),
            nav_bounds: NavBounds {
                min: env_parse("MFNAV_MIN_NAV", defaults.min),
                max: env_parse("MFNAV_MAX_NAV", defaults.max),
            },
            compression,
            scheduler_enabled: std::env::var("MFNAV_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_or("MFNAV_SYNC_CRON", "0 30 21 * * Mon-Fri"),
        }
    }

    pub fn consolidation(&self) -> ConsolidationConfig {
        ConsolidationConfig {
            nav_bounds: self.nav_bounds,
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_concurrency: self.fetch_concurrency,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub latest_known_date: Option<NaiveDate>,
    pub missing_dates: Vec<NaiveDate>,
    pub fetched_dates: Vec<NaiveDate>,
    pub already_present_dates: Vec<NaiveDate>,
    pub failed_dates: Vec<NaiveDate>,
    pub consolidation: ConsolidationReport,
    pub masterdata: MergeSummary,
    pub manifest_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub chunks: usize,
    pub batches_written: Vec<String>,
    pub records: usize,
    pub failed_chunks: Vec<(NaiveDate, NaiveDate)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Single-writer pipeline over one data directory.
///
/// Every public operation that writes takes `run_lock` for its whole
/// duration, so scheduled and manual runs never interleave writes.
pub struct SyncPipeline {
    config: PipelineConfig,
    store: TableStore,
    nav_source: Arc<dyn NavSource>,
    scheme_source: Arc<dyn SchemeSource>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    /// Pipeline wired to the AMFI endpoints from `config`.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client())?);
        let nav_source = AmfiNavSource::new(
            Arc::clone(&http),
            config.nav_url.clone(),
            config.nav_history_url.clone(),
            config.nav_bounds,
        );
        let scheme_source = AmfiSchemeSource::new(http, config.scheme_url.clone());
        Ok(Self::with_sources(
            config,
            Arc::new(nav_source),
            Arc::new(scheme_source),
        ))
    }

    pub fn with_sources(
        config: PipelineConfig,
        nav_source: Arc<dyn NavSource>,
        scheme_source: Arc<dyn SchemeSource>,
    ) -> Self {
        let store = TableStore::new(config.data_dir.clone()).with_compression(config.compression);
        Self {
            config,
            store,
            nav_source,
            scheme_source,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    /// Weekdays still missing locally as of `today`.
    pub async fn gaps(&self, today: NaiveDate) -> Result<Vec<NaiveDate>> {
        let latest = self
            .store
            .latest_known_date()
            .await
            .context("reading latest known nav date")?;
        Ok(missing_dates(latest, today))
    }

    /// Fetch missing daily files, rebuild the consolidated table and refresh
    /// the masterdata from a fresh scheme snapshot.
    pub async fn run_daily(&self, today: NaiveDate) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("run_daily", %run_id, %today);
        self.run_daily_locked(run_id, today).instrument(span).await
    }

    async fn run_daily_locked(&self, run_id: Uuid, today: NaiveDate) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        self.store.ensure_layout().await?;

        let latest_known_date = self
            .store
            .latest_known_date()
            .await
            .context("reading latest known nav date")?;
        let missing = missing_dates(latest_known_date, today);
        info!(?latest_known_date, missing = missing.len(), "computed nav gap");

        let mut fetched_dates = Vec::new();
        let mut already_present_dates = Vec::new();
        let mut failed_dates = Vec::new();
        for &date in &missing {
            if self.store.has_daily(date).await? {
                already_present_dates.push(date);
                continue;
            }
            match self.nav_source.fetch_daily(date).await {
                Ok(records) => {
                    self.store
                        .write_daily(date, &records)
                        .await
                        .with_context(|| format!("writing daily nav for {date}"))?;
                    fetched_dates.push(date);
                }
                Err(err) => {
                    warn!(%date, error = %err, "daily nav fetch failed; retried next run");
                    failed_dates.push(date);
                }
            }
        }

        let consolidation = match self.consolidate_locked().await? {
            Some(report) => report,
            None => {
                warn!("no nav partitions on disk yet; skipping consolidation");
                ConsolidationReport::default()
            }
        };
        let masterdata = self.refresh_masterdata_locked(today).await?;
        let manifest_path = self.write_manifest().await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            today,
            latest_known_date,
            missing_dates: missing,
            fetched_dates,
            already_present_dates,
            failed_dates,
            consolidation,
            masterdata,
            manifest_path: manifest_path.display().to_string(),
        };
        info!(
            fetched = summary.fetched_dates.len(),
            failed = summary.failed_dates.len(),
            nav_rows = summary.consolidation.output_rows,
            schemes = summary.masterdata.active + summary.masterdata.inactive,
            "daily sync finished"
        );
        Ok(summary)
    }

    /// Download `start..=end` in chunks and store each chunk as the next
    /// historical batch. Chunks are fetched concurrently and written in
    /// date order.
    pub async fn run_backfill(&self, start: NaiveDate, end: NaiveDate) -> Result<BackfillSummary> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("run_backfill", %run_id, %start, %end);
        async {
            self.store.ensure_layout().await?;
            let chunks = chunk_ranges(start, end, self.config.historical_fetch_days);
            info!(chunks = chunks.len(), "starting nav backfill");

            let mut tasks = JoinSet::new();
            for (idx, (from, to)) in chunks.iter().copied().enumerate() {
                let source = Arc::clone(&self.nav_source);
                tasks.spawn(async move { (idx, source.fetch_history(from, to).await) });
            }
            let mut results: Vec<Option<Vec<NavRecord>>> = vec![None; chunks.len()];
            let mut failed_chunks = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let (idx, outcome) = joined.context("backfill fetch task panicked")?;
                match outcome {
                    Ok(records) => results[idx] = Some(records),
                    Err(err) => {
                        let (from, to) = chunks[idx];
                        warn!(%from, %to, error = %err, "history chunk fetch failed");
                        failed_chunks.push((from, to));
                    }
                }
            }
            failed_chunks.sort();

            let mut batches_written = Vec::new();
            let mut records_total = 0usize;
            let mut batch_no = self.store.next_batch_number().await?;
            for records in results.into_iter().flatten() {
                let stored = self
                    .store
                    .write_batch(batch_no, &records)
                    .await
                    .with_context(|| format!("writing historical batch {batch_no}"))?;
                records_total += records.len();
                batches_written.push(stored.path.display().to_string());
                batch_no += 1;
            }

            Ok(BackfillSummary {
                run_id,
                start,
                end,
                chunks: chunks.len(),
                batches_written,
                records: records_total,
                failed_chunks,
            })
        }
        .instrument(span)
        .await
    }

    /// Rebuild the consolidated NAV table from what is on disk.
    pub async fn consolidate_only(&self) -> Result<ConsolidationReport> {
        let _guard = self.run_lock.lock().await;
        self.store.ensure_layout().await?;
        let report = self
            .consolidate_locked()
            .await?
            .ok_or_else(|| MergeError::EmptyInput("no nav partitions on disk".into()))?;
        self.write_manifest().await?;
        Ok(report)
    }

    /// Fetch a scheme snapshot and merge it into the masterdata as of `as_of`.
    pub async fn masterdata_only(&self, as_of: NaiveDate) -> Result<MergeSummary> {
        let _guard = self.run_lock.lock().await;
        self.store.ensure_layout().await?;
        let summary = self.refresh_masterdata_locked(as_of).await?;
        self.write_manifest().await?;
        Ok(summary)
    }

    /// `None` when neither the combined table nor any batch or daily file
    /// exists yet.
    async fn consolidate_locked(&self) -> Result<Option<ConsolidationReport>> {
        let mut existing = Vec::new();
        if let Some(combined) = self.store.load_combined().await? {
            existing.push(combined);
        }
        for path in self.store.list_historical_batches().await? {
            existing.push(self.store.load_nav_partition(&path).await?);
        }
        let mut new: Vec<NavPartition> = Vec::new();
        for (_, path) in self.store.list_daily_partitions().await? {
            new.push(self.store.load_nav_partition(&path).await?);
        }
        if existing.is_empty() && new.is_empty() {
            return Ok(None);
        }

        let Consolidated { records, report } =
            consolidate(existing, new, &self.config.consolidation())
                .context("consolidating nav partitions")?;
        self.store
            .write_combined(&records)
            .await
            .context("writing consolidated nav table")?;
        Ok(Some(report))
    }

    async fn refresh_masterdata_locked(&self, as_of: NaiveDate) -> Result<MergeSummary> {
        let snapshot = self
            .scheme_source
            .fetch_snapshot()
            .await
            .context("fetching scheme snapshot")?;
        self.store
            .write_snapshot(as_of, &snapshot)
            .await
            .context("writing scheme snapshot")?;

        let existing = self
            .store
            .load_masterdata()
            .await
            .context("loading scheme masterdata")?;
        let merge = merge_masterdata(existing.as_deref(), &snapshot, as_of)
            .context("merging scheme masterdata")?;
        self.store
            .write_masterdata(&merge.records)
            .await
            .context("writing scheme masterdata")?;
        Ok(merge.summary)
    }

    async fn write_manifest(&self) -> Result<PathBuf> {
        let root = self.store.root();
        let mut files = Vec::new();
        for (name, path) in [
            ("nav_combined", self.store.combined_path()),
            ("scheme_masterdata", self.store.masterdata_path()),
        ] {
            if let Some(entry) = manifest_entry(name, root, &path).await? {
                files.push(entry);
            }
        }
        let manifest = ParquetManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            generated_at: Utc::now(),
            files,
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        let path = self.store.manifest_path();
        self.store.write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    /// Cron job running `run_daily` when the scheduler is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let today = Local::now().date_naive();
                match pipeline.run_daily(today).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                    Err(err) => warn!(error = ?err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn manifest_entry(
    name: &str,
    root: &Path,
    path: &Path,
) -> Result<Option<ParquetManifestFile>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let rel = path.strip_prefix(root).unwrap_or(path);
    Ok(Some(ParquetManifestFile {
        name: name.to_string(),
        path: rel.display().to_string(),
        sha256: TableStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    }))
}

pub async fn run_daily_from_env(today: NaiveDate) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(PipelineConfig::from_env())?;
    pipeline.run_daily(today).await
}
