//! Parquet persistence boundary + HTTP fetch utilities for mfnav.
//!
//! Every table is replaced wholesale: the new version is encoded in memory,
//! written to a temp file next to the target and renamed over it, so a failed
//! run leaves the previous version in place.

pub mod codec;
pub mod http;

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use mfnav_core::{NavPartition, NavRecord, SchemeAttributes, SchemeMasterRecord};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

pub use codec::{ParquetCompression, StorageError};
pub use http::{BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "mfnav-storage";

const BATCH_PREFIX: &str = "batch_";
const DAILY_PREFIX: &str = "daily_nav_";
const SNAPSHOT_PREFIX: &str = "scheme_metadata_";
const PARQUET_EXT: &str = ".parquet";

#[derive(Debug, Clone)]
pub struct StoredTable {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Filesystem layout and read/write operations for every persisted dataset.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
    compression: ParquetCompression,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compression: ParquetCompression::default(),
        }
    }

    pub fn with_compression(mut self, compression: ParquetCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn historical_dir(&self) -> PathBuf {
        self.root.join("processed").join("nav_historical")
    }

    pub fn daily_dir(&self) -> PathBuf {
        self.root.join("raw").join("nav_daily")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join("raw").join("scheme_metadata")
    }

    pub fn combined_path(&self) -> PathBuf {
        self.root
            .join("processed")
            .join("nav_combined")
            .join("raw_nav_table.parquet")
    }

    pub fn masterdata_path(&self) -> PathBuf {
        self.root
            .join("processed")
            .join("scheme_metadata")
            .join("scheme_masterdata.parquet")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn batch_path(&self, batch_no: u32) -> PathBuf {
        self.historical_dir()
            .join(format!("{BATCH_PREFIX}{batch_no:02}{PARQUET_EXT}"))
    }

    pub fn daily_path(&self, date: NaiveDate) -> PathBuf {
        self.daily_dir().join(format!(
            "{DAILY_PREFIX}{}{PARQUET_EXT}",
            date.format("%Y%m%d")
        ))
    }

    pub fn snapshot_path(&self, date: NaiveDate) -> PathBuf {
        self.snapshot_dir().join(format!(
            "{SNAPSHOT_PREFIX}{}{PARQUET_EXT}",
            date.format("%Y%m%d")
        ))
    }

    /// Create every directory of the layout.
    pub async fn ensure_layout(&self) -> anyhow::Result<()> {
        let combined_path = self.combined_path();
        let masterdata_path = self.masterdata_path();
        let dirs = [
            self.historical_dir(),
            self.daily_dir(),
            self.snapshot_dir(),
            combined_path.parent().unwrap_or(&self.root).to_path_buf(),
            masterdata_path.parent().unwrap_or(&self.root).to_path_buf(),
        ];
        for dir in dirs {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    /// Replace `path` with `bytes` using a temp file and an atomic rename.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<StoredTable> {
        let parent = path
            .parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
        }

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredTable {
            path: path.to_path_buf(),
            sha256: Self::sha256_hex(bytes),
            bytes: bytes.len() as u64,
            rows: 0,
        })
    }

    async fn read_optional(&self, path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn list_prefixed(&self, dir: &Path, prefix: &str) -> anyhow::Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) && name.ends_with(PARQUET_EXT) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    // -- NAV facts ----------------------------------------------------------

    pub async fn write_nav_table(
        &self,
        path: &Path,
        records: &[NavRecord],
    ) -> anyhow::Result<StoredTable> {
        let batch = codec::nav_records_to_batch(records)
            .with_context(|| format!("building nav record batch for {}", path.display()))?;
        let bytes = codec::encode_parquet(&batch, self.compression)
            .with_context(|| format!("encoding parquet for {}", path.display()))?;
        let mut stored = self.write_atomic(path, &bytes).await?;
        stored.rows = records.len();
        info!(path = %path.display(), rows = stored.rows, bytes = stored.bytes, "wrote nav table");
        Ok(stored)
    }

    /// Load a NAV partition; the file name becomes the partition label.
    pub async fn load_nav_partition(&self, path: &Path) -> anyhow::Result<NavPartition> {
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let records = decode_nav(bytes, &label)
            .with_context(|| format!("decoding nav partition {}", path.display()))?;
        debug!(partition = %label, rows = records.len(), "loaded nav partition");
        Ok(NavPartition::new(label, records))
    }

    /// Historical batches in batch-number order.
    pub async fn list_historical_batches(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut batches = self
            .list_prefixed(&self.historical_dir(), BATCH_PREFIX)
            .await?;
        batches.sort_by_key(|p| parse_batch_number(p));
        Ok(batches)
    }

    pub async fn next_batch_number(&self) -> anyhow::Result<u32> {
        let highest = self
            .list_historical_batches()
            .await?
            .iter()
            .filter_map(|p| parse_batch_number(p))
            .max()
            .unwrap_or(0);
        Ok(highest + 1)
    }

    pub async fn write_batch(&self, batch_no: u32, records: &[NavRecord]) -> anyhow::Result<StoredTable> {
        self.write_nav_table(&self.batch_path(batch_no), records).await
    }

    /// Daily partitions on disk, ascending by date.
    pub async fn list_daily_partitions(&self) -> anyhow::Result<Vec<(NaiveDate, PathBuf)>> {
        let mut dated = self
            .list_prefixed(&self.daily_dir(), DAILY_PREFIX)
            .await?
            .into_iter()
            .filter_map(|p| parse_stamped_date(&p, DAILY_PREFIX).map(|d| (d, p)))
            .collect::<Vec<_>>();
        dated.sort();
        Ok(dated)
    }

    pub async fn has_daily(&self, date: NaiveDate) -> anyhow::Result<bool> {
        let path = self.daily_path(date);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))
    }

    pub async fn write_daily(&self, date: NaiveDate, records: &[NavRecord]) -> anyhow::Result<StoredTable> {
        self.write_nav_table(&self.daily_path(date), records).await
    }

    pub async fn load_combined(&self) -> anyhow::Result<Option<NavPartition>> {
        let path = self.combined_path();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        self.load_nav_partition(&path).await.map(Some)
    }

    pub async fn write_combined(&self, records: &[NavRecord]) -> anyhow::Result<StoredTable> {
        self.write_nav_table(&self.combined_path(), records).await
    }

    /// Latest NAV date already held locally: the newest of the consolidated
    /// table, the last historical batch and the last daily partition.
    pub async fn latest_known_date(&self) -> anyhow::Result<Option<NaiveDate>> {
        let mut latest = None;
        let combined = self.combined_path();
        if fs::try_exists(&combined)
            .await
            .with_context(|| format!("checking {}", combined.display()))?
        {
            latest = latest.max(self.max_date_in(&combined).await?);
        }
        if let Some(last_batch) = self.list_historical_batches().await?.last() {
            latest = latest.max(self.max_date_in(last_batch).await?);
        }
        if let Some((date, _)) = self.list_daily_partitions().await?.last() {
            latest = latest.max(Some(*date));
        }
        Ok(latest)
    }

    async fn max_date_in(&self, path: &Path) -> anyhow::Result<Option<NaiveDate>> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let label = path.display().to_string();
        codec::max_nav_date(bytes, &label).with_context(|| format!("reading dates of {label}"))
    }

    // -- scheme snapshots and masterdata ------------------------------------

    pub async fn write_snapshot(
        &self,
        date: NaiveDate,
        attrs: &[SchemeAttributes],
    ) -> anyhow::Result<StoredTable> {
        let path = self.snapshot_path(date);
        let batch = codec::scheme_attributes_to_batch(attrs)
            .with_context(|| format!("building snapshot record batch for {}", path.display()))?;
        let bytes = codec::encode_parquet(&batch, self.compression)
            .with_context(|| format!("encoding parquet for {}", path.display()))?;
        let mut stored = self.write_atomic(&path, &bytes).await?;
        stored.rows = attrs.len();
        info!(path = %path.display(), rows = stored.rows, "wrote scheme snapshot");
        Ok(stored)
    }

    pub async fn load_masterdata(&self) -> anyhow::Result<Option<Vec<SchemeMasterRecord>>> {
        let path = self.masterdata_path();
        let Some(bytes) = self.read_optional(&path).await? else {
            return Ok(None);
        };
        let label = path.display().to_string();
        let mut records = Vec::new();
        for batch in codec::decode_parquet(bytes).with_context(|| format!("decoding {label}"))? {
            records.extend(
                codec::master_records_from_batch(&batch, &label)
                    .map_err(StorageError::from)
                    .with_context(|| format!("decoding {label}"))?,
            );
        }
        debug!(rows = records.len(), "loaded masterdata");
        Ok(Some(records))
    }

    pub async fn write_masterdata(
        &self,
        records: &[SchemeMasterRecord],
    ) -> anyhow::Result<StoredTable> {
        let path = self.masterdata_path();
        let batch = codec::master_records_to_batch(records)
            .context("building masterdata record batch")?;
        let bytes = codec::encode_parquet(&batch, self.compression)
            .context("encoding masterdata parquet")?;
        let mut stored = self.write_atomic(&path, &bytes).await?;
        stored.rows = records.len();
        info!(path = %path.display(), rows = stored.rows, "wrote masterdata");
        Ok(stored)
    }
}

fn decode_nav(bytes: Vec<u8>, label: &str) -> Result<Vec<NavRecord>, StorageError> {
    let mut records = Vec::new();
    for batch in codec::decode_parquet(bytes)? {
        records.extend(codec::nav_records_from_batch(&batch, label)?);
    }
    Ok(records)
}

fn file_stem_after<'a>(path: &'a Path, prefix: &str) -> Option<&'a str> {
    path.file_name()?
        .to_str()?
        .strip_prefix(prefix)?
        .strip_suffix(PARQUET_EXT)
}

fn parse_batch_number(path: &Path) -> Option<u32> {
    file_stem_after(path, BATCH_PREFIX)?.parse().ok()
}

fn parse_stamped_date(path: &Path, prefix: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(file_stem_after(path, prefix)?, "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfnav_core::MergeError;
    use tempfile::tempdir;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn content_hashing_is_stable() {
        let hash = TableStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn layout_paths_follow_naming_conventions() {
        let store = TableStore::new("/data");
        assert_eq!(
            store.batch_path(3),
            PathBuf::from("/data/processed/nav_historical/batch_03.parquet")
        );
        assert_eq!(
            store.daily_path(d(2024, 1, 5)),
            PathBuf::from("/data/raw/nav_daily/daily_nav_20240105.parquet")
        );
        assert_eq!(parse_batch_number(&store.batch_path(12)), Some(12));
        assert_eq!(
            parse_stamped_date(&store.snapshot_path(d(2024, 2, 29)), SNAPSHOT_PREFIX),
            Some(d(2024, 2, 29))
        );
    }

    #[tokio::test]
    async fn atomic_writes_replace_previous_version() {
        let dir = tempdir().expect("tempdir");
        let store = TableStore::new(dir.path());
        let path = dir.path().join("nested").join("table.bin");

        let first = store.write_atomic(&path, b"first").await.expect("first write");
        let second = store.write_atomic(&path, b"second").await.expect("second write");

        assert_ne!(first.sha256, second.sha256);
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn daily_partitions_list_in_date_order_and_feed_latest_date() {
        let dir = tempdir().expect("tempdir");
        let store = TableStore::new(dir.path());
        store.ensure_layout().await.unwrap();

        for day in [d(2024, 1, 4), d(2024, 1, 2), d(2024, 1, 3)] {
            store
                .write_daily(day, &[NavRecord::new("100001", day, 10.0)])
                .await
                .unwrap();
        }
        store
            .write_batch(1, &[NavRecord::new("100001", d(2023, 12, 29), 9.0)])
            .await
            .unwrap();

        let days = store
            .list_daily_partitions()
            .await
            .unwrap()
            .into_iter()
            .map(|(day, _)| day)
            .collect::<Vec<_>>();
        assert_eq!(days, vec![d(2024, 1, 2), d(2024, 1, 3), d(2024, 1, 4)]);
        assert_eq!(store.latest_known_date().await.unwrap(), Some(d(2024, 1, 4)));
        assert_eq!(store.next_batch_number().await.unwrap(), 2);
        assert!(store.has_daily(d(2024, 1, 3)).await.unwrap());
        assert!(!store.has_daily(d(2024, 1, 5)).await.unwrap());
    }

    #[tokio::test]
    async fn latest_date_comes_from_batches_and_combined_table_too() {
        let dir = tempdir().expect("tempdir");
        let store = TableStore::new(dir.path());
        store.ensure_layout().await.unwrap();

        store
            .write_daily(d(2024, 1, 2), &[NavRecord::new("100001", d(2024, 1, 2), 10.0)])
            .await
            .unwrap();
        store
            .write_batch(
                1,
                &[
                    NavRecord::new("100001", d(2024, 1, 5), 9.0),
                    NavRecord::new("100002", d(2023, 6, 1), 9.5),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.latest_known_date().await.unwrap(), Some(d(2024, 1, 5)));

        store
            .write_combined(&[NavRecord::new("100001", d(2024, 1, 9), 11.0)])
            .await
            .unwrap();
        assert_eq!(store.latest_known_date().await.unwrap(), Some(d(2024, 1, 9)));
    }

    #[tokio::test]
    async fn empty_store_has_no_state() {
        let dir = tempdir().expect("tempdir");
        let store = TableStore::new(dir.path());
        assert!(store.load_combined().await.unwrap().is_none());
        assert!(store.load_masterdata().await.unwrap().is_none());
        assert_eq!(store.latest_known_date().await.unwrap(), None);
        assert_eq!(store.next_batch_number().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn masterdata_file_with_wrong_layout_reports_schema_error() {
        let dir = tempdir().expect("tempdir");
        let store = TableStore::new(dir.path());
        // A snapshot file lacks the lifecycle columns.
        let batch = codec::scheme_attributes_to_batch(&[SchemeAttributes::new("100001")]).unwrap();
        let bytes = codec::encode_parquet(&batch, ParquetCompression::Snappy).unwrap();
        store.write_atomic(&store.masterdata_path(), &bytes).await.unwrap();

        let err = store.load_masterdata().await.unwrap_err();
        let storage_err = err.downcast_ref::<StorageError>().expect("storage error");
        assert!(matches!(
            storage_err,
            StorageError::Schema(MergeError::Schema { .. })
        ));
    }
}
