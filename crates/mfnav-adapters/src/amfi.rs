use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use mfnav_core::{NavBounds, NavRecord, SchemeAttributes};
use mfnav_storage::HttpFetcher;
use tracing::info;

use crate::nav::parse_nav_text;
use crate::scheme::parse_scheme_csv;
use crate::AdapterError;

pub const DEFAULT_NAV_URL: &str = "https://www.amfiindia.com/spages/NAVAll.txt";
pub const DEFAULT_NAV_HISTORY_URL: &str =
    "https://portal.amfiindia.com/DownloadNAVHistoryReport_Po.aspx";
pub const DEFAULT_SCHEME_URL: &str = "https://portal.amfiindia.com/DownloadSchemeData_Po.aspx";

const HISTORY_DATE_FORMAT: &str = "%d-%b-%Y";

#[async_trait]
pub trait NavSource: Send + Sync {
    /// NAV records published for `nav_date`.
    async fn fetch_daily(&self, nav_date: NaiveDate) -> Result<Vec<NavRecord>, AdapterError>;

    /// NAV records for the inclusive range `start..=end`.
    async fn fetch_history(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NavRecord>, AdapterError>;
}

#[async_trait]
pub trait SchemeSource: Send + Sync {
    /// The current scheme master list.
    async fn fetch_snapshot(&self) -> Result<Vec<SchemeAttributes>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct AmfiNavSource {
    http: Arc<HttpFetcher>,
    daily_url: String,
    history_url: String,
    bounds: NavBounds,
}

impl AmfiNavSource {
    pub fn new(
        http: Arc<HttpFetcher>,
        daily_url: impl Into<String>,
        history_url: impl Into<String>,
        bounds: NavBounds,
    ) -> Self {
        Self {
            http,
            daily_url: daily_url.into(),
            history_url: history_url.into(),
            bounds,
        }
    }
}

#[async_trait]
impl NavSource for AmfiNavSource {
    async fn fetch_daily(&self, nav_date: NaiveDate) -> Result<Vec<NavRecord>, AdapterError> {
        // Cache buster; the endpoint always serves the latest publication.
        let stamp = format!(
            "{}{}",
            nav_date.format("%d%m%Y"),
            Utc::now().format("%H%M%S")
        );
        let response = self
            .http
            .fetch_text("amfi_nav_daily", &self.daily_url, &[("t", stamp)])
            .await?;
        let (records, stats) = parse_nav_text(&response.body, Some(nav_date), self.bounds)?;
        info!(%nav_date, records = stats.records, skipped = stats.skipped_rows, "parsed daily nav");
        if records.is_empty() {
            return Err(AdapterError::EmptyPayload(format!("daily nav for {nav_date}")));
        }
        Ok(records)
    }

    async fn fetch_history(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NavRecord>, AdapterError> {
        let query = [
            ("tp", "1".to_string()),
            ("frmdt", start.format(HISTORY_DATE_FORMAT).to_string()),
            ("todt", end.format(HISTORY_DATE_FORMAT).to_string()),
        ];
        let response = self
            .http
            .fetch_text("amfi_nav_history", &self.history_url, &query)
            .await?;
        let (records, stats) = parse_nav_text(&response.body, None, self.bounds)?;
        info!(%start, %end, records = stats.records, skipped = stats.skipped_rows, "parsed nav history");
        if records.is_empty() {
            return Err(AdapterError::EmptyPayload(format!(
                "nav history {start}..={end}"
            )));
        }
        Ok(records)
    }
}

#[derive(Debug, Clone)]
pub struct AmfiSchemeSource {
    http: Arc<HttpFetcher>,
    url: String,
}

impl AmfiSchemeSource {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SchemeSource for AmfiSchemeSource {
    async fn fetch_snapshot(&self) -> Result<Vec<SchemeAttributes>, AdapterError> {
        let response = self
            .http
            .fetch_text("amfi_scheme_master", &self.url, &[("mf", "0".to_string())])
            .await?;
        let (attrs, stats) = parse_scheme_csv(&response.body)?;
        info!(records = stats.records, skipped = stats.skipped_rows, "parsed scheme snapshot");
        if attrs.is_empty() {
            return Err(AdapterError::EmptyPayload("scheme snapshot".to_string()));
        }
        Ok(attrs)
    }
}

/// Split `start..=end` into consecutive inclusive ranges of at most `days`.
pub fn chunk_ranges(start: NaiveDate, end: NaiveDate, days: u32) -> Vec<(NaiveDate, NaiveDate)> {
    let span = Duration::days(i64::from(days.max(1)) - 1);
    let mut chunks = Vec::new();
    let mut current = start;
    while current <= end {
        let chunk_end = (current + span).min(end);
        chunks.push((current, chunk_end));
        match chunk_end.succ_opt() {
            Some(next) => current = next,
            None => break,
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn chunks_cover_the_range_without_overlap() {
        let chunks = chunk_ranges(d(2024, 1, 1), d(2024, 1, 10), 4);
        assert_eq!(
            chunks,
            vec![
                (d(2024, 1, 1), d(2024, 1, 4)),
                (d(2024, 1, 5), d(2024, 1, 8)),
                (d(2024, 1, 9), d(2024, 1, 10)),
            ]
        );
    }

    #[test]
    fn single_day_and_inverted_ranges() {
        assert_eq!(
            chunk_ranges(d(2024, 3, 1), d(2024, 3, 1), 90),
            vec![(d(2024, 3, 1), d(2024, 3, 1))]
        );
        assert!(chunk_ranges(d(2024, 3, 2), d(2024, 3, 1), 90).is_empty());
        assert_eq!(chunk_ranges(d(2024, 3, 1), d(2024, 3, 2), 0).len(), 2);
    }
}
