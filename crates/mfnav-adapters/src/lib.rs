//! Upstream format adapters: header matching, row normalizers and AMFI sources.
//!
//! The merge engines only ever see canonical `NavRecord`/`SchemeAttributes`
//! values; every upstream column name is resolved here.

pub mod amfi;
pub mod columns;
pub mod nav;
pub mod scheme;

use mfnav_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use amfi::{chunk_ranges, AmfiNavSource, AmfiSchemeSource, NavSource, SchemeSource};
pub use columns::{ColumnMap, ColumnSpec};
pub use nav::{parse_nav_text, NavRowNormalizer};
pub use scheme::{category_levels, parse_scheme_csv, SchemeRowNormalizer};

pub const CRATE_NAME: &str = "mfnav-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("missing required column `{column}` (header: {header})")]
    MissingColumn { column: String, header: String },
    #[error("upstream returned no data rows: {0}")]
    EmptyPayload(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Converts one raw upstream row into a canonical record.
///
/// `Ok(None)` marks a row that carries no data: separator lines, rows with a
/// blank or unusable value.
pub trait Normalizer {
    type Output;

    fn normalize(&self, row: &csv::StringRecord) -> Result<Option<Self::Output>, AdapterError>;
}

/// Row accounting for one parsed upstream payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseStats {
    pub rows_read: usize,
    pub records: usize,
    /// Short lines between data rows (AMC names, category headings).
    pub separator_rows: usize,
    /// Data-shaped rows the normalizer rejected.
    pub skipped_rows: usize,
}

impl ParseStats {
    pub(crate) fn merge_outcome<T>(&mut self, outcome: &Option<T>) {
        if outcome.is_some() {
            self.records += 1;
        } else {
            self.skipped_rows += 1;
        }
    }
}

/// Trimmed cell text, `None` when blank or a known not-available marker.
pub(crate) fn clean_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    match trimmed {
        "" | "-" | "N.A." | "NA" | "N/A" | "na" | "n/a" | "null" => None,
        _ => Some(trimmed.to_string()),
    }
}

/// Numeric cell value; thousands separators and currency prefixes are ignored.
pub(crate) fn parse_number(value: &str) -> Option<f64> {
    let text = clean_text(value)?;
    if let Ok(v) = text.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    let digits: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let digits = digits.trim_matches('.');
    if digits.is_empty() {
        return None;
    }
    digits.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_drops_not_available_markers() {
        assert_eq!(clean_text("  Alpha  "), Some("Alpha".to_string()));
        assert_eq!(clean_text("N.A."), None);
        assert_eq!(clean_text("   "), None);
    }

    #[test]
    fn numbers_tolerate_upstream_decoration() {
        assert_eq!(parse_number("10.5"), Some(10.5));
        assert_eq!(parse_number("Rs. 5,000/-"), Some(5000.0));
        assert_eq!(parse_number("N.A."), None);
        assert_eq!(parse_number("abc"), None);
    }
}
