//! Core record types, validation bounds and merge errors for mfnav.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mfnav-core";

/// Canonical column names shared by the persistence boundary and the normalizers.
pub mod columns {
    pub const SCHEME_CODE: &str = "scheme_code";
    pub const DATE: &str = "date";
    pub const NAV: &str = "nav";
    pub const ISIN_GROWTH: &str = "isin_growth";
    pub const ISIN_DIVIDEND: &str = "isin_dividend";
    pub const SCHEME_NAME: &str = "scheme_name";
    pub const REPURCHASE_PRICE: &str = "repurchase_price";
    pub const SALE_PRICE: &str = "sale_price";

    pub const AMC_NAME: &str = "amc_name";
    pub const SCHEME_TYPE: &str = "scheme_type";
    pub const SCHEME_CATEGORY: &str = "scheme_category";
    pub const SCHEME_NAV_NAME: &str = "scheme_nav_name";
    pub const SCHEME_CATEGORY_LEVEL1: &str = "scheme_category_level1";
    pub const SCHEME_CATEGORY_LEVEL2: &str = "scheme_category_level2";
    pub const IS_DIRECT: &str = "is_direct";
    pub const IS_GROWTH_PLAN: &str = "is_growth_plan";
    pub const LAUNCH_DATE: &str = "launch_date";
    pub const CLOSURE_DATE: &str = "closure_date";
    pub const MINIMUM_AMOUNT: &str = "minimum_amount";

    pub const FIRST_SEEN_DATE: &str = "first_seen_date";
    pub const LAST_SEEN_DATE: &str = "last_seen_date";
    pub const IS_ACTIVE: &str = "is_active";
    pub const ATTRIBUTE_LAST_UPDATED: &str = "attribute_last_updated";
}

/// Uniqueness key of the fact table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NavKey {
    pub scheme_code: String,
    pub date: NaiveDate,
}

impl fmt::Display for NavKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.scheme_code, self.date)
    }
}

/// A single fund valuation observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavRecord {
    pub scheme_code: String,
    pub date: NaiveDate,
    pub nav: f64,
    pub isin_growth: Option<String>,
    pub isin_dividend: Option<String>,
    pub scheme_name: Option<String>,
    pub repurchase_price: Option<f64>,
    pub sale_price: Option<f64>,
}

impl NavRecord {
    pub fn new(scheme_code: impl Into<String>, date: NaiveDate, nav: f64) -> Self {
        Self {
            scheme_code: scheme_code.into(),
            date,
            nav,
            isin_growth: None,
            isin_dividend: None,
            scheme_name: None,
            repurchase_price: None,
            sale_price: None,
        }
    }

    pub fn key(&self) -> NavKey {
        NavKey {
            scheme_code: self.scheme_code.clone(),
            date: self.date,
        }
    }
}

/// One input table for consolidation: a historical batch, a daily snapshot or
/// the previously consolidated table. The label is used in errors and logs.
#[derive(Debug, Clone, PartialEq)]
pub struct NavPartition {
    pub label: String,
    pub records: Vec<NavRecord>,
}

impl NavPartition {
    pub fn new(label: impl Into<String>, records: Vec<NavRecord>) -> Self {
        Self {
            label: label.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Inclusive range a persisted NAV must fall in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NavBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for NavBounds {
    fn default() -> Self {
        Self {
            min: 0.01,
            max: 10_000.0,
        }
    }
}

impl NavBounds {
    pub fn contains(&self, nav: f64) -> bool {
        nav.is_finite() && nav >= self.min && nav <= self.max
    }
}

/// Descriptive attributes of a scheme as published in one snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemeAttributes {
    pub scheme_code: String,
    pub scheme_name: Option<String>,
    pub amc_name: Option<String>,
    pub scheme_type: Option<String>,
    pub scheme_category: Option<String>,
    pub scheme_nav_name: Option<String>,
    pub scheme_category_level1: Option<String>,
    pub scheme_category_level2: Option<String>,
    pub is_direct: Option<bool>,
    pub is_growth_plan: Option<bool>,
    pub launch_date: Option<NaiveDate>,
    pub closure_date: Option<NaiveDate>,
    pub minimum_amount: Option<f64>,
    pub isin_growth: Option<String>,
    pub isin_dividend: Option<String>,
}

impl SchemeAttributes {
    pub fn new(scheme_code: impl Into<String>) -> Self {
        Self {
            scheme_code: scheme_code.into(),
            ..Default::default()
        }
    }
}

/// A masterdata row: scheme attributes plus lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeMasterRecord {
    #[serde(flatten)]
    pub attributes: SchemeAttributes,
    pub first_seen_date: NaiveDate,
    pub last_seen_date: NaiveDate,
    pub is_active: bool,
    pub attribute_last_updated: NaiveDate,
}

impl SchemeMasterRecord {
    pub fn scheme_code(&self) -> &str {
        &self.attributes.scheme_code
    }
}

/// Per-run classification of a scheme code against the persisted masterdata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeClass {
    /// In the latest snapshot only.
    New,
    /// In both the snapshot and the masterdata.
    Existing,
    /// In the masterdata only.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("schema mismatch in `{partition}`: {detail}")]
    Schema { partition: String, detail: String },
    #[error("empty input: {0}")]
    EmptyInput(String),
    #[error("key {key} appears more than once after deduplication")]
    UniquenessViolation { key: String },
}

impl MergeError {
    pub fn schema(partition: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Schema {
            partition: partition.into(),
            detail: detail.into(),
        }
    }
}

pub type MergeResult<T> = Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn nav_keys_order_by_scheme_then_date() {
        let mut keys = vec![
            NavRecord::new("B", d(2024, 1, 1), 1.0).key(),
            NavRecord::new("A", d(2024, 1, 2), 1.0).key(),
            NavRecord::new("A", d(2024, 1, 1), 1.0).key(),
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["(A, 2024-01-01)", "(A, 2024-01-02)", "(B, 2024-01-01)"]
        );
    }

    #[test]
    fn nav_bounds_are_inclusive_and_reject_non_finite() {
        let bounds = NavBounds::default();
        assert!(bounds.contains(0.01));
        assert!(bounds.contains(10_000.0));
        assert!(!bounds.contains(0.0));
        assert!(!bounds.contains(10_000.5));
        assert!(!bounds.contains(f64::NAN));
        assert!(!bounds.contains(f64::INFINITY));
    }

    #[test]
    fn master_record_serializes_flat() {
        let record = SchemeMasterRecord {
            attributes: SchemeAttributes {
                scheme_name: Some("Alpha Fund".into()),
                ..SchemeAttributes::new("100001")
            },
            first_seen_date: d(2020, 5, 1),
            last_seen_date: d(2024, 1, 1),
            is_active: true,
            attribute_last_updated: d(2024, 1, 1),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["scheme_code"], "100001");
        assert_eq!(value["scheme_name"], "Alpha Fund");
        assert_eq!(value["first_seen_date"], "2020-05-01");
        assert_eq!(value["is_active"], true);
    }
}
