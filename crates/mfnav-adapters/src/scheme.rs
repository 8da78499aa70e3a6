use csv::{ReaderBuilder, StringRecord, Trim};
use mfnav_core::{columns, SchemeAttributes};

use crate::columns::{ColumnMap, ColumnSpec};
use crate::nav::parse_upstream_date;
use crate::{clean_text, parse_number, AdapterError, Normalizer, ParseStats};

/// AMFI scheme master CSV (`DownloadSchemeData_Po.aspx?mf=0`).
pub const SCHEME_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::required(columns::SCHEME_CODE, &["Code", "Scheme Code"]),
    ColumnSpec::optional(columns::AMC_NAME, &["AMC", "AMC Name"]),
    ColumnSpec::optional(columns::SCHEME_NAME, &["Scheme Name"]),
    ColumnSpec::optional(columns::SCHEME_TYPE, &["Scheme Type"]),
    ColumnSpec::optional(columns::SCHEME_CATEGORY, &["Scheme Category"]),
    ColumnSpec::optional(columns::SCHEME_NAV_NAME, &["Scheme NAV Name"]),
    ColumnSpec::optional(
        columns::MINIMUM_AMOUNT,
        &["Scheme Minimum Amount", "Minimum Amount"],
    ),
    ColumnSpec::optional(columns::LAUNCH_DATE, &["Launch Date"]),
    ColumnSpec::optional(columns::CLOSURE_DATE, &["Closure Date"]),
    ColumnSpec::optional(
        columns::ISIN_GROWTH,
        &["ISIN Div Payout/ ISIN Growth", "ISIN Growth"],
    ),
    ColumnSpec::optional(
        columns::ISIN_DIVIDEND,
        &["ISIN Div Reinvestment", "ISIN Dividend"],
    ),
    ColumnSpec::optional(columns::IS_DIRECT, &["Is Direct"]),
    ColumnSpec::optional(columns::IS_GROWTH_PLAN, &["Is Growth Plan"]),
];

/// Split `scheme_category` into the two reporting levels.
///
/// `"Equity Scheme - Large Cap Fund"` gives `("Equity Scheme", "Large Cap Fund")`.
/// A category without the `" - "` separator keeps its full text as level 2
/// under `"Others"`; a blank second half falls back to level 1.
pub fn category_levels(category: Option<&str>) -> (String, String) {
    let Some(category) = category.filter(|c| !c.trim().is_empty()) else {
        return ("Others".to_string(), "Others".to_string());
    };
    let split = category.split_once(" - ").or_else(|| {
        category
            .trim_end()
            .strip_suffix(" -")
            .map(|head| (head, ""))
    });
    match split {
        Some((head, tail)) => {
            let level1 = level1_for(head);
            let tail = tail.trim();
            let placeholder = matches!(
                tail.to_ascii_lowercase().as_str(),
                "" | "error" | "null" | "na"
            );
            let level2 = if placeholder { level1 } else { tail };
            (level1.to_string(), level2.to_string())
        }
        None => ("Others".to_string(), category.trim().to_string()),
    }
}

fn level1_for(head: &str) -> &'static str {
    let lower = head.trim().to_ascii_lowercase();
    if lower.contains("equity") {
        "Equity Scheme"
    } else if lower.contains("debt") {
        "Debt Scheme"
    } else if lower.contains("hybrid") {
        "Hybrid Scheme"
    } else if lower.contains("other") {
        "Other Scheme"
    } else {
        "Others"
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match clean_text(value)?.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "1" => Some(true),
        "n" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct SchemeRowNormalizer {
    columns: ColumnMap,
}

impl SchemeRowNormalizer {
    pub fn from_header(header: &StringRecord) -> Result<Self, AdapterError> {
        Ok(Self {
            columns: ColumnMap::resolve(header.iter(), SCHEME_COLUMNS)?,
        })
    }

    fn text(&self, row: &StringRecord, column: &str) -> Option<String> {
        self.columns.get(row, column).and_then(clean_text)
    }
}

impl Normalizer for SchemeRowNormalizer {
    type Output = SchemeAttributes;

    fn normalize(&self, row: &StringRecord) -> Result<Option<SchemeAttributes>, AdapterError> {
        let Some(scheme_code) = self.text(row, columns::SCHEME_CODE) else {
            return Ok(None);
        };
        let scheme_category = self.text(row, columns::SCHEME_CATEGORY);
        let (level1, level2) = category_levels(scheme_category.as_deref());
        let date = |column: &str| self.columns.get(row, column).and_then(parse_upstream_date);
        let flag = |column: &str| self.columns.get(row, column).and_then(parse_flag);

        Ok(Some(SchemeAttributes {
            scheme_code,
            scheme_name: self.text(row, columns::SCHEME_NAME),
            amc_name: self.text(row, columns::AMC_NAME),
            scheme_type: self.text(row, columns::SCHEME_TYPE),
            scheme_category,
            scheme_nav_name: self.text(row, columns::SCHEME_NAV_NAME),
            scheme_category_level1: Some(level1),
            scheme_category_level2: Some(level2),
            is_direct: flag(columns::IS_DIRECT),
            is_growth_plan: flag(columns::IS_GROWTH_PLAN),
            launch_date: date(columns::LAUNCH_DATE),
            closure_date: date(columns::CLOSURE_DATE),
            minimum_amount: self
                .columns
                .get(row, columns::MINIMUM_AMOUNT)
                .and_then(parse_number),
            isin_growth: self.text(row, columns::ISIN_GROWTH),
            isin_dividend: self.text(row, columns::ISIN_DIVIDEND),
        }))
    }
}

/// Parse the comma-separated scheme master payload.
pub fn parse_scheme_csv(text: &str) -> Result<(Vec<SchemeAttributes>, ParseStats), AdapterError> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());
    let header = reader.headers()?.clone();
    let normalizer = SchemeRowNormalizer::from_header(&header)?;

    let mut stats = ParseStats::default();
    let mut attrs = Vec::new();
    for row in reader.records() {
        let row = row?;
        stats.rows_read += 1;
        if row.iter().all(|cell| cell.is_empty()) {
            stats.separator_rows += 1;
            continue;
        }
        let outcome = normalizer.normalize(&row)?;
        stats.merge_outcome(&outcome);
        attrs.extend(outcome);
    }
    Ok((attrs, stats))
}
