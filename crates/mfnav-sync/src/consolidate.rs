//! Fact consolidation: many NAV partitions in, one keyed table out.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use mfnav_core::{MergeError, MergeResult, NavBounds, NavKey, NavPartition, NavRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    pub nav_bounds: NavBounds,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub input_partitions: usize,
    pub skipped_empty_partitions: usize,
    pub input_rows: usize,
    /// Rows that replaced an earlier row with the same key.
    pub duplicates_replaced: usize,
    pub rejected_out_of_range: usize,
    pub output_rows: usize,
    pub distinct_schemes: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consolidated {
    /// Sorted by (`scheme_code`, `date`), one row per key.
    pub records: Vec<NavRecord>,
    pub report: ConsolidationReport,
}

/// Merge `existing` then `new` partitions into one table.
///
/// Later partitions win on a repeated (`scheme_code`, `date`) key. NAVs
/// outside `config.nav_bounds` are dropped before deduplication, so an
/// invalid value never replaces a valid one.
pub fn consolidate(
    existing: Vec<NavPartition>,
    new: Vec<NavPartition>,
    config: &ConsolidationConfig,
) -> MergeResult<Consolidated> {
    let mut report = ConsolidationReport {
        input_partitions: existing.len() + new.len(),
        ..Default::default()
    };
    if report.input_partitions == 0 {
        return Err(MergeError::EmptyInput("no nav partitions supplied".to_string()));
    }

    let mut table: BTreeMap<NavKey, NavRecord> = BTreeMap::new();
    for partition in existing.into_iter().chain(new) {
        if partition.is_empty() {
            warn!(partition = %partition.label, "skipping empty nav partition");
            report.skipped_empty_partitions += 1;
            continue;
        }
        report.input_rows += partition.len();
        let label = partition.label;
        for (row, record) in partition.records.into_iter().enumerate() {
            validate(&label, row, &record)?;
            if !config.nav_bounds.contains(record.nav) {
                report.rejected_out_of_range += 1;
                continue;
            }
            if table.insert(record.key(), record).is_some() {
                report.duplicates_replaced += 1;
            }
        }
        debug!(partition = %label, rows = table.len(), "merged nav partition");
    }

    let records: Vec<NavRecord> = table.into_values().collect();
    if records.is_empty() {
        return Err(MergeError::EmptyInput(
            "consolidated nav table has no rows".to_string(),
        ));
    }
    if let Some(pair) = records.windows(2).find(|w| w[0].key() == w[1].key()) {
        return Err(MergeError::UniquenessViolation {
            key: pair[0].key().to_string(),
        });
    }

    report.output_rows = records.len();
    report.distinct_schemes = records
        .iter()
        .map(|r| r.scheme_code.as_str())
        .collect::<BTreeSet<_>>()
        .len();
    report.first_date = records.iter().map(|r| r.date).min();
    report.last_date = records.iter().map(|r| r.date).max();

    info!(
        input_rows = report.input_rows,
        duplicates_replaced = report.duplicates_replaced,
        rejected = report.rejected_out_of_range,
        output_rows = report.output_rows,
        "consolidated nav partitions"
    );
    Ok(Consolidated { records, report })
}

fn validate(partition: &str, row: usize, record: &NavRecord) -> MergeResult<()> {
    if record.scheme_code.trim().is_empty() {
        return Err(MergeError::schema(
            partition,
            format!("row {row}: blank scheme_code"),
        ));
    }
    if !record.nav.is_finite() {
        return Err(MergeError::schema(
            partition,
            format!("row {row}: non-finite nav for {}", record.key()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn part(label: &str, rows: &[(&str, NaiveDate, f64)]) -> NavPartition {
        NavPartition::new(
            label,
            rows.iter()
                .map(|(code, date, nav)| NavRecord::new(*code, *date, *nav))
                .collect(),
        )
    }

    #[test]
    fn later_partition_wins_on_same_key() {
        let historical = part("batch_01", &[("S1", d(2024, 1, 1), 10.0)]);
        let daily = part("daily_nav_20240101", &[("S1", d(2024, 1, 1), 10.5)]);

        let out = consolidate(vec![historical], vec![daily], &ConsolidationConfig::default())
            .unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].nav, 10.5);
        assert_eq!(out.report.duplicates_replaced, 1);
        assert_eq!(out.report.input_rows, 2);
    }

    #[test]
    fn output_is_sorted_unique_and_reported() {
        let a = part(
            "a",
            &[
                ("S2", d(2024, 1, 2), 20.0),
                ("S1", d(2024, 1, 3), 11.0),
                ("S1", d(2024, 1, 2), 10.0),
            ],
        );
        let b = part("b", &[("S1", d(2024, 1, 3), 11.5), ("S3", d(2024, 1, 1), 5.0)]);

        let out = consolidate(vec![a], vec![b], &ConsolidationConfig::default()).unwrap();
        let keys: Vec<NavKey> = out.records.iter().map(NavRecord::key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(keys, sorted);
        assert_eq!(out.report.output_rows, 4);
        assert_eq!(out.report.distinct_schemes, 3);
        assert_eq!(out.report.first_date, Some(d(2024, 1, 1)));
        assert_eq!(out.report.last_date, Some(d(2024, 1, 3)));
    }

    #[test]
    fn consolidation_is_idempotent() {
        let inputs = || {
            (
                vec![part("h", &[("S1", d(2024, 1, 1), 10.0), ("S2", d(2024, 1, 1), 7.0)])],
                vec![part("n", &[("S1", d(2024, 1, 2), 10.2)])],
            )
        };
        let (e1, n1) = inputs();
        let (e2, n2) = inputs();
        let first = consolidate(e1, n1, &ConsolidationConfig::default()).unwrap();
        let second = consolidate(e2, n2, &ConsolidationConfig::default()).unwrap();
        assert_eq!(first, second);

        // Feeding the output back in as the only existing partition is stable.
        let again = consolidate(
            vec![NavPartition::new("combined", first.records.clone())],
            vec![part("n", &[("S1", d(2024, 1, 2), 10.2)])],
            &ConsolidationConfig::default(),
        )
        .unwrap();
        assert_eq!(again.records, first.records);
    }

    #[test]
    fn out_of_range_navs_are_dropped_and_never_replace_valid_rows() {
        let good = part("h", &[("S1", d(2024, 1, 1), 10.0)]);
        let bad = part("n", &[("S1", d(2024, 1, 1), 0.0), ("S2", d(2024, 1, 1), 20_000.0)]);
        let out = consolidate(vec![good], vec![bad], &ConsolidationConfig::default()).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].nav, 10.0);
        assert_eq!(out.report.rejected_out_of_range, 2);
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let cfg = ConsolidationConfig::default();
        assert!(matches!(
            consolidate(vec![], vec![], &cfg),
            Err(MergeError::EmptyInput(_))
        ));
        assert!(matches!(
            consolidate(vec![part("h", &[])], vec![part("n", &[])], &cfg),
            Err(MergeError::EmptyInput(_))
        ));
    }

    #[test]
    fn empty_partition_is_skipped_not_fatal() {
        let out = consolidate(
            vec![part("h", &[("S1", d(2024, 1, 1), 10.0)])],
            vec![part("n", &[])],
            &ConsolidationConfig::default(),
        )
        .unwrap();
        assert_eq!(out.report.skipped_empty_partitions, 1);
        assert_eq!(out.records.len(), 1);
    }

    #[test]
    fn malformed_records_fail_with_partition_name() {
        let err = consolidate(
            vec![part("batch_02", &[(" ", d(2024, 1, 1), 10.0)])],
            vec![],
            &ConsolidationConfig::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            MergeError::schema("batch_02", "row 0: blank scheme_code")
        );

        let err = consolidate(
            vec![],
            vec![part("daily", &[("S1", d(2024, 1, 1), f64::NAN)])],
            &ConsolidationConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::Schema { partition, .. } if partition == "daily"));
    }
}
