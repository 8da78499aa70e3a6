//! Non-destructive scheme masterdata merge.
//!
//! Every scheme ever observed stays in the table. Each run classifies codes
//! as New, Existing or Missing against the previous master and updates the
//! lifecycle columns; `first_seen_date` is written exactly once.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use mfnav_core::{MergeClass, MergeError, MergeResult, SchemeAttributes, SchemeMasterRecord};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub new: usize,
    pub existing: usize,
    pub missing: usize,
    /// Existing codes that were inactive before this run.
    pub reactivated: usize,
    /// Snapshot rows dropped because a later row had the same code.
    pub snapshot_duplicates: usize,
    pub active: usize,
    pub inactive: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterdataMerge {
    /// Sorted by `scheme_code`.
    pub records: Vec<SchemeMasterRecord>,
    pub classes: BTreeMap<String, MergeClass>,
    pub summary: MergeSummary,
}

impl MasterdataMerge {
    pub fn class_of(&self, scheme_code: &str) -> Option<MergeClass> {
        self.classes.get(scheme_code).copied()
    }
}

/// First-seen date for a scheme observed for the first time on `as_of`.
fn first_seen_for(attrs: &SchemeAttributes, as_of: NaiveDate) -> NaiveDate {
    attrs
        .launch_date
        .filter(|launch| *launch <= as_of)
        .unwrap_or(as_of)
}

fn bootstrap(attrs: &SchemeAttributes, as_of: NaiveDate) -> SchemeMasterRecord {
    SchemeMasterRecord {
        attributes: attrs.clone(),
        first_seen_date: first_seen_for(attrs, as_of),
        last_seen_date: as_of,
        is_active: true,
        attribute_last_updated: as_of,
    }
}

fn refresh(
    prev: &SchemeMasterRecord,
    attrs: &SchemeAttributes,
    as_of: NaiveDate,
) -> SchemeMasterRecord {
    if as_of < prev.attribute_last_updated {
        // Older snapshot than the one already applied: keep the newer state.
        return SchemeMasterRecord {
            is_active: true,
            ..prev.clone()
        };
    }
    SchemeMasterRecord {
        attributes: attrs.clone(),
        first_seen_date: prev.first_seen_date,
        last_seen_date: prev.last_seen_date.max(as_of),
        is_active: true,
        attribute_last_updated: as_of,
    }
}

/// Index the snapshot by code; a repeated code keeps its last row.
fn index_snapshot(
    latest: &[SchemeAttributes],
) -> MergeResult<(BTreeMap<&str, &SchemeAttributes>, usize)> {
    let mut by_code = BTreeMap::new();
    let mut duplicates = 0usize;
    for (row, attrs) in latest.iter().enumerate() {
        if attrs.scheme_code.trim().is_empty() {
            return Err(MergeError::schema(
                "scheme snapshot",
                format!("row {row}: blank scheme_code"),
            ));
        }
        if by_code.insert(attrs.scheme_code.as_str(), attrs).is_some() {
            duplicates += 1;
        }
    }
    if duplicates > 0 {
        warn!(duplicates, "scheme snapshot repeats codes; keeping last occurrence");
    }
    Ok((by_code, duplicates))
}

fn index_master(
    existing: &[SchemeMasterRecord],
) -> MergeResult<BTreeMap<&str, &SchemeMasterRecord>> {
    let mut by_code = BTreeMap::new();
    for record in existing {
        if by_code.insert(record.scheme_code(), record).is_some() {
            return Err(MergeError::UniquenessViolation {
                key: record.scheme_code().to_string(),
            });
        }
    }
    Ok(by_code)
}

/// Reconcile `latest` against the persisted master as of `as_of`.
///
/// Without an existing master every snapshot row is New. The result holds
/// |existing| + |new| rows.
pub fn merge_masterdata(
    existing: Option<&[SchemeMasterRecord]>,
    latest: &[SchemeAttributes],
    as_of: NaiveDate,
) -> MergeResult<MasterdataMerge> {
    if latest.is_empty() {
        return Err(MergeError::EmptyInput("scheme snapshot has no rows".to_string()));
    }
    let (snapshot, snapshot_duplicates) = index_snapshot(latest)?;
    let master = index_master(existing.unwrap_or_default())?;

    let mut summary = MergeSummary {
        snapshot_duplicates,
        ..Default::default()
    };
    let mut merged: BTreeMap<&str, SchemeMasterRecord> = BTreeMap::new();
    let mut classes = BTreeMap::new();

    for (&code, &prev) in &master {
        let (class, record) = match snapshot.get(code) {
            Some(&attrs) => {
                summary.existing += 1;
                if !prev.is_active {
                    summary.reactivated += 1;
                }
                (MergeClass::Existing, refresh(prev, attrs, as_of))
            }
            None => {
                summary.missing += 1;
                let record = SchemeMasterRecord {
                    is_active: false,
                    ..prev.clone()
                };
                (MergeClass::Missing, record)
            }
        };
        classes.insert(code.to_string(), class);
        merged.insert(code, record);
    }

    for (&code, &attrs) in &snapshot {
        if master.contains_key(code) {
            continue;
        }
        summary.new += 1;
        classes.insert(code.to_string(), MergeClass::New);
        merged.insert(code, bootstrap(attrs, as_of));
    }

    let records: Vec<SchemeMasterRecord> = merged.into_values().collect();
    summary.active = records.iter().filter(|r| r.is_active).count();
    summary.inactive = records.len() - summary.active;

    info!(
        %as_of,
        new = summary.new,
        existing = summary.existing,
        missing = summary.missing,
        reactivated = summary.reactivated,
        total = records.len(),
        "merged scheme masterdata"
    );
    Ok(MasterdataMerge {
        records,
        classes,
        summary,
    })
}
