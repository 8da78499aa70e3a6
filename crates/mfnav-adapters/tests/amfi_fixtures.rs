use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use mfnav_adapters::{parse_nav_text, parse_scheme_csv};
use mfnav_core::NavBounds;

fn fixture(name: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/amfi")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

#[test]
fn daily_navall_fixture_normalizes() {
    let (records, stats) = parse_nav_text(
        &fixture("NAVAll_sample.txt"),
        Some(d(2024, 1, 5)),
        NavBounds::default(),
    )
    .expect("parse daily fixture");

    assert_eq!(stats.rows_read, 10);
    assert_eq!(stats.separator_rows, 4);
    assert_eq!(stats.skipped_rows, 2);
    assert_eq!(stats.records, 4);

    let codes: Vec<&str> = records.iter().map(|r| r.scheme_code.as_str()).collect();
    assert_eq!(codes, vec!["119551", "119552", "120465", "120466"]);
    assert!(records.iter().all(|r| r.date == d(2024, 1, 5)));
    assert!(records.iter().all(|r| r.sale_price == Some(r.nav)));
    assert_eq!(records[1].isin_dividend, None);
}

#[test]
fn history_fixture_keeps_row_dates() {
    let (records, stats) = parse_nav_text(
        &fixture("nav_history_sample.txt"),
        None,
        NavBounds::default(),
    )
    .expect("parse history fixture");

    assert_eq!(stats.records, 5);
    assert_eq!(stats.separator_rows, 2);
    let third = records
        .iter()
        .find(|r| r.scheme_code == "120465" && r.date == d(2024, 1, 3))
        .expect("120465 on 2024-01-03");
    assert_eq!(third.nav, 56.55);
    assert_eq!(third.repurchase_price, Some(56.00));
    assert_eq!(third.sale_price, Some(56.90));
    assert_eq!(
        third.scheme_name.as_deref(),
        Some("Axis Bluechip Fund - Direct Plan - Growth")
    );
}

#[test]
fn scheme_fixture_normalizes_with_category_levels() {
    let (attrs, stats) =
        parse_scheme_csv(&fixture("scheme_data_sample.csv")).expect("parse scheme fixture");
    assert_eq!(stats.records, 5);
    assert_eq!(attrs.len(), 5);

    let axis = attrs.iter().find(|a| a.scheme_code == "120465").unwrap();
    assert_eq!(axis.minimum_amount, Some(5000.0));
    assert_eq!(axis.scheme_category_level1.as_deref(), Some("Equity Scheme"));
    assert_eq!(axis.scheme_category_level2.as_deref(), Some("Large Cap Fund"));

    let idcw = attrs.iter().find(|a| a.scheme_code == "120466").unwrap();
    assert_eq!(idcw.launch_date, Some(d(2013, 1, 1)));

    let closed = attrs.iter().find(|a| a.scheme_code == "149999").unwrap();
    assert_eq!(closed.launch_date, None);
    assert_eq!(closed.closure_date, Some(d(2030, 3, 15)));
    assert_eq!(closed.scheme_category_level1.as_deref(), Some("Others"));
    assert_eq!(closed.scheme_category_level2.as_deref(), Some("Income"));
}
