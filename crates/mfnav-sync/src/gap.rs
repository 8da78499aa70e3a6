//! Weekday gap calculation between the fact table and "today".

use chrono::{Datelike, NaiveDate, Weekday};
use mfnav_core::NavRecord;

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Weekdays after `latest_known` up to and including `today`, ascending.
///
/// With no local data the only candidate is `today` itself. A latest date on
/// or after `today` yields nothing.
pub fn missing_dates(latest_known: Option<NaiveDate>, today: NaiveDate) -> Vec<NaiveDate> {
    let Some(latest) = latest_known else {
        return vec![today];
    };
    latest
        .iter_days()
        .skip(1)
        .take_while(|day| *day <= today)
        .filter(|day| !is_weekend(*day))
        .collect()
}

pub fn latest_date(records: &[NavRecord]) -> Option<NaiveDate> {
    records.iter().map(|r| r.date).max()
}
