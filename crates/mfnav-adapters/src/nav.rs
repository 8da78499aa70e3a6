use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use mfnav_core::{columns, NavBounds, NavRecord};
use tracing::{debug, warn};

use crate::columns::{ColumnMap, ColumnSpec};
use crate::{clean_text, parse_number, AdapterError, Normalizer, ParseStats};

/// Both AMFI NAV layouts: the 6-column `NAVAll.txt` and the 8-column history
/// report. The price columns only exist in the latter.
pub const NAV_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::required(columns::SCHEME_CODE, &["Scheme Code"]),
    ColumnSpec::optional(columns::SCHEME_NAME, &["Scheme Name"]),
    ColumnSpec::optional(
        columns::ISIN_GROWTH,
        &["ISIN Div Payout/ ISIN Growth", "ISIN Growth"],
    ),
    ColumnSpec::optional(
        columns::ISIN_DIVIDEND,
        &["ISIN Div Reinvestment", "ISIN Dividend"],
    ),
    ColumnSpec::required(columns::NAV, &["Net Asset Value", "NAV"]),
    ColumnSpec::optional(columns::REPURCHASE_PRICE, &["Repurchase Price"]),
    ColumnSpec::optional(columns::SALE_PRICE, &["Sale Price"]),
    ColumnSpec::required(columns::DATE, &["Date", "NAV Date"]),
];

const DATE_FORMATS: &[&str] = &["%d-%b-%Y", "%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%d %b %Y"];

/// Parse a day-first upstream date.
pub(crate) fn parse_upstream_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

#[derive(Debug, Clone)]
pub struct NavRowNormalizer {
    columns: ColumnMap,
    bounds: NavBounds,
    nav_date: Option<NaiveDate>,
}

impl NavRowNormalizer {
    /// `nav_date` pins every record to the requested publication date, which
    /// is how the daily file is labelled. History rows carry their own date.
    pub fn new(columns: ColumnMap, bounds: NavBounds, nav_date: Option<NaiveDate>) -> Self {
        Self {
            columns,
            bounds,
            nav_date,
        }
    }

    pub fn from_header(
        header: &StringRecord,
        bounds: NavBounds,
        nav_date: Option<NaiveDate>,
    ) -> Result<Self, AdapterError> {
        let columns = ColumnMap::resolve(header.iter(), NAV_COLUMNS)?;
        Ok(Self::new(columns, bounds, nav_date))
    }

    pub fn columns(&self) -> &ColumnMap {
        &self.columns
    }

    fn text(&self, row: &StringRecord, column: &str) -> Option<String> {
        self.columns.get(row, column).and_then(clean_text)
    }

    fn number(&self, row: &StringRecord, column: &str) -> Option<f64> {
        self.columns.get(row, column).and_then(parse_number)
    }
}

impl Normalizer for NavRowNormalizer {
    type Output = NavRecord;

    fn normalize(&self, row: &StringRecord) -> Result<Option<NavRecord>, AdapterError> {
        let Some(scheme_code) = self.text(row, columns::SCHEME_CODE) else {
            return Ok(None);
        };
        let Some(nav) = self.number(row, columns::NAV) else {
            return Ok(None);
        };
        if !self.bounds.contains(nav) {
            debug!(scheme_code = %scheme_code, nav, "nav outside valid range");
            return Ok(None);
        }

        let date = match self.nav_date {
            Some(date) => date,
            None => {
                let raw = self.columns.get(row, columns::DATE).unwrap_or_default();
                match parse_upstream_date(raw) {
                    Some(date) => date,
                    None => {
                        warn!(
                            line = row.position().map(|p| p.line()).unwrap_or_default(),
                            scheme_code = %scheme_code,
                            value = raw,
                            "history row without a usable date"
                        );
                        return Ok(None);
                    }
                }
            }
        };

        Ok(Some(NavRecord {
            scheme_code,
            date,
            nav,
            isin_growth: self.text(row, columns::ISIN_GROWTH),
            isin_dividend: self.text(row, columns::ISIN_DIVIDEND),
            scheme_name: self.text(row, columns::SCHEME_NAME),
            repurchase_price: self.number(row, columns::REPURCHASE_PRICE).or(Some(nav)),
            sale_price: self.number(row, columns::SALE_PRICE).or(Some(nav)),
        }))
    }
}

/// Parse a semicolon-separated AMFI NAV payload.
///
/// Pass `nav_date` for the daily file; `None` reads each row's own date
/// (history report). Rows narrower than the header are AMC/category lines.
pub fn parse_nav_text(
    text: &str,
    nav_date: Option<NaiveDate>,
    bounds: NavBounds,
) -> Result<(Vec<NavRecord>, ParseStats), AdapterError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .quoting(false)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let header = reader.headers()?.clone();
    let normalizer = NavRowNormalizer::from_header(&header, bounds, nav_date)?;
    let width = normalizer.columns().width();

    let mut stats = ParseStats::default();
    let mut records = Vec::new();
    let mut off_date_rows = 0usize;
    for row in reader.records() {
        let row = row?;
        stats.rows_read += 1;
        if row.len() < width {
            stats.separator_rows += 1;
            continue;
        }
        let outcome = normalizer.normalize(&row)?;
        stats.merge_outcome(&outcome);
        if let (Some(record), Some(expected)) = (&outcome, nav_date) {
            let published = normalizer
                .columns()
                .get(&row, columns::DATE)
                .and_then(parse_upstream_date);
            if published.is_some_and(|d| d != expected) {
                off_date_rows += 1;
                debug!(scheme_code = %record.scheme_code, ?published, "published date differs");
            }
        }
        if let Some(record) = outcome {
            records.push(record);
        }
    }

    if off_date_rows > 0 {
        warn!(
            off_date_rows,
            nav_date = ?nav_date,
            "daily file carries rows published for another date"
        );
    }
    Ok((records, stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    const DAILY: &str = "\
Scheme Code;ISIN Div Payout/ ISIN Growth;ISIN Div Reinvestment;Scheme Name;Net Asset Value;Date

Open Ended Schemes(Debt Scheme - Banking and PSU Fund)

Alpha Mutual Fund

119551;INF209KA12Z1;INF209KA13Z9;Alpha Banking & PSU Debt Fund - Direct Plan-IDCW;105.1234;05-Jan-2024
119552;INF209KA14Z7;-;Alpha Banking & PSU Debt Fund - Growth;N.A.;05-Jan-2024
119553;;;Alpha Liquid Fund;0.0001;05-Jan-2024
";

    #[test]
    fn daily_rows_are_pinned_to_nav_date_and_priced_at_nav() {
        let (records, stats) =
            parse_nav_text(DAILY, Some(d(2024, 1, 8)), NavBounds::default()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.scheme_code, "119551");
        assert_eq!(record.date, d(2024, 1, 8));
        assert_eq!(record.nav, 105.1234);
        assert_eq!(record.isin_growth.as_deref(), Some("INF209KA12Z1"));
        assert_eq!(record.repurchase_price, Some(105.1234));
        assert_eq!(record.sale_price, Some(105.1234));

        assert_eq!(stats.rows_read, 5);
        assert_eq!(stats.separator_rows, 2);
        assert_eq!(stats.skipped_rows, 2);
        assert_eq!(stats.records, 1);
    }

    #[test]
    fn history_rows_keep_their_own_dates_and_prices() {
        let text = "\
Scheme Code;Scheme Name;ISIN Div Payout/ISIN Growth;ISIN Div Reinvestment;Net Asset Value;Repurchase Price;Sale Price;Date
100027;Beta Growth Fund;INF200K01180;;24.5;24.2;;02-Jan-2024
";
        let (records, _) = parse_nav_text(text, None, NavBounds::default()).unwrap();
        assert_eq!(records[0].date, d(2024, 1, 2));
        assert_eq!(records[0].repurchase_price, Some(24.2));
        assert_eq!(records[0].sale_price, Some(24.5));
        assert_eq!(records[0].isin_dividend, None);
    }

    #[test]
    fn undated_history_rows_are_skipped_and_neighbours_kept() {
        let text = "\
Scheme Code;Scheme Name;Net Asset Value;Date
100027;Beta Growth Fund;24.5;02-Jan-2024
100028;Gamma Growth Fund;31.0;
100029;Delta Growth Fund;12.25;someday
100030;Epsilon Growth Fund;18.0;03-Jan-2024
";
        let (records, stats) = parse_nav_text(text, None, NavBounds::default()).unwrap();
        let codes: Vec<&str> = records.iter().map(|r| r.scheme_code.as_str()).collect();
        assert_eq!(codes, vec!["100027", "100030"]);
        assert_eq!(records[1].date, d(2024, 1, 3));
        assert_eq!(stats.rows_read, 4);
        assert_eq!(stats.skipped_rows, 2);
        assert_eq!(stats.records, 2);
    }

    #[test]
    fn upstream_dates_accept_several_day_first_layouts() {
        assert_eq!(parse_upstream_date("05-Jan-2024"), Some(d(2024, 1, 5)));
        assert_eq!(parse_upstream_date("05/01/2024"), Some(d(2024, 1, 5)));
        assert_eq!(parse_upstream_date("2024-01-05"), Some(d(2024, 1, 5)));
        assert_eq!(parse_upstream_date(""), None);
    }
}
