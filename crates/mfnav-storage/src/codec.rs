//! Arrow/Parquet encoding of the persisted tables.
//!
//! Decoding looks columns up by name and checks their Arrow type, so a file
//! written with a different layout fails with [`MergeError::Schema`] instead
//! of being coerced.

use std::str::FromStr;
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, RecordBatch, StringArray,
};
use arrow_schema::{ArrowError, DataType, Field, Schema, SchemaRef};
use bytes::Bytes;
use chrono::{Datelike, NaiveDate};
use mfnav_core::{columns, MergeError, NavRecord, SchemeAttributes, SchemeMasterRecord};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use thiserror::Error;

/// `NaiveDate::num_days_from_ce` of 1970-01-01, the Date32 origin.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Schema(#[from] MergeError),
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),
    #[error("unknown parquet compression `{0}` (expected snappy, zstd or none)")]
    UnknownCompression(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParquetCompression {
    #[default]
    Snappy,
    Zstd,
    Uncompressed,
}

impl ParquetCompression {
    fn codec(self) -> Compression {
        match self {
            Self::Snappy => Compression::SNAPPY,
            Self::Zstd => Compression::ZSTD(Default::default()),
            Self::Uncompressed => Compression::UNCOMPRESSED,
        }
    }
}

impl FromStr for ParquetCompression {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snappy" => Ok(Self::Snappy),
            "zstd" => Ok(Self::Zstd),
            "none" | "uncompressed" => Ok(Self::Uncompressed),
            other => Err(StorageError::UnknownCompression(other.to_string())),
        }
    }
}

pub fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

pub fn encode_parquet(
    batch: &RecordBatch,
    compression: ParquetCompression,
) -> Result<Vec<u8>, StorageError> {
    let props = WriterProperties::builder()
        .set_compression(compression.codec())
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

pub fn decode_parquet(bytes: Vec<u8>) -> Result<Vec<RecordBatch>, StorageError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?.build()?;
    let batches = reader.collect::<Result<Vec<_>, ArrowError>>()?;
    Ok(batches)
}

// ---------------------------------------------------------------------------
// NAV facts
// ---------------------------------------------------------------------------

pub fn nav_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(columns::SCHEME_CODE, DataType::Utf8, false),
        Field::new(columns::DATE, DataType::Date32, false),
        Field::new(columns::NAV, DataType::Float64, false),
        Field::new(columns::ISIN_GROWTH, DataType::Utf8, true),
        Field::new(columns::ISIN_DIVIDEND, DataType::Utf8, true),
        Field::new(columns::SCHEME_NAME, DataType::Utf8, true),
        Field::new(columns::REPURCHASE_PRICE, DataType::Float64, true),
        Field::new(columns::SALE_PRICE, DataType::Float64, true),
    ]))
}

pub fn nav_records_to_batch(records: &[NavRecord]) -> Result<RecordBatch, StorageError> {
    let scheme_codes = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.scheme_code.as_str()))
            .collect::<Vec<_>>(),
    );
    let dates = Date32Array::from(
        records
            .iter()
            .map(|r| Some(date_to_days(r.date)))
            .collect::<Vec<_>>(),
    );
    let navs = Float64Array::from(records.iter().map(|r| Some(r.nav)).collect::<Vec<_>>());
    let isin_growth = StringArray::from(
        records
            .iter()
            .map(|r| r.isin_growth.as_deref())
            .collect::<Vec<_>>(),
    );
    let isin_dividend = StringArray::from(
        records
            .iter()
            .map(|r| r.isin_dividend.as_deref())
            .collect::<Vec<_>>(),
    );
    let scheme_names = StringArray::from(
        records
            .iter()
            .map(|r| r.scheme_name.as_deref())
            .collect::<Vec<_>>(),
    );
    let repurchase = Float64Array::from(
        records
            .iter()
            .map(|r| r.repurchase_price)
            .collect::<Vec<_>>(),
    );
    let sale = Float64Array::from(records.iter().map(|r| r.sale_price).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        nav_schema(),
        vec![
            Arc::new(scheme_codes),
            Arc::new(dates),
            Arc::new(navs),
            Arc::new(isin_growth),
            Arc::new(isin_dividend),
            Arc::new(scheme_names),
            Arc::new(repurchase),
            Arc::new(sale),
        ],
    )?;
    Ok(batch)
}

/// Newest `date` in an encoded NAV table. Only the date column is read.
pub fn max_nav_date(bytes: Vec<u8>, partition: &str) -> Result<Option<NaiveDate>, StorageError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?;
    let idx = builder.schema().index_of(columns::DATE).map_err(|_| {
        MergeError::schema(partition, format!("missing required column `{}`", columns::DATE))
    })?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), [idx]);
    let reader = builder.with_projection(mask).build()?;

    let mut latest: Option<i32> = None;
    for batch in reader {
        let batch = batch?;
        let dates = required::<Date32Array>(&batch, partition, columns::DATE, DataType::Date32)?;
        if dates.null_count() > 0 {
            return Err(MergeError::schema(
                partition,
                format!("null in required column `{}`", columns::DATE),
            )
            .into());
        }
        latest = latest.max(dates.values().iter().copied().max());
    }
    match latest {
        None => Ok(None),
        Some(days) => days_to_date(days).map(Some).ok_or_else(|| {
            MergeError::schema(partition, format!("date out of range in `{}`", columns::DATE))
                .into()
        }),
    }
}

pub fn nav_records_from_batch(
    batch: &RecordBatch,
    partition: &str,
) -> Result<Vec<NavRecord>, MergeError> {
    let scheme_code = required::<StringArray>(batch, partition, columns::SCHEME_CODE, DataType::Utf8)?;
    let date = required::<Date32Array>(batch, partition, columns::DATE, DataType::Date32)?;
    let nav = required::<Float64Array>(batch, partition, columns::NAV, DataType::Float64)?;
    let isin_growth = optional::<StringArray>(batch, partition, columns::ISIN_GROWTH, DataType::Utf8)?;
    let isin_dividend =
        optional::<StringArray>(batch, partition, columns::ISIN_DIVIDEND, DataType::Utf8)?;
    let scheme_name = optional::<StringArray>(batch, partition, columns::SCHEME_NAME, DataType::Utf8)?;
    let repurchase =
        optional::<Float64Array>(batch, partition, columns::REPURCHASE_PRICE, DataType::Float64)?;
    let sale = optional::<Float64Array>(batch, partition, columns::SALE_PRICE, DataType::Float64)?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        records.push(NavRecord {
            scheme_code: required_str(scheme_code, partition, columns::SCHEME_CODE, i)?,
            date: required_date(date, partition, columns::DATE, i)?,
            nav: required_f64(nav, partition, columns::NAV, i)?,
            isin_growth: opt_str(isin_growth, i),
            isin_dividend: opt_str(isin_dividend, i),
            scheme_name: opt_str(scheme_name, i),
            repurchase_price: opt_f64(repurchase, i),
            sale_price: opt_f64(sale, i),
        });
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Scheme snapshots and masterdata
// ---------------------------------------------------------------------------

fn attribute_fields() -> Vec<Field> {
    vec![
        Field::new(columns::SCHEME_CODE, DataType::Utf8, false),
        Field::new(columns::SCHEME_NAME, DataType::Utf8, true),
        Field::new(columns::AMC_NAME, DataType::Utf8, true),
        Field::new(columns::SCHEME_TYPE, DataType::Utf8, true),
        Field::new(columns::SCHEME_CATEGORY, DataType::Utf8, true),
        Field::new(columns::SCHEME_NAV_NAME, DataType::Utf8, true),
        Field::new(columns::SCHEME_CATEGORY_LEVEL1, DataType::Utf8, true),
        Field::new(columns::SCHEME_CATEGORY_LEVEL2, DataType::Utf8, true),
        Field::new(columns::IS_DIRECT, DataType::Boolean, true),
        Field::new(columns::IS_GROWTH_PLAN, DataType::Boolean, true),
        Field::new(columns::LAUNCH_DATE, DataType::Date32, true),
        Field::new(columns::CLOSURE_DATE, DataType::Date32, true),
        Field::new(columns::MINIMUM_AMOUNT, DataType::Float64, true),
        Field::new(columns::ISIN_GROWTH, DataType::Utf8, true),
        Field::new(columns::ISIN_DIVIDEND, DataType::Utf8, true),
    ]
}

fn attribute_arrays<'a>(attrs: &[&'a SchemeAttributes]) -> Vec<ArrayRef> {
    fn text<'a>(
        attrs: &[&'a SchemeAttributes],
        get: impl Fn(&'a SchemeAttributes) -> Option<&'a str>,
    ) -> ArrayRef {
        Arc::new(StringArray::from(
            attrs.iter().map(|&a| get(a)).collect::<Vec<_>>(),
        ))
    }
    fn flag(attrs: &[&SchemeAttributes], get: impl Fn(&SchemeAttributes) -> Option<bool>) -> ArrayRef {
        Arc::new(BooleanArray::from(
            attrs.iter().map(|&a| get(a)).collect::<Vec<_>>(),
        ))
    }
    fn day(
        attrs: &[&SchemeAttributes],
        get: impl Fn(&SchemeAttributes) -> Option<NaiveDate>,
    ) -> ArrayRef {
        Arc::new(Date32Array::from(
            attrs
                .iter()
                .map(|&a| get(a).map(date_to_days))
                .collect::<Vec<_>>(),
        ))
    }

    vec![
        text(attrs, |a| Some(a.scheme_code.as_str())),
        text(attrs, |a| a.scheme_name.as_deref()),
        text(attrs, |a| a.amc_name.as_deref()),
        text(attrs, |a| a.scheme_type.as_deref()),
        text(attrs, |a| a.scheme_category.as_deref()),
        text(attrs, |a| a.scheme_nav_name.as_deref()),
        text(attrs, |a| a.scheme_category_level1.as_deref()),
        text(attrs, |a| a.scheme_category_level2.as_deref()),
        flag(attrs, |a| a.is_direct),
        flag(attrs, |a| a.is_growth_plan),
        day(attrs, |a| a.launch_date),
        day(attrs, |a| a.closure_date),
        Arc::new(Float64Array::from(
            attrs.iter().map(|a| a.minimum_amount).collect::<Vec<_>>(),
        )),
        text(attrs, |a| a.isin_growth.as_deref()),
        text(attrs, |a| a.isin_dividend.as_deref()),
    ]
}

pub fn snapshot_schema() -> SchemaRef {
    Arc::new(Schema::new(attribute_fields()))
}

pub fn masterdata_schema() -> SchemaRef {
    let mut fields = attribute_fields();
    fields.extend([
        Field::new(columns::FIRST_SEEN_DATE, DataType::Date32, false),
        Field::new(columns::LAST_SEEN_DATE, DataType::Date32, false),
        Field::new(columns::IS_ACTIVE, DataType::Boolean, false),
        Field::new(columns::ATTRIBUTE_LAST_UPDATED, DataType::Date32, false),
    ]);
    Arc::new(Schema::new(fields))
}

pub fn scheme_attributes_to_batch(attrs: &[SchemeAttributes]) -> Result<RecordBatch, StorageError> {
    let refs = attrs.iter().collect::<Vec<_>>();
    let batch = RecordBatch::try_new(snapshot_schema(), attribute_arrays(&refs))?;
    Ok(batch)
}

pub fn master_records_to_batch(records: &[SchemeMasterRecord]) -> Result<RecordBatch, StorageError> {
    let refs = records.iter().map(|r| &r.attributes).collect::<Vec<_>>();
    let mut arrays = attribute_arrays(&refs);
    let lifecycle_date = |get: fn(&SchemeMasterRecord) -> NaiveDate| -> ArrayRef {
        Arc::new(Date32Array::from(
            records
                .iter()
                .map(|r| Some(date_to_days(get(r))))
                .collect::<Vec<_>>(),
        ))
    };
    arrays.push(lifecycle_date(|r| r.first_seen_date));
    arrays.push(lifecycle_date(|r| r.last_seen_date));
    arrays.push(Arc::new(BooleanArray::from(
        records.iter().map(|r| Some(r.is_active)).collect::<Vec<_>>(),
    )));
    arrays.push(lifecycle_date(|r| r.attribute_last_updated));

    let batch = RecordBatch::try_new(masterdata_schema(), arrays)?;
    Ok(batch)
}

pub fn scheme_attributes_from_batch(
    batch: &RecordBatch,
    partition: &str,
) -> Result<Vec<SchemeAttributes>, MergeError> {
    let text = |name: &str| optional::<StringArray>(batch, partition, name, DataType::Utf8);
    let flag = |name: &str| optional::<BooleanArray>(batch, partition, name, DataType::Boolean);
    let day = |name: &str| optional::<Date32Array>(batch, partition, name, DataType::Date32);

    let scheme_code = required::<StringArray>(batch, partition, columns::SCHEME_CODE, DataType::Utf8)?;
    let scheme_name = text(columns::SCHEME_NAME)?;
    let amc_name = text(columns::AMC_NAME)?;
    let scheme_type = text(columns::SCHEME_TYPE)?;
    let scheme_category = text(columns::SCHEME_CATEGORY)?;
    let scheme_nav_name = text(columns::SCHEME_NAV_NAME)?;
    let level1 = text(columns::SCHEME_CATEGORY_LEVEL1)?;
    let level2 = text(columns::SCHEME_CATEGORY_LEVEL2)?;
    let is_direct = flag(columns::IS_DIRECT)?;
    let is_growth_plan = flag(columns::IS_GROWTH_PLAN)?;
    let launch_date = day(columns::LAUNCH_DATE)?;
    let closure_date = day(columns::CLOSURE_DATE)?;
    let minimum_amount =
        optional::<Float64Array>(batch, partition, columns::MINIMUM_AMOUNT, DataType::Float64)?;
    let isin_growth = text(columns::ISIN_GROWTH)?;
    let isin_dividend = text(columns::ISIN_DIVIDEND)?;

    let mut attrs = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        attrs.push(SchemeAttributes {
            scheme_code: required_str(scheme_code, partition, columns::SCHEME_CODE, i)?,
            scheme_name: opt_str(scheme_name, i),
            amc_name: opt_str(amc_name, i),
            scheme_type: opt_str(scheme_type, i),
            scheme_category: opt_str(scheme_category, i),
            scheme_nav_name: opt_str(scheme_nav_name, i),
            scheme_category_level1: opt_str(level1, i),
            scheme_category_level2: opt_str(level2, i),
            is_direct: opt_bool(is_direct, i),
            is_growth_plan: opt_bool(is_growth_plan, i),
            launch_date: opt_date(launch_date, i),
            closure_date: opt_date(closure_date, i),
            minimum_amount: opt_f64(minimum_amount, i),
            isin_growth: opt_str(isin_growth, i),
            isin_dividend: opt_str(isin_dividend, i),
        });
    }
    Ok(attrs)
}

pub fn master_records_from_batch(
    batch: &RecordBatch,
    partition: &str,
) -> Result<Vec<SchemeMasterRecord>, MergeError> {
    let attrs = scheme_attributes_from_batch(batch, partition)?;
    let first_seen =
        required::<Date32Array>(batch, partition, columns::FIRST_SEEN_DATE, DataType::Date32)?;
    let last_seen =
        required::<Date32Array>(batch, partition, columns::LAST_SEEN_DATE, DataType::Date32)?;
    let is_active =
        required::<BooleanArray>(batch, partition, columns::IS_ACTIVE, DataType::Boolean)?;
    let updated = required::<Date32Array>(
        batch,
        partition,
        columns::ATTRIBUTE_LAST_UPDATED,
        DataType::Date32,
    )?;

    attrs
        .into_iter()
        .enumerate()
        .map(|(i, attributes)| {
            if is_active.is_null(i) {
                return Err(null_in_required(partition, columns::IS_ACTIVE, i));
            }
            Ok(SchemeMasterRecord {
                attributes,
                first_seen_date: required_date(first_seen, partition, columns::FIRST_SEEN_DATE, i)?,
                last_seen_date: required_date(last_seen, partition, columns::LAST_SEEN_DATE, i)?,
                is_active: is_active.value(i),
                attribute_last_updated: required_date(
                    updated,
                    partition,
                    columns::ATTRIBUTE_LAST_UPDATED,
                    i,
                )?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Column access helpers
// ---------------------------------------------------------------------------

fn optional<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    partition: &str,
    name: &str,
    expected: DataType,
) -> Result<Option<&'a T>, MergeError> {
    let Some(array) = batch.column_by_name(name) else {
        return Ok(None);
    };
    if array.data_type() != &expected {
        return Err(MergeError::schema(
            partition,
            format!(
                "column `{name}` has type {}, expected {expected}",
                array.data_type()
            ),
        ));
    }
    array
        .as_any()
        .downcast_ref::<T>()
        .map(Some)
        .ok_or_else(|| {
            MergeError::schema(partition, format!("column `{name}` could not be read as {expected}"))
        })
}

fn required<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    partition: &str,
    name: &str,
    expected: DataType,
) -> Result<&'a T, MergeError> {
    optional::<T>(batch, partition, name, expected)?
        .ok_or_else(|| MergeError::schema(partition, format!("missing required column `{name}`")))
}

fn null_in_required(partition: &str, name: &str, row: usize) -> MergeError {
    MergeError::schema(partition, format!("null in required column `{name}` at row {row}"))
}

fn required_str(array: &StringArray, partition: &str, name: &str, i: usize) -> Result<String, MergeError> {
    if array.is_null(i) {
        return Err(null_in_required(partition, name, i));
    }
    Ok(array.value(i).to_string())
}

fn required_f64(array: &Float64Array, partition: &str, name: &str, i: usize) -> Result<f64, MergeError> {
    if array.is_null(i) {
        return Err(null_in_required(partition, name, i));
    }
    Ok(array.value(i))
}

fn required_date(
    array: &Date32Array,
    partition: &str,
    name: &str,
    i: usize,
) -> Result<NaiveDate, MergeError> {
    if array.is_null(i) {
        return Err(null_in_required(partition, name, i));
    }
    days_to_date(array.value(i)).ok_or_else(|| {
        MergeError::schema(partition, format!("date out of range in `{name}` at row {i}"))
    })
}

fn opt_str(array: Option<&StringArray>, i: usize) -> Option<String> {
    array
        .filter(|a| a.is_valid(i))
        .map(|a| a.value(i).to_string())
}

fn opt_f64(array: Option<&Float64Array>, i: usize) -> Option<f64> {
    array.filter(|a| a.is_valid(i)).map(|a| a.value(i))
}

fn opt_bool(array: Option<&BooleanArray>, i: usize) -> Option<bool> {
    array.filter(|a| a.is_valid(i)).map(|a| a.value(i))
}

fn opt_date(array: Option<&Date32Array>, i: usize) -> Option<NaiveDate> {
    array
        .filter(|a| a.is_valid(i))
        .and_then(|a| days_to_date(a.value(i)))
}
