//! Chunk key traits and their implementations for common index types.
//!
//! A chunk key names one unit of fetchable data. The same type is used for
//! the index column of the cached table, so every key type knows how to read
//! itself out of a polars [`Column`] and how to build one.

use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use polars::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// A value identifying one chunk, also used as the table's index value.
pub trait ChunkKey:
    Clone + Ord + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Read every value of an index column. Nulls are an integrity error.
    fn read_index(column: &Column) -> CacheResult<Vec<Self>>;

    /// Build an index column from keys.
    fn to_column(name: &str, keys: &[Self]) -> PolarsResult<Column>;
}

/// A key that advances by a fixed step (timestamps, dates, counters).
pub trait SequentialKey: ChunkKey {
    type Interval: Copy + Debug + Send + Sync + 'static;

    /// `self + by`, or `None` if the result is not representable.
    fn advance(&self, by: Self::Interval) -> Option<Self>;
}

fn index_type_error(column: &Column, expected: &str, err: PolarsError) -> CacheError {
    CacheError::Integrity(format!(
        "index column '{}' is {:?}, expected {expected}: {err}",
        column.name(),
        column.dtype()
    ))
}

fn null_index(column: &Column, row: usize) -> CacheError {
    CacheError::Integrity(format!(
        "null value in index column '{}' at row {row}",
        column.name()
    ))
}

impl ChunkKey for i64 {
    fn read_index(column: &Column) -> CacheResult<Vec<Self>> {
        let ca = column
            .i64()
            .map_err(|e| index_type_error(column, "Int64", e))?;
        ca.into_iter()
            .enumerate()
            .map(|(row, v)| v.ok_or_else(|| null_index(column, row)))
            .collect()
    }

    fn to_column(name: &str, keys: &[Self]) -> PolarsResult<Column> {
        Ok(Column::new(name.into(), keys.to_vec()))
    }
}

impl SequentialKey for i64 {
    type Interval = i64;

    fn advance(&self, by: i64) -> Option<Self> {
        self.checked_add(by)
    }
}

impl ChunkKey for String {
    fn read_index(column: &Column) -> CacheResult<Vec<Self>> {
        let ca = column
            .str()
            .map_err(|e| index_type_error(column, "String", e))?;
        ca.into_iter()
            .enumerate()
            .map(|(row, v)| v.map(str::to_string).ok_or_else(|| null_index(column, row)))
            .collect()
    }

    fn to_column(name: &str, keys: &[Self]) -> PolarsResult<Column> {
        Ok(Column::new(name.into(), keys.to_vec()))
    }
}

fn epoch_date() -> NaiveDate {
    NaiveDate::default()
}

impl ChunkKey for NaiveDate {
    fn read_index(column: &Column) -> CacheResult<Vec<Self>> {
        let ca = column
            .date()
            .map_err(|e| index_type_error(column, "Date", e))?;
        let epoch = epoch_date();
        (0..ca.len())
            .map(|row| {
                let days = ca.get(row).ok_or_else(|| null_index(column, row))?;
                Ok(epoch + TimeDelta::days(days as i64))
            })
            .collect()
    }

    fn to_column(name: &str, keys: &[Self]) -> PolarsResult<Column> {
        let epoch = epoch_date();
        let days: Vec<i32> = keys.iter().map(|d| (*d - epoch).num_days() as i32).collect();
        Column::new(name.into(), days).cast(&DataType::Date)
    }
}

impl SequentialKey for NaiveDate {
    type Interval = TimeDelta;

    fn advance(&self, by: TimeDelta) -> Option<Self> {
        self.checked_add_signed(by)
    }
}

/// Decode a physical datetime value in the column's time unit.
fn datetime_from_physical(value: i64, unit: TimeUnit) -> Option<DateTime<Utc>> {
    match unit {
        TimeUnit::Milliseconds => DateTime::from_timestamp_millis(value),
        TimeUnit::Microseconds => DateTime::from_timestamp_micros(value),
        TimeUnit::Nanoseconds => Some(DateTime::from_timestamp_nanos(value)),
    }
}

fn read_datetimes(column: &Column) -> CacheResult<Vec<DateTime<Utc>>> {
    let ca = column
        .datetime()
        .map_err(|e| index_type_error(column, "Datetime", e))?;
    let unit = ca.time_unit();
    (0..ca.len())
        .map(|row| {
            let raw = ca.get(row).ok_or_else(|| null_index(column, row))?;
            datetime_from_physical(raw, unit).ok_or_else(|| {
                CacheError::Integrity(format!(
                    "index column '{}' holds out-of-range datetime {raw} at row {row}",
                    column.name()
                ))
            })
        })
        .collect()
}

fn datetime_column(name: &str, micros: Vec<i64>) -> PolarsResult<Column> {
    Column::new(name.into(), micros).cast(&DataType::Datetime(TimeUnit::Microseconds, None))
}

impl ChunkKey for DateTime<Utc> {
    fn read_index(column: &Column) -> CacheResult<Vec<Self>> {
        read_datetimes(column)
    }

    fn to_column(name: &str, keys: &[Self]) -> PolarsResult<Column> {
        datetime_column(name, keys.iter().map(|t| t.timestamp_micros()).collect())
    }
}

impl SequentialKey for DateTime<Utc> {
    type Interval = TimeDelta;

    fn advance(&self, by: TimeDelta) -> Option<Self> {
        self.checked_add_signed(by)
    }
}

impl ChunkKey for NaiveDateTime {
    fn read_index(column: &Column) -> CacheResult<Vec<Self>> {
        Ok(read_datetimes(column)?
            .into_iter()
            .map(|t| t.naive_utc())
            .collect())
    }

    fn to_column(name: &str, keys: &[Self]) -> PolarsResult<Column> {
        datetime_column(
            name,
            keys.iter().map(|t| t.and_utc().timestamp_micros()).collect(),
        )
    }
}

impl SequentialKey for NaiveDateTime {
    type Interval = TimeDelta;

    fn advance(&self, by: TimeDelta) -> Option<Self> {
        self.checked_add_signed(by)
    }
}
