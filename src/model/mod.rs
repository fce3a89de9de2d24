use std::collections::{BTreeMap, HashSet};
use std::fmt;

use calamine::{ExcelDateTime, ExcelDateTimeType};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::config::{ColumnRef, ValueType};

/// Cell content as read from the workbook, before any rule-driven coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Workbook date/time cell.
    DateTime(ExcelDateTime),
    /// Error value such as `#N/A`, kept as its display text.
    Error(String),
}

impl RawCell {
    pub fn is_empty(&self) -> bool {
        match self {
            RawCell::Empty => true,
            RawCell::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    /// Renders the cell as plain text, the way headers and keys are read.
    pub fn to_text(&self) -> String {
        match self {
            RawCell::Empty => String::new(),
            RawCell::Text(text) => text.clone(),
            RawCell::Int(value) => value.to_string(),
            RawCell::Float(value) => format_float(*value),
            RawCell::Bool(value) => value.to_string(),
            RawCell::DateTime(cell) => match cell.as_datetime() {
                Some(datetime) if datetime.time() == chrono::NaiveTime::MIN => {
                    datetime.date().format("%Y-%m-%d").to_string()
                }
                Some(datetime) => datetime.format("%Y-%m-%dT%H:%M:%S").to_string(),
                None => format_float(cell.as_f64()),
            },
            RawCell::Error(text) => text.clone(),
        }
    }
}

/// A typed value ready to be compared with, and written into, XML.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Canonical text written into XML; `date_format` only applies to dates.
    pub fn render(&self, date_format: &str) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::String(text) => text.clone(),
            CellValue::Integer(value) => value.to_string(),
            CellValue::Float(value) => format_float(*value),
            CellValue::Boolean(value) => value.to_string(),
            CellValue::Date(date) => date.format(date_format).to_string(),
        }
    }
}

/// Why a cell could not be coerced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionError {
    pub expected: ValueType,
    pub found: String,
}

impl fmt::Display for CoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot read '{}' as {:?}", self.found, self.expected)
    }
}

/// Coerces a raw cell into the declared type.
pub fn coerce(
    cell: &RawCell,
    value_type: ValueType,
    date_format: &str,
) -> Result<CellValue, CoercionError> {
    if cell.is_empty() {
        return Ok(CellValue::Empty);
    }
    let fail = || CoercionError {
        expected: value_type,
        found: cell.to_text(),
    };
    match value_type {
        ValueType::String => Ok(CellValue::String(cell.to_text())),
        ValueType::Integer => match cell {
            RawCell::Int(value) => Ok(CellValue::Integer(*value)),
            RawCell::Float(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => {
                Ok(CellValue::Integer(*value as i64))
            }
            RawCell::Text(text) => parse_integer(text).map(CellValue::Integer).ok_or_else(fail),
            _ => Err(fail()),
        },
        ValueType::Float => match cell {
            RawCell::Int(value) => Ok(CellValue::Float(*value as f64)),
            RawCell::Float(value) => Ok(CellValue::Float(*value)),
            RawCell::Text(text) => parse_float(text).map(CellValue::Float).ok_or_else(fail),
            _ => Err(fail()),
        },
        ValueType::Boolean => match cell {
            RawCell::Bool(value) => Ok(CellValue::Boolean(*value)),
            RawCell::Int(0) => Ok(CellValue::Boolean(false)),
            RawCell::Int(1) => Ok(CellValue::Boolean(true)),
            RawCell::Float(value) if *value == 0.0 || *value == 1.0 => {
                Ok(CellValue::Boolean(*value == 1.0))
            }
            RawCell::Text(text) => parse_boolean(text).map(CellValue::Boolean).ok_or_else(fail),
            _ => Err(fail()),
        },
        ValueType::Date => match cell {
            RawCell::DateTime(cell) => cell
                .as_datetime()
                .map(|datetime| CellValue::Date(datetime.date()))
                .ok_or_else(fail),
            RawCell::Float(serial) => serial_to_datetime(*serial)
                .map(|datetime| CellValue::Date(datetime.date()))
                .ok_or_else(fail),
            RawCell::Int(serial) => serial_to_datetime(*serial as f64)
                .map(|datetime| CellValue::Date(datetime.date()))
                .ok_or_else(fail),
            RawCell::Text(text) => parse_date(text, date_format)
                .map(CellValue::Date)
                .ok_or_else(fail),
            _ => Err(fail()),
        },
    }
}

/// Parses XML text as the given type, for typed comparisons.
pub fn parse_as(text: &str, value_type: ValueType, date_format: &str) -> Option<CellValue> {
    match value_type {
        ValueType::String => Some(CellValue::String(text.to_string())),
        ValueType::Integer => parse_integer(text).map(CellValue::Integer),
        ValueType::Float => parse_float(text).map(CellValue::Float),
        ValueType::Boolean => parse_boolean(text).map(CellValue::Boolean),
        ValueType::Date => parse_date(text, date_format).map(CellValue::Date),
    }
}

fn parse_integer(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    trimmed.parse::<i64>().ok().or_else(|| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|value| value.fract() == 0.0 && value.abs() < i64::MAX as f64)
            .map(|value| value as i64)
    })
}

fn parse_float(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

fn parse_boolean(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn parse_date(text: &str, date_format: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    NaiveDate::parse_from_str(trimmed, date_format)
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|datetime| datetime.date())
        })
}

fn serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    // 2958465 is 9999-12-31, the last date a workbook can hold.
    if !serial.is_finite() || !(0.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    ExcelDateTime::new(serial, ExcelDateTimeType::DateTime, false).as_datetime()
}

/// Formats a float without a trailing `.0` for integral values.
pub fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Normalises a key for matching: surrounding whitespace is insignificant,
/// case is not.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_string()
}

/// One sheet as read from the workbook: the header row and the data rows,
/// restricted to the columns the reader was asked to keep.
#[derive(Debug, Clone, Default)]
pub struct SheetTable {
    pub name: String,
    /// Header text by absolute column index.
    pub headers: BTreeMap<usize, String>,
    /// Data rows below the header, blank rows removed.
    pub rows: Vec<RawRow>,
}

impl SheetTable {
    /// Resolves a column reference to an absolute index.
    pub fn resolve(&self, column: &ColumnRef) -> Option<usize> {
        match column {
            ColumnRef::Index(index) => Some(*index),
            ColumnRef::Name(name) => {
                let wanted = name.trim();
                self.headers
                    .iter()
                    .find(|(_, header)| header.trim() == wanted)
                    .map(|(index, _)| *index)
            }
        }
    }
}

/// A data row; cells are sparse, absent columns read as empty.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based workbook row number.
    pub number: u32,
    pub cells: BTreeMap<usize, RawCell>,
}

impl RawRow {
    pub fn cell(&self, column: usize) -> &RawCell {
        static EMPTY: RawCell = RawCell::Empty;
        self.cells.get(&column).unwrap_or(&EMPTY)
    }
}

/// A row coerced for one rule: its key plus one typed value per field, in
/// field order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub number: u32,
    pub key: String,
    pub values: Vec<CellValue>,
}

/// Rows of a sheet prepared for one rule.
#[derive(Debug, Clone, Default)]
pub struct RuleRows {
    pub sheet: String,
    pub rows: Vec<Row>,
    /// Keys present in the sheet, including rows that failed coercion; nodes
    /// carrying one of these keys are never treated as extra.
    pub claimed: HashSet<String>,
    pub issues: Vec<RowIssue>,
}

/// Row-level extraction failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowIssue {
    pub sheet: String,
    pub row: u32,
    pub column: String,
    pub message: String,
}
