//! Text-protocol value conversion.
//!
//! Every column gets a converter chosen by its type code and whether its
//! charset is `binary`. The built-in defaults never change; a
//! [`ConverterTable`] shadows them per connection. An override either
//! replaces a converter with a caller function or removes it, in which
//! case the column comes back as raw bytes.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use s2wire_core::error::DecodeError;
use s2wire_core::{ColumnInfo, Error, Result, Row, Value};

use crate::errors::config_error;
use crate::protocol::PacketReader;
use crate::protocol::charset::{self, Encoding};
use crate::types::{ColumnDef, FieldType};

/// Caller-supplied converter. Receives the raw column bytes (never NULL).
pub type ConvertFn = dyn Fn(&[u8], &ColumnDef) -> std::result::Result<Value, String> + Send + Sync;

/// Lookup key of a converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConverterKey {
    pub type_code: u8,
    /// Column charset is `binary`
    pub binary: bool,
}

impl ConverterKey {
    pub const fn new(type_code: u8, binary: bool) -> Self {
        Self { type_code, binary }
    }

    pub fn of(column: &ColumnDef) -> Self {
        Self::new(column.type_code, column.is_binary_charset())
    }
}

/// What to do with column bytes that are invalid in the column encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingErrors {
    /// Fail the row with a decode error
    #[default]
    Strict,
    /// Substitute U+FFFD
    Replace,
}

impl std::str::FromStr for EncodingErrors {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "replace" => Ok(Self::Replace),
            _ => Err(config_error(format!(
                "unknown value for encoding_errors, expecting \"strict\" or \"replace\": {s}"
            ))),
        }
    }
}

/// Text handling shared by every column of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextOptions {
    pub encoding: Encoding,
    pub errors: EncodingErrors,
    /// Parse JSON columns; otherwise they come back as text
    pub parse_json: bool,
}

impl TextOptions {
    fn decode(&self, bytes: &[u8]) -> std::result::Result<String, String> {
        match self.errors {
            EncodingErrors::Strict => charset::decode(bytes, self.encoding)
                .map_err(|e| format!("{e}; use encoding_errors = Replace to substitute invalid bytes")),
            EncodingErrors::Replace => Ok(charset::decode_lossy(bytes, self.encoding)),
        }
    }
}

impl From<Encoding> for TextOptions {
    fn from(encoding: Encoding) -> Self {
        Self {
            encoding,
            errors: EncodingErrors::Strict,
            parse_json: true,
        }
    }
}

/// Built-in parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Null,
    Int,
    Float,
    Double,
    Decimal,
    Date,
    Time,
    DateTime,
    Json,
    Set,
    Text,
    Bytes,
}

/// The converter applied to one column.
#[derive(Clone)]
pub enum Converter {
    Builtin(Builtin),
    Custom(Arc<ConvertFn>),
    /// No conversion: raw bytes
    Raw,
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Converter::Builtin(b) => write!(f, "Builtin({b:?})"),
            Converter::Custom(_) => f.write_str("Custom"),
            Converter::Raw => f.write_str("Raw"),
        }
    }
}

/// Default converter for a key.
pub fn default_converter(key: ConverterKey) -> Builtin {
    let Some(field_type) = FieldType::from_code(key.type_code) else {
        return if key.binary { Builtin::Bytes } else { Builtin::Text };
    };
    match field_type {
        FieldType::Decimal | FieldType::NewDecimal => Builtin::Decimal,
        FieldType::Tiny
        | FieldType::Short
        | FieldType::Long
        | FieldType::LongLong
        | FieldType::Int24
        | FieldType::Year => Builtin::Int,
        FieldType::Float => Builtin::Float,
        FieldType::Double => Builtin::Double,
        FieldType::Null => Builtin::Null,
        FieldType::Timestamp | FieldType::DateTime => Builtin::DateTime,
        FieldType::Date | FieldType::NewDate => Builtin::Date,
        FieldType::Time => Builtin::Time,
        FieldType::Json => Builtin::Json,
        FieldType::Set => Builtin::Set,
        FieldType::Bit | FieldType::Geometry => Builtin::Bytes,
        FieldType::Enum
        | FieldType::VarChar
        | FieldType::VarString
        | FieldType::String
        | FieldType::TinyBlob
        | FieldType::MediumBlob
        | FieldType::LongBlob
        | FieldType::Blob => {
            if key.binary {
                Builtin::Bytes
            } else {
                Builtin::Text
            }
        }
    }
}

/// Connection-scoped converter overrides on top of the defaults.
///
/// Tables are values: `with`/`without` build a new table and leave any
/// clone that is already in use untouched.
#[derive(Clone, Default)]
pub struct ConverterTable {
    overrides: Arc<HashMap<ConverterKey, Option<Arc<ConvertFn>>>>,
}

impl fmt::Debug for ConverterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterTable")
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

impl ConverterTable {
    /// The default table (no overrides).
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the converter for one key.
    #[must_use]
    pub fn with<F>(self, key: ConverterKey, convert: F) -> Self
    where
        F: Fn(&[u8], &ColumnDef) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.insert(key, Some(Arc::new(convert)))
    }

    /// Replace the converter for a type code, binary charset or not.
    #[must_use]
    pub fn with_type<F>(self, type_code: u8, convert: F) -> Self
    where
        F: Fn(&[u8], &ColumnDef) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        let convert: Arc<ConvertFn> = Arc::new(convert);
        self.insert(ConverterKey::new(type_code, false), Some(Arc::clone(&convert)))
            .insert(ConverterKey::new(type_code, true), Some(convert))
    }

    /// Remove the converter for one key; values come back as raw bytes.
    #[must_use]
    pub fn without(self, key: ConverterKey) -> Self {
        self.insert(key, None)
    }

    /// Remove the converter for a type code, binary charset or not.
    #[must_use]
    pub fn without_type(self, type_code: u8) -> Self {
        self.without(ConverterKey::new(type_code, false))
            .without(ConverterKey::new(type_code, true))
    }

    fn insert(mut self, key: ConverterKey, convert: Option<Arc<ConvertFn>>) -> Self {
        Arc::make_mut(&mut self.overrides).insert(key, convert);
        self
    }

    /// True when no default is shadowed.
    pub fn is_default(&self) -> bool {
        self.overrides.is_empty()
    }

    /// Converter in effect for a key.
    pub fn resolve(&self, key: ConverterKey) -> Converter {
        match self.overrides.get(&key) {
            Some(Some(convert)) => Converter::Custom(Arc::clone(convert)),
            Some(None) => Converter::Raw,
            None => Converter::Builtin(default_converter(key)),
        }
    }
}

/// Per-result-set decoder: column metadata plus the converters resolved
/// for each column when the descriptors arrived.
#[derive(Debug, Clone)]
pub struct RowDecoder {
    columns: Arc<[ColumnDef]>,
    info: Arc<ColumnInfo>,
    converters: Vec<Converter>,
    text: TextOptions,
}

impl RowDecoder {
    pub fn new(
        columns: Vec<ColumnDef>,
        table: &ConverterTable,
        text: impl Into<TextOptions>,
    ) -> Self {
        let converters = columns
            .iter()
            .map(|c| table.resolve(ConverterKey::of(c)))
            .collect();
        let info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        Self {
            columns: columns.into(),
            info,
            converters,
            text: text.into(),
        }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.info)
    }

    /// Decode one text-protocol row packet.
    ///
    /// The whole packet is split into raw values before any conversion
    /// runs, so a failing column never leaves the stream mid-row. Columns
    /// missing from a short row come back as NULL.
    pub fn decode_row(&self, payload: &[u8]) -> Result<Row> {
        let mut reader = PacketReader::new(payload);
        let mut raw = Vec::with_capacity(self.columns.len());
        for _ in 0..self.columns.len() {
            match reader.read_column_value() {
                Some(value) => raw.push(value),
                None => break,
            }
        }
        if raw.len() < self.columns.len() {
            tracing::trace!(
                expected = self.columns.len(),
                got = raw.len(),
                "short row, padding with NULL"
            );
        }

        let mut values = Vec::with_capacity(self.columns.len());
        let mut failure = None;
        for (index, column) in self.columns.iter().enumerate() {
            let Some(Some(bytes)) = raw.get(index) else {
                values.push(Value::Null);
                continue;
            };
            match self.convert(index, bytes) {
                Ok(value) => values.push(value),
                Err(message) => {
                    failure.get_or_insert_with(|| decode_error(index, column, message));
                    values.push(Value::Null);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(Row::with_columns(Arc::clone(&self.info), values)),
        }
    }

    fn convert(&self, index: usize, bytes: &[u8]) -> std::result::Result<Value, String> {
        let column = &self.columns[index];
        match &self.converters[index] {
            Converter::Raw => Ok(Value::Bytes(bytes.to_vec())),
            Converter::Custom(convert) => convert(bytes, column),
            Converter::Builtin(builtin) => apply_builtin(*builtin, bytes, self.text),
        }
    }
}

fn decode_error(index: usize, column: &ColumnDef, message: String) -> Error {
    Error::Decode(DecodeError {
        column: column.name.clone(),
        column_index: index,
        type_name: column.field_type().map_or("UNKNOWN", FieldType::name),
        message,
    })
}

/// Run a built-in parser over raw column bytes.
pub fn apply_builtin(
    builtin: Builtin,
    bytes: &[u8],
    text: TextOptions,
) -> std::result::Result<Value, String> {
    match builtin {
        Builtin::Null => Ok(Value::Null),
        Builtin::Bytes => Ok(Value::Bytes(bytes.to_vec())),
        Builtin::Text => text.decode(bytes).map(Value::Text),
        Builtin::Json if !text.parse_json => text.decode(bytes).map(Value::Text),
        Builtin::Json => {
            let json = text.decode(bytes)?;
            serde_json::from_str(&json)
                .map(Value::Json)
                .map_err(|e| format!("invalid JSON: {e}"))
        }
        Builtin::Set => {
            let text = text.decode(bytes)?;
            if text.is_empty() {
                return Ok(Value::Set(Vec::new()));
            }
            Ok(Value::Set(text.split(',').map(|s| s.trim().to_string()).collect()))
        }
        numeric => {
            let text = ascii(bytes)?;
            match numeric {
                Builtin::Int => parse_int(text),
                Builtin::Float => text
                    .trim()
                    .parse::<f32>()
                    .map(Value::Float)
                    .map_err(|_| format!("invalid float literal '{text}'")),
                Builtin::Double => text
                    .trim()
                    .parse::<f64>()
                    .map(Value::Double)
                    .map_err(|_| format!("invalid float literal '{text}'")),
                Builtin::Decimal => parse_decimal(text),
                // Zero dates and other values outside the calendar stay text
                Builtin::Date => Ok(parse_date(text)
                    .map_or_else(|| Value::Text(text.to_string()), Value::Date)),
                Builtin::Time => Ok(parse_time(text)
                    .map_or_else(|| Value::Text(text.to_string()), Value::Time)),
                Builtin::DateTime => Ok(parse_datetime(text)
                    .map_or_else(|| Value::Text(text.to_string()), Value::Timestamp)),
                _ => Ok(Value::Bytes(bytes.to_vec())),
            }
        }
    }
}

fn ascii(bytes: &[u8]) -> std::result::Result<&str, String> {
    if !bytes.is_ascii() {
        return Err("non-ascii byte in numeric or temporal value".to_string());
    }
    std::str::from_utf8(bytes).map_err(|e| e.to_string())
}

fn parse_int(text: &str) -> std::result::Result<Value, String> {
    if let Ok(v) = text.parse::<i64>() {
        return Ok(Value::Int(v));
    }
    text.parse::<u64>()
        .map(Value::UInt)
        .map_err(|_| format!("invalid integer literal '{text}'"))
}

fn parse_decimal(text: &str) -> std::result::Result<Value, String> {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    let valid = !(int_part.is_empty() && frac_part.is_empty())
        && int_part.bytes().all(|b| b.is_ascii_digit())
        && frac_part.bytes().all(|b| b.is_ascii_digit());
    if valid {
        Ok(Value::Decimal(text.to_string()))
    } else {
        Err(format!("invalid decimal literal '{text}'"))
    }
}

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// Parse `YYYY-MM-DD` into days since 1970-01-01.
pub fn parse_date(text: &str) -> Option<i32> {
    let bytes = text.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let year: i32 = text[0..4].parse().ok()?;
    let month: u32 = text[5..7].parse().ok()?;
    let day: u32 = text[8..10].parse().ok()?;
    if year < 1 || !(1..=12).contains(&month) || day < 1 || day > days_in_month(year, month) {
        return None;
    }
    Some(days_from_civil(year, month, day))
}

/// Parse `[-]H+:MM:SS[.ffffff]` into signed microseconds.
pub fn parse_time(text: &str) -> Option<i64> {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (clock, frac) = rest.split_once('.').unwrap_or((rest, ""));
    let mut parts = clock.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next().map_or(Some(0), |s| s.parse().ok())?;
    if parts.next().is_some()
        || hours < 0
        || !(0..=59).contains(&minutes)
        || !(0..=59).contains(&seconds)
    {
        return None;
    }
    let micros = hours
        .checked_mul(3600)?
        .checked_add(minutes * 60 + seconds)?
        .checked_mul(MICROS_PER_SECOND)?
        .checked_add(parse_fraction(frac)?)?;
    Some(if negative { -micros } else { micros })
}

/// Parse `YYYY-MM-DD[ T]HH:MM:SS[.ffffff]` into microseconds since the epoch.
pub fn parse_datetime(text: &str) -> Option<i64> {
    if text.len() == 10 {
        return parse_date(text).map(|days| i64::from(days) * MICROS_PER_DAY);
    }
    let (date, time) = (text.get(..10)?, text.get(11..)?);
    if !matches!(text.as_bytes()[10], b' ' | b'T') {
        return None;
    }
    let days = parse_date(date)?;
    let time_micros = parse_time(time)?;
    if !(0..MICROS_PER_DAY).contains(&time_micros) {
        return None;
    }
    Some(i64::from(days) * MICROS_PER_DAY + time_micros)
}

fn parse_fraction(frac: &str) -> Option<i64> {
    if frac.is_empty() {
        return Some(0);
    }
    if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i64 = frac.parse().ok()?;
    Some(value * 10_i64.pow(6 - frac.len() as u32))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        2 if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Days since the Unix epoch for a proleptic Gregorian date.
fn days_from_civil(year: i32, month: u32, day: u32) -> i32 {
    // https://howardhinnant.github.io/date_algorithms.html
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u32;
    let doy = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i32 - 719_468
}
