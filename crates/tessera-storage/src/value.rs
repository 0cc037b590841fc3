// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Backend-neutral argument and row values.
//!
//! Callers bind [`Value`]s and read [`Row`]s regardless of which engine is
//! active. Both drivers' parameter traits are implemented here so the same
//! argument slice can be handed to either one.

use std::error::Error;
use std::sync::Arc;

use bytes::BytesMut;
use rusqlite::types::{ToSqlOutput, ValueRef};
use tessera_core::TesseraError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use uuid::Uuid;

/// A single bound argument or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Bool(_) => "bool",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Build a `Vec<Value>` argument list.
///
/// ```
/// use tessera_storage::{args, Value};
/// let a = args![1_i64, "x", None::<i64>];
/// assert_eq!(a[2], Value::Null);
/// ```
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::Value>::new() };
    ($($v:expr),+ $(,)?) => { ::std::vec![$($crate::Value::from($v)),+] };
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*b))),
        })
    }
}

/// Encodes by the server-declared parameter type, so an `Integer` bound to a
/// `BOOLEAN` column or `Text` bound to `BYTEA` (both common in data read back
/// from SQLite) are converted rather than rejected.
impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(i) => match *ty {
                Type::BOOL => (*i != 0).to_sql(ty, out),
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => i.to_string().to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Value::Real(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Value::Text(s) => match *ty {
                Type::BYTEA => s.as_bytes().to_sql(ty, out),
                _ => s.as_str().to_sql(ty, out),
            },
            Value::Blob(b) => match *ty {
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => {
                    std::str::from_utf8(b)?.to_sql(ty, out)
                }
                _ => b.as_slice().to_sql(ty, out),
            },
            Value::Bool(b) => match *ty {
                Type::INT2 => i16::from(*b).to_sql(ty, out),
                Type::INT4 => i32::from(*b).to_sql(ty, out),
                Type::INT8 => i64::from(*b).to_sql(ty, out),
                _ => b.to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

impl From<ValueRef<'_>> for Value {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

/// Decode one PostgreSQL row into [`Value`]s by declared column type.
///
/// Types SQLite has no storage class for come back as text in the same
/// shape SQLite stores them: numerics as decimal strings, timestamps as
/// ISO 8601, UUIDs hyphenated and JSON serialized. Anything unrecognized is
/// returned as its raw wire bytes instead of failing the query.
pub(crate) fn pg_row_values(row: &tokio_postgres::Row) -> Result<Vec<Value>, tokio_postgres::Error> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, col) in row.columns().iter().enumerate() {
        let ty = col.type_();
        let value = match *ty {
            Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
            Type::CHAR => row
                .try_get::<_, Option<i8>>(idx)?
                .map(|v| Value::Integer(i64::from(v))),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)?
                .map(|v| Value::Integer(i64::from(v))),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)?
                .map(|v| Value::Integer(i64::from(v))),
            Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer),
            Type::OID => row
                .try_get::<_, Option<u32>>(idx)?
                .map(|v| Value::Integer(i64::from(v))),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)?
                .map(|v| Value::Real(f64::from(v))),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Real),
            Type::NUMERIC => row
                .try_get::<_, Option<Numeric>>(idx)?
                .map(|n| Value::Text(n.0)),
            Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Blob),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(|t| Value::Text(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
            Type::TIMESTAMP => row
                .try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|t| Value::Text(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
            Type::DATE => row
                .try_get::<_, Option<NaiveDate>>(idx)?
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string())),
            Type::TIME => row
                .try_get::<_, Option<NaiveTime>>(idx)?
                .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string())),
            Type::UUID => row
                .try_get::<_, Option<Uuid>>(idx)?
                .map(|u| Value::Text(u.hyphenated().to_string())),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<serde_json::Value>>(idx)?
                .map(|j| Value::Text(j.to_string())),
            _ if <String as FromSql>::accepts(ty) => {
                row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
            }
            _ => row
                .try_get::<_, Option<Undecoded>>(idx)?
                .map(|raw| undecoded_value(ty, raw.0)),
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(values)
}

/// Enum labels travel as UTF-8; everything else stays as wire bytes.
fn undecoded_value(ty: &Type, raw: Vec<u8>) -> Value {
    match ty.kind() {
        Kind::Enum(_) => match String::from_utf8(raw) {
            Ok(label) => Value::Text(label),
            Err(e) => Value::Blob(e.into_bytes()),
        },
        _ => Value::Blob(raw),
    }
}

/// Column bytes for types with no dedicated decoding.
struct Undecoded(Vec<u8>);

impl<'a> FromSql<'a> for Undecoded {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(Undecoded(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// `NUMERIC` rendered as its exact decimal text.
struct Numeric(String);

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        decode_numeric(raw).map(Numeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Binary `NUMERIC`: digit count, weight of the first base-10000 digit,
/// sign, display scale, then the digits.
fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn Error + Sync + Send>> {
    let word = |i: usize| -> Result<u16, Box<dyn Error + Sync + Send>> {
        raw.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric value".into())
    };
    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(1)? as i16);
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);
    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    let digits = (0..ndigits).map(|i| word(4 + i)).collect::<Result<Vec<_>, _>>()?;
    let digit = |group: i32| -> u16 {
        usize::try_from(group)
            .ok()
            .and_then(|g| digits.get(g).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for group in 1..=weight {
            out.push_str(&format!("{:04}", digit(group)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut group = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(group)));
            group += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

/// Conversion from a column [`Value`] into a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, String>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, String> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Integer(i) => Ok(*i),
            Value::Bool(b) => Ok(i64::from(*b)),
            // Integral NUMERIC results, e.g. SUM over a BIGINT column.
            Value::Text(s) => s
                .parse()
                .map_err(|_| "expected integer, found text".to_string()),
            other => Err(format!("expected integer, found {}", other.kind())),
        }
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self, String> {
        let i = i64::from_value(value)?;
        u64::try_from(i).map_err(|_| format!("expected non-negative integer, found {i}"))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Real(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f64),
            Value::Text(s) => s.parse().map_err(|_| "expected real, found text".to_string()),
            other => Err(format!("expected real, found {}", other.kind())),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Integer(i) => Ok(*i != 0),
            other => Err(format!("expected bool, found {}", other.kind())),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Blob(b) => String::from_utf8(b.clone()).map_err(|e| e.to_string()),
            other => Err(format!("expected text, found {}", other.kind())),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Blob(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            other => Err(format!("expected blob, found {}", other.kind())),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// A column name or position accepted by [`Row::get`].
pub trait ColumnIndex {
    fn index(&self, columns: &[String]) -> Option<usize>;
    fn describe(&self) -> String;
}

impl ColumnIndex for usize {
    fn index(&self, columns: &[String]) -> Option<usize> {
        (*self < columns.len()).then_some(*self)
    }

    fn describe(&self) -> String {
        format!("#{self}")
    }
}

impl ColumnIndex for &str {
    fn index(&self, columns: &[String]) -> Option<usize> {
        columns.iter().position(|c| c.eq_ignore_ascii_case(self))
    }

    fn describe(&self) -> String {
        (*self).to_string()
    }
}

/// One result row. Column names are shared between rows of the same result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Read a column by position or (case-insensitive) name.
    pub fn get<T: FromValue>(&self, idx: impl ColumnIndex) -> Result<T, TesseraError> {
        let pos = idx.index(&self.columns).ok_or_else(|| TesseraError::Decode {
            column: idx.describe(),
            detail: "no such column".to_string(),
        })?;
        T::from_value(&self.values[pos]).map_err(|detail| TesseraError::Decode {
            column: idx.describe(),
            detail,
        })
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Outcome of a statement run for its side effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        Row::new(
            Arc::from(vec!["id".to_string(), "Name".to_string(), "note".to_string()]),
            vec![Value::Integer(7), Value::Text("alpha".into()), Value::Null],
        )
    }

    #[test]
    fn get_by_position_and_name() {
        let r = row();
        assert_eq!(r.get::<i64>(0).unwrap(), 7);
        assert_eq!(r.get::<String>("name").unwrap(), "alpha");
        assert_eq!(r.get::<Option<String>>("note").unwrap(), None);
    }

    #[test]
    fn get_reports_missing_column_and_type_mismatch() {
        let r = row();
        let err = r.get::<i64>("missing").unwrap_err();
        assert!(matches!(err, TesseraError::Decode { ref column, .. } if column == "missing"));
        let err = r.get::<i64>("name").unwrap_err();
        assert!(err.to_string().contains("expected integer"));
    }

    #[test]
    fn args_macro_converts_mixed_values() {
        let a = args![1_i64, "two", 3.5_f64, true, None::<String>, vec![1_u8, 2]];
        assert_eq!(
            a,
            vec![
                Value::Integer(1),
                Value::Text("two".into()),
                Value::Real(3.5),
                Value::Bool(true),
                Value::Null,
                Value::Blob(vec![1, 2]),
            ]
        );
        assert!(args![].is_empty());
    }

    #[test]
    fn integer_coerces_to_pg_bool_and_narrow_ints() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            Value::Integer(1).to_sql(&Type::BOOL, &mut buf),
            Ok(IsNull::No)
        ));
        assert_eq!(&buf[..], &[1]);

        let mut buf = BytesMut::new();
        assert!(Value::Integer(70_000).to_sql(&Type::INT2, &mut buf).is_err());
    }

    #[test]
    fn text_coerces_to_bytea() {
        let mut buf = BytesMut::new();
        Value::Text("ab".into()).to_sql(&Type::BYTEA, &mut buf).unwrap();
        assert_eq!(&buf[..], b"ab");
    }

    fn numeric_bytes(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn numeric_decodes_to_exact_decimal_text() {
        assert_eq!(decode_numeric(&numeric_bytes(0, 0, 0, &[])).unwrap(), "0");
        assert_eq!(decode_numeric(&numeric_bytes(0, 0, 0, &[6])).unwrap(), "6");
        assert_eq!(decode_numeric(&numeric_bytes(1, 0, 0, &[1, 2345])).unwrap(), "12345");
        assert_eq!(
            decode_numeric(&numeric_bytes(0, NUMERIC_NEG, 2, &[12, 5000])).unwrap(),
            "-12.50"
        );
        assert_eq!(decode_numeric(&numeric_bytes(-1, 0, 2, &[500])).unwrap(), "0.05");
        assert_eq!(decode_numeric(&numeric_bytes(-2, 0, 5, &[5000])).unwrap(), "0.00005");
        assert_eq!(decode_numeric(&numeric_bytes(2, 0, 0, &[7])).unwrap(), "700000000");
        assert_eq!(decode_numeric(&numeric_bytes(0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
        assert!(decode_numeric(&[0, 1]).is_err());
    }

    #[test]
    fn integral_numeric_text_reads_as_integer() {
        assert_eq!(i64::from_value(&Value::Text("6".into())).unwrap(), 6);
        assert_eq!(f64::from_value(&Value::Text("2.5".into())).unwrap(), 2.5);
        assert!(i64::from_value(&Value::Text("2.5".into())).is_err());
    }

    #[test]
    fn unknown_pg_types_fall_back_to_raw_bytes() {
        assert_eq!(undecoded_value(&Type::INTERVAL, vec![0; 16]), Value::Blob(vec![0; 16]));
    }

    #[test]
    fn sqlite_value_ref_conversion() {
        assert_eq!(Value::from(ValueRef::Integer(3)), Value::Integer(3));
        assert_eq!(Value::from(ValueRef::Text(b"hi")), Value::Text("hi".into()));
        assert_eq!(Value::from(ValueRef::Null), Value::Null);
    }
}
