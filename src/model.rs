//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

//! Core data model shared by the planner, the session peer, and the engine
//! contract: column type codes, cell values, tuples, table schemas, and the
//! primary-key blob codec.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Column types
// ---------------------------------------------------------------------------

/// Engine column type. The numeric codes are part of the engine contract and
/// appear in schema metadata exchanged with the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    String,
    Long,
    Integer,
    Bytearray,
    Timestamp,
    Null,
    Boolean,
    Any,
}

impl ColumnType {
    /// Wire/metadata code for this type.
    pub fn code(self) -> u8 {
        match self {
            ColumnType::String => 0,
            ColumnType::Long => 1,
            ColumnType::Integer => 2,
            ColumnType::Bytearray => 3,
            ColumnType::Timestamp => 4,
            ColumnType::Null => 5,
            ColumnType::Boolean => 7,
            ColumnType::Any => 10,
        }
    }

    /// Decode a metadata code. Unknown codes yield `None`; schema exposure
    /// maps those to `Any` (see the planner's reverse type mapping).
    pub fn from_code(code: u8) -> Option<ColumnType> {
        match code {
            0 => Some(ColumnType::String),
            1 => Some(ColumnType::Long),
            2 => Some(ColumnType::Integer),
            3 => Some(ColumnType::Bytearray),
            4 => Some(ColumnType::Timestamp),
            5 => Some(ColumnType::Null),
            7 => Some(ColumnType::Boolean),
            10 => Some(ColumnType::Any),
            _ => None,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColumnType::String => "string",
            ColumnType::Long => "long",
            ColumnType::Integer => "integer",
            ColumnType::Bytearray => "bytearray",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Null => "null",
            ColumnType::Boolean => "boolean",
            ColumnType::Any => "any",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Cell values
// ---------------------------------------------------------------------------

/// A single dynamic cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    Timestamp(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Boolean coercion used by filter predicates: only `Boolean(true)` is
    /// truthy; NULL and every non-boolean value are not.
    pub fn is_true(&self) -> bool {
        matches!(self, SqlValue::Boolean(true))
    }

    /// Numeric view as i64, when the value is integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v as i64),
            SqlValue::Long(v) | SqlValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view as f64 for mixed arithmetic.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(v) => Some(*v as f64),
            SqlValue::Long(v) | SqlValue::Timestamp(v) => Some(*v as f64),
            SqlValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Total-enough ordering for sort operators. NULLs sort first; values of
    /// incomparable kinds compare by kind tag so sorting stays stable.
    pub fn compare(&self, other: &SqlValue) -> Ordering {
        use SqlValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => kind_rank(a).cmp(&kind_rank(b)),
            },
        }
    }
}

fn kind_rank(v: &SqlValue) -> u8 {
    match v {
        SqlValue::Null => 0,
        SqlValue::Boolean(_) => 1,
        SqlValue::Integer(_) => 2,
        SqlValue::Long(_) => 3,
        SqlValue::Double(_) => 4,
        SqlValue::Timestamp(_) => 5,
        SqlValue::String(_) => 6,
        SqlValue::Bytes(_) => 7,
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Boolean(v) => write!(f, "{v}"),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::Long(v) => write!(f, "{v}"),
            SqlValue::Double(v) => write!(f, "{v}"),
            SqlValue::Timestamp(v) => write!(f, "{v}"),
            SqlValue::String(v) => f.write_str(v),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tuples
// ---------------------------------------------------------------------------

/// One row: an ordered field list shared across a result set, plus values.
#[derive(Debug, Clone)]
pub struct Tuple {
    fields: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl Tuple {
    pub fn new(fields: Arc<Vec<String>>, values: Vec<SqlValue>) -> Tuple {
        debug_assert_eq!(fields.len(), values.len());
        Tuple { fields, values }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    pub fn get(&self, field: &str) -> Option<&SqlValue> {
        self.fields
            .iter()
            .position(|f| f == field)
            .map(|i| &self.values[i])
    }
}

// ---------------------------------------------------------------------------
// Table schemas
// ---------------------------------------------------------------------------

/// A column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ctype: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ctype: ColumnType) -> Column {
        Column {
            name: name.into(),
            ctype,
        }
    }
}

/// Table schema: name, owning table-space, columns, and primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub table_space: String,
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Lowercased name → index map, the shape the expression compiler wants.
    pub fn schema_map(&self) -> HashMap<String, usize> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.to_lowercase(), i))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Primary-key blob codec
// ---------------------------------------------------------------------------

/// Errors from the primary-key codec.
#[derive(Debug)]
pub enum CodecError {
    /// The blob does not match the schema it is decoded against.
    Corrupted(String),
    /// A primary-key column is missing from the schema or the row.
    UnknownColumn(String),
    /// A value's type does not match its column type.
    TypeMismatch(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Corrupted(msg) => write!(f, "corrupted key blob: {msg}"),
            CodecError::UnknownColumn(name) => write!(f, "unknown key column '{name}'"),
            CodecError::TypeMismatch(msg) => write!(f, "key type mismatch: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode the primary-key values of a row into an opaque blob.
///
/// Each key column is emitted as a 4-byte big-endian length followed by the
/// column payload; numeric payloads are fixed-width big-endian.
pub fn encode_key(table: &Table, row: &Tuple) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for pk in &table.primary_key {
        let value = row
            .get(pk)
            .ok_or_else(|| CodecError::UnknownColumn(pk.clone()))?;
        let payload = encode_key_value(pk, value)?;
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
    }
    Ok(out)
}

fn encode_key_value(column: &str, value: &SqlValue) -> Result<Vec<u8>, CodecError> {
    match value {
        SqlValue::Integer(v) => Ok(v.to_be_bytes().to_vec()),
        SqlValue::Long(v) | SqlValue::Timestamp(v) => Ok(v.to_be_bytes().to_vec()),
        SqlValue::Boolean(v) => Ok(vec![u8::from(*v)]),
        SqlValue::Double(v) => Ok(v.to_bits().to_be_bytes().to_vec()),
        SqlValue::String(s) => Ok(s.as_bytes().to_vec()),
        SqlValue::Bytes(b) => Ok(b.clone()),
        SqlValue::Null => Err(CodecError::TypeMismatch(format!(
            "NULL is not allowed in key column '{column}'"
        ))),
    }
}

/// Decode a primary-key blob against a table schema into (column, value)
/// pairs, in primary-key order.
pub fn decode_key(table: &Table, blob: &[u8]) -> Result<Vec<(String, SqlValue)>, CodecError> {
    let mut out = Vec::with_capacity(table.primary_key.len());
    let mut rest = blob;
    for pk in &table.primary_key {
        let column = table
            .column(pk)
            .ok_or_else(|| CodecError::UnknownColumn(pk.clone()))?;
        if rest.len() < 4 {
            return Err(CodecError::Corrupted(format!(
                "truncated length prefix for '{pk}'"
            )));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(CodecError::Corrupted(format!(
                "truncated payload for '{pk}' (want {len}, have {})",
                rest.len()
            )));
        }
        let (payload, tail) = rest.split_at(len);
        out.push((pk.clone(), decode_key_value(column, payload)?));
        rest = tail;
    }
    if !rest.is_empty() {
        return Err(CodecError::Corrupted(format!(
            "{} trailing bytes",
            rest.len()
        )));
    }
    Ok(out)
}

fn decode_key_value(column: &Column, payload: &[u8]) -> Result<SqlValue, CodecError> {
    match column.ctype {
        ColumnType::Integer => {
            let arr: [u8; 4] = payload.try_into().map_err(|_| {
                CodecError::Corrupted(format!("integer key '{}' is not 4 bytes", column.name))
            })?;
            Ok(SqlValue::Integer(i32::from_be_bytes(arr)))
        }
        ColumnType::Long => {
            let arr: [u8; 8] = payload.try_into().map_err(|_| {
                CodecError::Corrupted(format!("long key '{}' is not 8 bytes", column.name))
            })?;
            Ok(SqlValue::Long(i64::from_be_bytes(arr)))
        }
        ColumnType::Timestamp => {
            let arr: [u8; 8] = payload.try_into().map_err(|_| {
                CodecError::Corrupted(format!("timestamp key '{}' is not 8 bytes", column.name))
            })?;
            Ok(SqlValue::Timestamp(i64::from_be_bytes(arr)))
        }
        ColumnType::Boolean => match payload {
            [0] => Ok(SqlValue::Boolean(false)),
            [1] => Ok(SqlValue::Boolean(true)),
            _ => Err(CodecError::Corrupted(format!(
                "boolean key '{}' is not 1 byte",
                column.name
            ))),
        },
        ColumnType::String => String::from_utf8(payload.to_vec())
            .map(SqlValue::String)
            .map_err(|_| CodecError::Corrupted(format!("key '{}' is not UTF-8", column.name))),
        ColumnType::Bytearray | ColumnType::Any => Ok(SqlValue::Bytes(payload.to_vec())),
        ColumnType::Null => Err(CodecError::TypeMismatch(format!(
            "key column '{}' has type null",
            column.name
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pk: &[&str]) -> Table {
        Table {
            table_space: "ts1".into(),
            name: "t".into(),
            columns: vec![
                Column::new("id", ColumnType::Integer),
                Column::new("name", ColumnType::String),
                Column::new("seq", ColumnType::Long),
            ],
            primary_key: pk.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn row(values: Vec<SqlValue>) -> Tuple {
        let fields = Arc::new(vec!["id".to_string(), "name".to_string(), "seq".to_string()]);
        Tuple::new(fields, values)
    }

    #[test]
    fn key_roundtrip_single_column() {
        let t = table(&["id"]);
        let r = row(vec![
            SqlValue::Integer(7),
            SqlValue::String("a".into()),
            SqlValue::Long(1),
        ]);
        let blob = encode_key(&t, &r).unwrap();
        let decoded = decode_key(&t, &blob).unwrap();
        assert_eq!(decoded, vec![("id".to_string(), SqlValue::Integer(7))]);
    }

    #[test]
    fn key_roundtrip_composite() {
        let t = table(&["id", "name"]);
        let r = row(vec![
            SqlValue::Integer(-3),
            SqlValue::String("bob".into()),
            SqlValue::Long(9),
        ]);
        let blob = encode_key(&t, &r).unwrap();
        let decoded = decode_key(&t, &blob).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1], ("name".to_string(), SqlValue::String("bob".into())));
    }

    #[test]
    fn truncated_key_blob_is_rejected() {
        let t = table(&["seq"]);
        let r = row(vec![
            SqlValue::Integer(1),
            SqlValue::String("x".into()),
            SqlValue::Long(42),
        ]);
        let blob = encode_key(&t, &r).unwrap();
        assert!(decode_key(&t, &blob[..blob.len() - 1]).is_err());
        assert!(decode_key(&t, &blob[..2]).is_err());
    }

    #[test]
    fn null_key_column_is_rejected() {
        let t = table(&["id"]);
        let r = row(vec![
            SqlValue::Null,
            SqlValue::String("x".into()),
            SqlValue::Long(0),
        ]);
        assert!(encode_key(&t, &r).is_err());
    }

    #[test]
    fn type_codes_roundtrip() {
        for ct in [
            ColumnType::String,
            ColumnType::Long,
            ColumnType::Integer,
            ColumnType::Bytearray,
            ColumnType::Timestamp,
            ColumnType::Null,
            ColumnType::Boolean,
            ColumnType::Any,
        ] {
            assert_eq!(ColumnType::from_code(ct.code()), Some(ct));
        }
        assert_eq!(ColumnType::from_code(99), None);
    }

    #[test]
    fn value_ordering_nulls_first() {
        let mut vals = vec![
            SqlValue::Long(2),
            SqlValue::Null,
            SqlValue::Integer(1),
            SqlValue::Double(1.5),
        ];
        vals.sort_by(|a, b| a.compare(b));
        assert!(vals[0].is_null());
        assert_eq!(vals[1], SqlValue::Integer(1));
        assert_eq!(vals[2], SqlValue::Double(1.5));
        assert_eq!(vals[3], SqlValue::Long(2));
    }
}
