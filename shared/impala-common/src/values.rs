//! Row values and the codec registry
//!
//! Every column carries a [`SemanticType`] tag. The [`CodecRegistry`] maps a
//! tag to the storage type used in DDL, the encoder that renders a [`Value`]
//! as SQL literal text, and the decoder that parses the engine's raw result
//! text back into a [`Value`]. Tags without a registered codec are a schema
//! error, never a silent fallback.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{ImpalaError, ImpalaResult};

/// Raw text the engine returns for a NULL cell
pub const NULL_SENTINEL: &str = "NULL";

/// Literal written for a NULL value in DML
pub const NULL_LITERAL: &str = "null";

/// Semantic type of a column or destination field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SemanticType {
    Int32,
    Int64,
    Double,
    Boolean,
    String,
    /// Instant stored as epoch milliseconds
    Timestamp,
    /// Span stored as milliseconds
    Duration,
    /// Enumeration stored as its integer discriminant
    Enum,
    Decimal,
    Binary,
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
    Duration(chrono::Duration),
    Enum(i32),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Int32(_) => "Int32",
            Value::Int64(_) => "Int64",
            Value::Double(_) => "Double",
            Value::Boolean(_) => "Boolean",
            Value::Text(_) => "Text",
            Value::Timestamp(_) => "Timestamp",
            Value::Duration(_) => "Duration",
            Value::Enum(_) => "Enum",
        }
    }

    /// Integer key used for range partitioning
    ///
    /// Instants map to epoch milliseconds and integers map to themselves; any
    /// other value cannot place a row in a range partition.
    pub fn partition_key(&self) -> ImpalaResult<i64> {
        match self {
            Value::Timestamp(ts) => Ok(ts.timestamp_millis()),
            Value::Int32(v) => Ok(i64::from(*v)),
            Value::Int64(v) => Ok(*v),
            other => Err(ImpalaError::Schema(format!(
                "{} values cannot be used as a range partition key; valid types are Timestamp, Int32 and Int64",
                other.kind()
            ))),
        }
    }
}

/// Encoder from a value to SQL literal text
pub type EncodeFn = fn(&Value) -> ImpalaResult<String>;

/// Decoder from raw result text to a value
pub type DecodeFn = fn(&str) -> ImpalaResult<Value>;

/// Storage type and conversions for one semantic type
#[derive(Clone, Copy)]
pub struct Codec {
    pub storage_type: &'static str,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("storage_type", &self.storage_type)
            .finish()
    }
}

/// Registry of codecs keyed by semantic type
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<SemanticType, Codec>,
}

impl CodecRegistry {
    /// Registry with no codecs at all
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the built-in codecs
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(
            SemanticType::Int32,
            Codec {
                storage_type: "INT",
                encode: encode_integer,
                decode: decode_int32,
            },
        );
        registry.register(
            SemanticType::Int64,
            Codec {
                storage_type: "BIGINT",
                encode: encode_integer,
                decode: decode_int64,
            },
        );
        registry.register(
            SemanticType::Double,
            Codec {
                storage_type: "DOUBLE",
                encode: encode_double,
                decode: decode_double,
            },
        );
        registry.register(
            SemanticType::Boolean,
            Codec {
                storage_type: "BOOLEAN",
                encode: encode_boolean,
                decode: decode_boolean,
            },
        );
        registry.register(
            SemanticType::String,
            Codec {
                storage_type: "STRING",
                encode: encode_string,
                decode: decode_string,
            },
        );
        registry.register(
            SemanticType::Timestamp,
            Codec {
                storage_type: "BIGINT",
                encode: encode_timestamp,
                decode: decode_timestamp,
            },
        );
        registry.register(
            SemanticType::Duration,
            Codec {
                storage_type: "BIGINT",
                encode: encode_duration,
                decode: decode_duration,
            },
        );
        registry.register(
            SemanticType::Enum,
            Codec {
                storage_type: "INT",
                encode: encode_integer,
                decode: decode_enum,
            },
        );
        registry
    }

    /// Add or replace the codec for a tag
    pub fn register(&mut self, ty: SemanticType, codec: Codec) {
        self.codecs.insert(ty, codec);
    }

    /// Look up a codec; unregistered tags are a schema error
    pub fn codec(&self, ty: SemanticType) -> ImpalaResult<&Codec> {
        self.codecs.get(&ty).ok_or_else(|| {
            ImpalaError::Schema(format!("No codec registered for semantic type {}", ty))
        })
    }

    pub fn storage_type(&self, ty: SemanticType) -> ImpalaResult<&'static str> {
        Ok(self.codec(ty)?.storage_type)
    }

    /// Render a value as SQL literal text
    pub fn encode(&self, ty: SemanticType, value: &Value) -> ImpalaResult<String> {
        if value.is_null() {
            return Ok(NULL_LITERAL.to_string());
        }
        (self.codec(ty)?.encode)(value)
    }

    /// Parse raw result text, honouring the NULL sentinel for nullable fields
    pub fn decode(&self, ty: SemanticType, nullable: bool, raw: &str) -> ImpalaResult<Value> {
        let codec = self.codec(ty)?;
        if nullable && raw == NULL_SENTINEL {
            return Ok(Value::Null);
        }
        (codec.decode)(raw)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn mismatch(expected: &str, value: &Value) -> ImpalaError {
    ImpalaError::Schema(format!(
        "cannot encode {} value as {}",
        value.kind(),
        expected
    ))
}

fn unparsable(raw: &str, ty: SemanticType) -> ImpalaError {
    ImpalaError::Schema(format!("cannot decode '{}' as {}", raw, ty))
}

fn encode_integer(value: &Value) -> ImpalaResult<String> {
    match value {
        Value::Int32(v) | Value::Enum(v) => Ok(v.to_string()),
        Value::Int64(v) => Ok(v.to_string()),
        other => Err(mismatch("integer", other)),
    }
}

fn encode_double(value: &Value) -> ImpalaResult<String> {
    match value {
        Value::Double(v) if v.is_finite() => Ok(v.to_string()),
        Value::Double(v) => Err(ImpalaError::Schema(format!(
            "non-finite double {} cannot be written",
            v
        ))),
        Value::Int32(v) => Ok(v.to_string()),
        Value::Int64(v) => Ok(v.to_string()),
        other => Err(mismatch("double", other)),
    }
}

fn encode_boolean(value: &Value) -> ImpalaResult<String> {
    match value {
        Value::Boolean(v) => Ok(v.to_string()),
        other => Err(mismatch("boolean", other)),
    }
}

fn encode_string(value: &Value) -> ImpalaResult<String> {
    match value {
        Value::Text(v) => Ok(quote(v)),
        other => Err(mismatch("string", other)),
    }
}

fn encode_timestamp(value: &Value) -> ImpalaResult<String> {
    match value {
        Value::Timestamp(ts) => Ok(ts.timestamp_millis().to_string()),
        other => Err(mismatch("timestamp", other)),
    }
}

fn encode_duration(value: &Value) -> ImpalaResult<String> {
    match value {
        Value::Duration(d) => Ok(d.num_milliseconds().to_string()),
        other => Err(mismatch("duration", other)),
    }
}

/// Double-quote a string literal, escaping backslashes and quotes
pub fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn decode_int32(raw: &str) -> ImpalaResult<Value> {
    raw.trim()
        .parse()
        .map(Value::Int32)
        .map_err(|_| unparsable(raw, SemanticType::Int32))
}

fn decode_int64(raw: &str) -> ImpalaResult<Value> {
    raw.trim()
        .parse()
        .map(Value::Int64)
        .map_err(|_| unparsable(raw, SemanticType::Int64))
}

fn decode_double(raw: &str) -> ImpalaResult<Value> {
    raw.trim()
        .parse()
        .map(Value::Double)
        .map_err(|_| unparsable(raw, SemanticType::Double))
}

fn decode_boolean(raw: &str) -> ImpalaResult<Value> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(Value::Boolean(true)),
        "false" | "0" => Ok(Value::Boolean(false)),
        _ => Err(unparsable(raw, SemanticType::Boolean)),
    }
}

fn decode_string(raw: &str) -> ImpalaResult<Value> {
    Ok(Value::Text(raw.to_string()))
}

fn decode_timestamp(raw: &str) -> ImpalaResult<Value> {
    let millis: i64 = raw
        .trim()
        .parse()
        .map_err(|_| unparsable(raw, SemanticType::Timestamp))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Value::Timestamp)
        .ok_or_else(|| unparsable(raw, SemanticType::Timestamp))
}

fn decode_duration(raw: &str) -> ImpalaResult<Value> {
    raw.trim()
        .parse()
        .map(|ms| Value::Duration(chrono::Duration::milliseconds(ms)))
        .map_err(|_| unparsable(raw, SemanticType::Duration))
}

fn decode_enum(raw: &str) -> ImpalaResult<Value> {
    raw.trim()
        .parse()
        .map(Value::Enum)
        .map_err(|_| unparsable(raw, SemanticType::Enum))
}

/// A destination field of a query target type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub ty: SemanticType,
    pub nullable: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: SemanticType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }

    pub fn nullable(name: impl Into<String>, ty: SemanticType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }
}

/// One decoded result row, in destination field order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Raw value by case-insensitive field name
    pub fn value(&self, name: &str) -> ImpalaResult<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
            .ok_or_else(|| ImpalaError::Schema(format!("record has no field '{}'", name)))
    }

    /// Typed value by case-insensitive field name
    pub fn get<T: FromValue>(&self, name: &str) -> ImpalaResult<T> {
        let value = self.value(name)?;
        T::from_value(value).map_err(|e| match e {
            ImpalaError::Schema(message) => {
                ImpalaError::Schema(format!("field '{}': {}", name, message))
            }
            other => other,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Conversion from a decoded value into a Rust field type
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> ImpalaResult<Self>;
}

fn wrong_type(expected: &str, value: &Value) -> ImpalaError {
    ImpalaError::Schema(format!("expected {}, found {}", expected, value.kind()))
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> ImpalaResult<Self> {
        match value {
            Value::Int32(v) | Value::Enum(v) => Ok(*v),
            other => Err(wrong_type("Int32", other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> ImpalaResult<Self> {
        match value {
            Value::Int64(v) => Ok(*v),
            Value::Int32(v) | Value::Enum(v) => Ok(i64::from(*v)),
            other => Err(wrong_type("Int64", other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> ImpalaResult<Self> {
        match value {
            Value::Double(v) => Ok(*v),
            other => Err(wrong_type("Double", other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> ImpalaResult<Self> {
        match value {
            Value::Boolean(v) => Ok(*v),
            other => Err(wrong_type("Boolean", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> ImpalaResult<Self> {
        match value {
            Value::Text(v) => Ok(v.clone()),
            other => Err(wrong_type("Text", other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> ImpalaResult<Self> {
        match value {
            Value::Timestamp(v) => Ok(*v),
            other => Err(wrong_type("Timestamp", other)),
        }
    }
}

impl FromValue for chrono::Duration {
    fn from_value(value: &Value) -> ImpalaResult<Self> {
        match value {
            Value::Duration(v) => Ok(*v),
            other => Err(wrong_type("Duration", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> ImpalaResult<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
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

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<chrono::Duration> for Value {
    fn from(v: chrono::Duration) -> Self {
        Value::Duration(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_per_semantic_type() {
        let registry = CodecRegistry::with_defaults();
        let instant = Utc.timestamp_millis_opt(946_684_800_000).unwrap();

        assert_eq!(
            registry
                .encode(SemanticType::Timestamp, &Value::Timestamp(instant))
                .unwrap(),
            "946684800000"
        );
        assert_eq!(
            registry
                .encode(SemanticType::Int64, &Value::Int64(-42))
                .unwrap(),
            "-42"
        );
        assert_eq!(
            registry
                .encode(SemanticType::String, &Value::Text("abc".to_string()))
                .unwrap(),
            "\"abc\""
        );
        assert_eq!(
            registry.encode(SemanticType::Enum, &Value::Enum(3)).unwrap(),
            "3"
        );
        assert_eq!(
            registry
                .encode(
                    SemanticType::Duration,
                    &Value::Duration(chrono::Duration::seconds(90))
                )
                .unwrap(),
            "90000"
        );
        assert_eq!(
            registry.encode(SemanticType::Int32, &Value::Null).unwrap(),
            "null"
        );
    }

    #[test]
    fn test_string_quoting_escapes() {
        assert_eq!(quote(r#"say "hi" \o/"#), r#""say \"hi\" \\o/""#);
        assert_eq!(quote("two\nlines"), "\"two\\nlines\"");
    }

    #[test]
    fn test_encode_type_mismatch_is_schema_error() {
        let registry = CodecRegistry::with_defaults();
        let err = registry
            .encode(SemanticType::Timestamp, &Value::Text("now".to_string()))
            .unwrap_err();
        assert!(matches!(err, ImpalaError::Schema(_)));
    }

    #[test]
    fn test_unregistered_tag_is_schema_error() {
        let registry = CodecRegistry::with_defaults();
        assert!(matches!(
            registry.decode(SemanticType::Decimal, false, "1.5"),
            Err(ImpalaError::Schema(_))
        ));
        assert!(matches!(
            CodecRegistry::empty().storage_type(SemanticType::Int32),
            Err(ImpalaError::Schema(_))
        ));
    }

    #[test]
    fn test_decode_null_sentinel_only_for_nullable() {
        let registry = CodecRegistry::with_defaults();
        assert_eq!(
            registry.decode(SemanticType::Int64, true, "NULL").unwrap(),
            Value::Null
        );
        assert_eq!(
            registry.decode(SemanticType::Int64, true, "7").unwrap(),
            Value::Int64(7)
        );
        assert!(registry.decode(SemanticType::Int64, false, "NULL").is_err());
        // Strings are identity unless the field is nullable
        assert_eq!(
            registry.decode(SemanticType::String, false, "NULL").unwrap(),
            Value::Text("NULL".to_string())
        );
    }

    #[test]
    fn test_decode_temporal_types() {
        let registry = CodecRegistry::with_defaults();
        match registry
            .decode(SemanticType::Timestamp, false, "946684800000")
            .unwrap()
        {
            Value::Timestamp(ts) => assert_eq!(ts.to_rfc3339(), "2000-01-01T00:00:00+00:00"),
            other => panic!("unexpected value {other:?}"),
        }
        assert_eq!(
            registry
                .decode(SemanticType::Duration, false, "1500")
                .unwrap(),
            Value::Duration(chrono::Duration::milliseconds(1500))
        );
    }

    #[test]
    fn test_partition_key_types() {
        let instant = Utc.timestamp_millis_opt(1_000).unwrap();
        assert_eq!(Value::Timestamp(instant).partition_key().unwrap(), 1_000);
        assert_eq!(Value::Int32(7).partition_key().unwrap(), 7);
        assert_eq!(Value::Int64(-7).partition_key().unwrap(), -7);
        assert!(matches!(
            Value::Text("x".to_string()).partition_key(),
            Err(ImpalaError::Schema(_))
        ));
    }

    #[test]
    fn test_record_typed_access() {
        let mut record = Record::new();
        record.push("TotalPasses", Value::Int32(26));
        record.push("bucket", Value::Int64(365));
        record.push("note", Value::Null);

        assert_eq!(record.get::<i32>("totalpasses").unwrap(), 26);
        assert_eq!(record.get::<i64>("BUCKET").unwrap(), 365);
        assert_eq!(record.get::<Option<String>>("note").unwrap(), None);
        assert!(record.get::<String>("bucket").is_err());
        assert!(record.get::<i32>("missing").is_err());
    }

    #[test]
    fn test_value_from_option() {
        assert_eq!(Value::from(Some(5i64)), Value::Int64(5));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
