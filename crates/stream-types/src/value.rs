//! Column types and values converted from the `pgoutput` text format.

use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use std::iter::Peekable;
use std::str::Chars;

/// Column data type, derived from the PostgreSQL type OID in a RELATION message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Text,
    Varchar,
    Char,
    Bytea,
    Uuid,
    Json,
    Jsonb,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    TimeTz,
    Interval,
    Array(Box<DataType>),
    /// A type without a dedicated conversion; values are kept as text.
    Other(u32),
}

impl DataType {
    pub fn from_oid(oid: u32) -> Self {
        match oid {
            16 => DataType::Bool,
            17 => DataType::Bytea,
            18 | 1042 => DataType::Char,
            19 | 25 => DataType::Text,
            20 => DataType::BigInt,
            21 => DataType::SmallInt,
            23 => DataType::Integer,
            114 => DataType::Json,
            700 => DataType::Real,
            701 => DataType::Double,
            1043 => DataType::Varchar,
            1082 => DataType::Date,
            1083 => DataType::Time,
            1114 => DataType::Timestamp,
            1184 => DataType::TimestampTz,
            1186 => DataType::Interval,
            1266 => DataType::TimeTz,
            1700 => DataType::Numeric,
            2950 => DataType::Uuid,
            3802 => DataType::Jsonb,
            199 => array_of(DataType::Json),
            1000 => array_of(DataType::Bool),
            1001 => array_of(DataType::Bytea),
            1005 => array_of(DataType::SmallInt),
            1007 => array_of(DataType::Integer),
            1009 => array_of(DataType::Text),
            1014 => array_of(DataType::Char),
            1015 => array_of(DataType::Varchar),
            1016 => array_of(DataType::BigInt),
            1021 => array_of(DataType::Real),
            1022 => array_of(DataType::Double),
            1115 => array_of(DataType::Timestamp),
            1182 => array_of(DataType::Date),
            1183 => array_of(DataType::Time),
            1185 => array_of(DataType::TimestampTz),
            1231 => array_of(DataType::Numeric),
            2951 => array_of(DataType::Uuid),
            3807 => array_of(DataType::Jsonb),
            other => DataType::Other(other),
        }
    }

    /// Type name used in envelope schema descriptors.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataType::Bool => "boolean",
            DataType::SmallInt => "int16",
            DataType::Integer => "int32",
            DataType::BigInt => "int64",
            DataType::Real => "float32",
            DataType::Double => "float64",
            DataType::Numeric => "decimal",
            DataType::Text | DataType::Varchar | DataType::Char => "string",
            DataType::Bytea => "bytes",
            DataType::Uuid => "uuid",
            DataType::Json | DataType::Jsonb => "json",
            DataType::Timestamp => "timestamp",
            DataType::TimestampTz => "timestamptz",
            DataType::Date => "date",
            DataType::Time => "time",
            DataType::TimeTz => "timetz",
            DataType::Interval => "interval",
            DataType::Array(_) => "array",
            DataType::Other(_) => "string",
        }
    }

    /// Element type for arrays.
    pub fn element(&self) -> Option<&DataType> {
        match self {
            DataType::Array(inner) => Some(inner),
            _ => None,
        }
    }
}

fn array_of(element: DataType) -> DataType {
    DataType::Array(Box::new(element))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert '{input}' to {data_type:?}: {reason}")]
pub struct ValueError {
    pub data_type: DataType,
    pub input: String,
    pub reason: String,
}

impl ValueError {
    fn new(data_type: &DataType, input: &str, reason: impl Into<String>) -> Self {
        Self {
            data_type: data_type.clone(),
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A column value with proper type information.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    // Numeric types
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Numeric(String), // kept as text to preserve precision

    // String types
    Text(String),
    Varchar(String),
    Char(String),

    Boolean(bool),
    Bytea(Vec<u8>),
    Uuid(String),

    // JSON types
    Json(serde_json::Value),
    Jsonb(serde_json::Value),

    // Date/Time types, kept in PostgreSQL's output format
    Timestamp(String),
    TimestampTz(String),
    Date(String),
    Time(String),
    TimeTz(String),
    Interval(String),

    Array(Vec<Value>),

    Null,
    /// A TOASTed value the source did not resend because it did not change.
    Unchanged,
}

/// Marker written in place of values the source did not send.
pub const UNCHANGED_PLACEHOLDER: &str = "__unavailable_value";

impl Value {
    /// Converts a column value from PostgreSQL's text output format.
    pub fn from_text(data_type: &DataType, text: &str) -> Result<Value, ValueError> {
        let parse_err = |e: &dyn std::fmt::Display| ValueError::new(data_type, text, e.to_string());
        match data_type {
            DataType::Bool => match text {
                "t" | "true" => Ok(Value::Boolean(true)),
                "f" | "false" => Ok(Value::Boolean(false)),
                _ => Err(ValueError::new(data_type, text, "expected 't' or 'f'")),
            },
            DataType::SmallInt => text.parse().map(Value::SmallInt).map_err(|e| parse_err(&e)),
            DataType::Integer => text.parse().map(Value::Integer).map_err(|e| parse_err(&e)),
            DataType::BigInt => text.parse().map(Value::BigInt).map_err(|e| parse_err(&e)),
            DataType::Real => parse_float(text)
                .map(|v| Value::Real(v as f32))
                .ok_or_else(|| ValueError::new(data_type, text, "invalid float")),
            DataType::Double => parse_float(text)
                .map(Value::Double)
                .ok_or_else(|| ValueError::new(data_type, text, "invalid float")),
            DataType::Numeric => Ok(Value::Numeric(text.to_string())),
            DataType::Text | DataType::Other(_) => Ok(Value::Text(text.to_string())),
            DataType::Varchar => Ok(Value::Varchar(text.to_string())),
            DataType::Char => Ok(Value::Char(text.to_string())),
            DataType::Bytea => match text.strip_prefix("\\x") {
                Some(hex_str) => hex::decode(hex_str)
                    .map(Value::Bytea)
                    .map_err(|e| parse_err(&e)),
                None => Ok(Value::Bytea(text.as_bytes().to_vec())),
            },
            DataType::Uuid => Ok(Value::Uuid(text.to_string())),
            DataType::Json => serde_json::from_str(text)
                .map(Value::Json)
                .map_err(|e| parse_err(&e)),
            DataType::Jsonb => serde_json::from_str(text)
                .map(Value::Jsonb)
                .map_err(|e| parse_err(&e)),
            DataType::Timestamp => Ok(Value::Timestamp(text.to_string())),
            DataType::TimestampTz => Ok(Value::TimestampTz(text.to_string())),
            DataType::Date => Ok(Value::Date(text.to_string())),
            DataType::Time => Ok(Value::Time(text.to_string())),
            DataType::TimeTz => Ok(Value::TimeTz(text.to_string())),
            DataType::Interval => Ok(Value::Interval(text.to_string())),
            DataType::Array(element) => parse_array(text, element)
                .map(Value::Array)
                .map_err(|reason| ValueError::new(data_type, text, reason)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text form used when deriving partition keys.
    pub fn to_key_string(&self) -> String {
        match self {
            Value::SmallInt(v) => v.to_string(),
            Value::Integer(v) => v.to_string(),
            Value::BigInt(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Boolean(v) => v.to_string(),
            Value::Numeric(s)
            | Value::Text(s)
            | Value::Varchar(s)
            | Value::Char(s)
            | Value::Uuid(s)
            | Value::Timestamp(s)
            | Value::TimestampTz(s)
            | Value::Date(s)
            | Value::Time(s)
            | Value::TimeTz(s)
            | Value::Interval(s) => s.clone(),
            Value::Bytea(bytes) => hex::encode(bytes),
            Value::Json(v) | Value::Jsonb(v) => v.to_string(),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(Value::to_key_string).collect();
                format!("{{{}}}", parts.join(","))
            }
            Value::Null => String::new(),
            Value::Unchanged => UNCHANGED_PLACEHOLDER.to_string(),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::SmallInt(v) => serializer.serialize_i16(*v),
            Value::Integer(v) => serializer.serialize_i32(*v),
            Value::BigInt(v) => serializer.serialize_i64(*v),
            Value::Real(v) => serializer.serialize_f32(*v),
            Value::Double(v) => serializer.serialize_f64(*v),
            Value::Boolean(v) => serializer.serialize_bool(*v),
            Value::Numeric(s)
            | Value::Text(s)
            | Value::Varchar(s)
            | Value::Char(s)
            | Value::Uuid(s)
            | Value::Timestamp(s)
            | Value::TimestampTz(s)
            | Value::Date(s)
            | Value::Time(s)
            | Value::TimeTz(s)
            | Value::Interval(s) => serializer.serialize_str(s),
            Value::Bytea(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            Value::Json(v) | Value::Jsonb(v) => v.serialize(serializer),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Null => serializer.serialize_none(),
            Value::Unchanged => serializer.serialize_str(UNCHANGED_PLACEHOLDER),
        }
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => text.parse().ok(),
    }
}

/// Parses PostgreSQL's array literal format, e.g. `{1,2,NULL}` or
/// `{"a,b","c \"d\""}`. Nested arrays become nested [`Value::Array`]s.
fn parse_array(text: &str, element: &DataType) -> Result<Vec<Value>, String> {
    // Arrays with non-default lower bounds are prefixed with "[1:3]=".
    let body = match text.split_once('=') {
        Some((bounds, rest)) if bounds.starts_with('[') => rest,
        _ => text,
    };
    let mut parser = ArrayParser {
        chars: body.chars().peekable(),
        element,
    };
    let values = parser.parse()?;
    if parser.chars.next().is_some() {
        return Err("trailing characters after array".to_string());
    }
    Ok(values)
}

struct ArrayParser<'a> {
    chars: Peekable<Chars<'a>>,
    element: &'a DataType,
}

impl ArrayParser<'_> {
    fn parse(&mut self) -> Result<Vec<Value>, String> {
        if self.chars.next() != Some('{') {
            return Err("array must start with '{'".to_string());
        }
        let mut values = Vec::new();
        if self.chars.peek() == Some(&'}') {
            self.chars.next();
            return Ok(values);
        }
        loop {
            let value = match self.chars.peek() {
                Some('{') => Value::Array(self.parse()?),
                Some('"') => {
                    let raw = self.quoted()?;
                    Value::from_text(self.element, &raw).map_err(|e| e.reason)?
                }
                Some(_) => {
                    let raw = self.unquoted();
                    if raw.eq_ignore_ascii_case("NULL") {
                        Value::Null
                    } else {
                        Value::from_text(self.element, &raw).map_err(|e| e.reason)?
                    }
                }
                None => return Err("unterminated array".to_string()),
            };
            values.push(value);
            match self.chars.next() {
                Some(',') => continue,
                Some('}') => return Ok(values),
                Some(c) => return Err(format!("unexpected '{c}' in array")),
                None => return Err("unterminated array".to_string()),
            }
        }
    }

    fn quoted(&mut self) -> Result<String, String> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some('\\') => match self.chars.next() {
                    Some(c) => out.push(c),
                    None => return Err("unterminated escape".to_string()),
                },
                Some('"') => return Ok(out),
                Some(c) => out.push(c),
                None => return Err("unterminated quoted element".to_string()),
            }
        }
    }

    fn unquoted(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c == ',' || c == '}' {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(
            Value::from_text(&DataType::Bool, "t").unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            Value::from_text(&DataType::Integer, "-42").unwrap(),
            Value::Integer(-42)
        );
        assert_eq!(
            Value::from_text(&DataType::BigInt, "9000000000").unwrap(),
            Value::BigInt(9_000_000_000)
        );
        assert_eq!(
            Value::from_text(&DataType::Numeric, "12345.678900").unwrap(),
            Value::Numeric("12345.678900".to_string())
        );
        assert_eq!(
            Value::from_text(&DataType::Bytea, "\\x0aff").unwrap(),
            Value::Bytea(vec![0x0a, 0xff])
        );
        assert_eq!(
            Value::from_text(&DataType::Jsonb, r#"{"a": [1, 2]}"#).unwrap(),
            Value::Jsonb(json!({"a": [1, 2]}))
        );
        assert_eq!(
            Value::from_text(&DataType::Other(600), "(1,2)").unwrap(),
            Value::Text("(1,2)".to_string())
        );
    }

    #[test]
    fn test_invalid_scalar_is_an_error() {
        let err = Value::from_text(&DataType::Integer, "abc").unwrap_err();
        assert_eq!(err.data_type, DataType::Integer);
        assert_eq!(err.input, "abc");
        assert!(Value::from_text(&DataType::Bool, "yes").is_err());
    }

    #[test]
    fn test_special_floats() {
        match Value::from_text(&DataType::Double, "NaN").unwrap() {
            Value::Double(v) => assert!(v.is_nan()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            Value::from_text(&DataType::Real, "-Infinity").unwrap(),
            Value::Real(f32::NEG_INFINITY)
        );
    }

    #[test]
    fn test_array_parsing() {
        let int_array = DataType::from_oid(1007);
        assert_eq!(
            Value::from_text(&int_array, "{1,2,NULL}").unwrap(),
            Value::Array(vec![Value::Integer(1), Value::Integer(2), Value::Null])
        );
        assert_eq!(
            Value::from_text(&int_array, "{}").unwrap(),
            Value::Array(vec![])
        );

        let text_array = DataType::from_oid(1009);
        assert_eq!(
            Value::from_text(&text_array, r#"{"a,b","say \"hi\"",plain,"NULL"}"#).unwrap(),
            Value::Array(vec![
                Value::Text("a,b".to_string()),
                Value::Text("say \"hi\"".to_string()),
                Value::Text("plain".to_string()),
                Value::Text("NULL".to_string()),
            ])
        );
    }

    #[test]
    fn test_nested_and_bounded_arrays() {
        let int_array = DataType::from_oid(1007);
        assert_eq!(
            Value::from_text(&int_array, "{{1,2},{3,4}}").unwrap(),
            Value::Array(vec![
                Value::Array(vec![Value::Integer(1), Value::Integer(2)]),
                Value::Array(vec![Value::Integer(3), Value::Integer(4)]),
            ])
        );
        assert_eq!(
            Value::from_text(&int_array, "[0:1]={7,8}").unwrap(),
            Value::Array(vec![Value::Integer(7), Value::Integer(8)])
        );
        assert!(Value::from_text(&int_array, "{1,2").is_err());
        assert!(Value::from_text(&int_array, "{1,x}").is_err());
    }

    #[test]
    fn test_serialization() {
        let values = vec![
            Value::Integer(1),
            Value::Bytea(vec![0xde, 0xad]),
            Value::Null,
            Value::Unchanged,
            Value::Array(vec![Value::Text("x".to_string())]),
        ];
        assert_eq!(
            serde_json::to_value(&values).unwrap(),
            json!([1, "dead", null, "__unavailable_value", ["x"]])
        );
    }

    #[test]
    fn test_key_strings() {
        assert_eq!(Value::Integer(7).to_key_string(), "7");
        assert_eq!(Value::Text("abc".to_string()).to_key_string(), "abc");
        assert_eq!(Value::Null.to_key_string(), "");
        assert_eq!(
            Value::Array(vec![Value::Integer(1), Value::Integer(2)]).to_key_string(),
            "{1,2}"
        );
    }
}
