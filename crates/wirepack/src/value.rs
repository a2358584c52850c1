//! # Values
//!
//! The loosely typed payload carried by requests and responses.
//!
//! The payload set is deliberately narrow: null, booleans, 64-bit integers and
//! floats, strings, byte blobs, ordered lists, and records (ordered named fields).
//! Anything richer must be expressed in terms of these before it crosses the wire.
//!
//! ## Invariants
//! - **Lossless**: `decode_value(encode_value(v)) == v` for every value within [`MAX_DEPTH`].
//! - **Bounded**: Encoding and decoding refuse values nested deeper than [`MAX_DEPTH`].

use std::fmt;

use crate::Decoder;
use crate::Encoder;
use crate::Error;
use crate::Result;
use crate::Tag;

/// The maximum nesting depth of lists and records.
pub const MAX_DEPTH: usize = 64;

/// A self-describing payload value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Named fields in declaration order.
    Record(Vec<(String, Value)>),
}

impl Value {
    /// Short name of the variant, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Looks up a record field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Encodes a value into the encoder stream.
///
/// # Errors
/// Returns `Error::DepthExceeded` if the value is nested too deeply.
pub fn encode_value(enc: &mut Encoder, val: &Value) -> Result<()> {
    encode_value_impl(enc, val, 0)
}

fn encode_value_impl(enc: &mut Encoder, val: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::DepthExceeded(MAX_DEPTH));
    }

    match val {
        Value::Null => enc.null()?,
        Value::Bool(b) => enc.bool(*b)?,
        Value::Int(v) => enc.int(*v)?,
        Value::Float(v) => enc.float(*v)?,
        Value::Str(s) => enc.str(s)?,
        Value::Bytes(b) => enc.bytes(b)?,
        Value::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_value_impl(enc, item, depth + 1)?;
            }
            enc.list_end()?;
        }
        Value::Record(fields) => {
            enc.map_begin()?;
            for (name, value) in fields {
                enc.variant_begin(name)?;
                encode_value_impl(enc, value, depth + 1)?;
                enc.variant_end()?;
            }
            enc.map_end()?;
        }
    }
    Ok(())
}

/// Decodes exactly one value, driven by the wire tags alone.
pub fn decode_value(dec: &mut Decoder) -> Result<Value> {
    decode_value_impl(dec, 0)
}

fn decode_value_impl(dec: &mut Decoder, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::DepthExceeded(MAX_DEPTH));
    }

    match dec.peek_tag()? {
        Tag::Null => { dec.null()?; Ok(Value::Null) }
        Tag::BoolTrue | Tag::BoolFalse => Ok(Value::Bool(dec.bool()?)),
        Tag::Int => Ok(Value::Int(dec.int()?)),
        Tag::Float => Ok(Value::Float(dec.float()?)),
        Tag::String => Ok(Value::Str(dec.str()?.to_string())),
        Tag::Bytes => Ok(Value::Bytes(dec.bytes()?.to_vec())),
        Tag::List => {
            let mut iter = dec.list()?;
            let mut items = Vec::new();
            while let Some(mut item) = iter.next()? {
                items.push(decode_value_impl(&mut item, depth + 1)?);
                item.finish()?;
            }
            Ok(Value::List(items))
        }
        Tag::Map => {
            let mut iter = dec.map()?;
            let mut fields = Vec::new();
            while let Some((name, mut payload)) = iter.next()? {
                let value = decode_value_impl(&mut payload, depth + 1)?;
                payload.finish()?;
                fields.push((name.to_string(), value));
            }
            Ok(Value::Record(fields))
        }
        // variants only appear as map entries or envelope wrappers
        found @ Tag::Variant => Err(Error::UnexpectedTag { expected: Tag::Map, found }),
    }
}

// ============================================================================
//  CONVERSIONS
// ============================================================================

impl From<()> for Value {
    fn from(_: ()) -> Self { Value::Null }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v.into()) }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self { Value::Int(v.into()) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Str(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::Str(v) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// A value did not have the shape a typed consumer asked for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected}, found {found}")]
pub struct FromValueError {
    pub expected: &'static str,
    pub found: &'static str,
}

impl FromValueError {
    pub fn new(expected: &'static str, found: &Value) -> Self {
        Self { expected, found: found.kind() }
    }
}

/// Typed extraction from a [`Value`].
///
/// Used for operation parameters on the server and typed answers on the client.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        match value {
            Value::Null => Ok(()),
            other => Err(FromValueError::new("null", &other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(FromValueError::new("bool", &other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        match value {
            Value::Int(v) => Ok(v),
            other => Err(FromValueError::new("int", &other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        match value {
            Value::Int(v) => i32::try_from(v).map_err(|_| FromValueError { expected: "i32", found: "int" }),
            other => Err(FromValueError::new("int", &other)),
        }
    }
}

impl FromValue for u32 {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        match value {
            Value::Int(v) => u32::try_from(v).map_err(|_| FromValueError { expected: "u32", found: "int" }),
            other => Err(FromValueError::new("int", &other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        match value {
            Value::Float(v) => Ok(v),
            other => Err(FromValueError::new("float", &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(FromValueError::new("string", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> std::result::Result<Self, FromValueError> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(FromValueError::new("list", &other)),
        }
    }
}
