//! Value conversion for parameters the proxy synthesizes itself (rather than
//! forwarding a raw binary-protocol blob). Grounded on
//! `database/mysql/statement.go`'s `converter.ConvertValue` — same boundary
//! at 2^63 for unsigned 64-bit values, same pointer-indirection rule.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt64Text(String),
    Float(f64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported type {0}")]
pub struct UnsupportedType(pub &'static str);

/// Source values a caller can hand in; pointers are modeled as `Option`, with
/// `None` at any depth converting to `Value::Null`.
#[derive(Debug, Clone)]
pub enum RawValue {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
    Str(String),
    Opt(Option<Box<RawValue>>),
}

const U64_SIGNED_BOUNDARY: u64 = 1 << 63;

pub fn convert_value(v: &RawValue) -> Result<Value, UnsupportedType> {
    match v {
        RawValue::Null => Ok(Value::Null),
        RawValue::Opt(None) => Ok(Value::Null),
        RawValue::Opt(Some(inner)) => convert_value(inner),
        RawValue::Bool(b) => Ok(Value::Int(*b as i64)),
        RawValue::I8(n) => Ok(Value::Int(*n as i64)),
        RawValue::I16(n) => Ok(Value::Int(*n as i64)),
        RawValue::I32(n) => Ok(Value::Int(*n as i64)),
        RawValue::I64(n) => Ok(Value::Int(*n)),
        RawValue::U8(n) => Ok(Value::Int(*n as i64)),
        RawValue::U16(n) => Ok(Value::Int(*n as i64)),
        RawValue::U32(n) => Ok(Value::Int(*n as i64)),
        RawValue::U64(n) => {
            if *n >= U64_SIGNED_BOUNDARY {
                Ok(Value::UInt64Text(n.to_string()))
            } else {
                Ok(Value::Int(*n as i64))
            }
        }
        RawValue::F32(f) => Ok(Value::Float(*f as f64)),
        RawValue::F64(f) => Ok(Value::Float(*f)),
        RawValue::Bytes(b) => Ok(Value::Bytes(b.clone())),
        RawValue::Str(s) => Ok(Value::Bytes(s.as_bytes().to_vec())),
    }
}
