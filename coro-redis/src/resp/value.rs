//! The RESP2/RESP3 value model: a tagged union over every reply type the
//! wire protocol can produce. Ownership is value-level — cloning a
//! `RedisValue` deep-copies it, the same as the wire representation itself
//! has no sharing.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub enum RedisValue {
    Null,
    SimpleString(String),
    BulkString(Bytes),
    VerbatimString { format: String, text: String },
    SimpleError(String),
    BulkError(Bytes),
    BigNumber(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Array(Vec<RedisValue>),
    Set(Vec<RedisValue>),
    Push(Vec<RedisValue>),
    Map(Vec<(RedisValue, RedisValue)>),
    /// An attribute reply (`|`) wraps the value that follows it on the
    /// wire, carrying out-of-band metadata alongside it.
    Attribute {
        attrs: Vec<(RedisValue, RedisValue)>,
        value: Box<RedisValue>,
    },
}

impl RedisValue {
    pub fn is_error(&self) -> bool {
        matches!(self, RedisValue::SimpleError(_) | RedisValue::BulkError(_))
    }

    pub fn as_error_message(&self) -> Option<&str> {
        match self {
            RedisValue::SimpleError(s) => Some(s),
            RedisValue::BulkError(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bulk_str(&self) -> Option<&str> {
        match self {
            RedisValue::BulkString(b) => std::str::from_utf8(b).ok(),
            RedisValue::SimpleString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RedisValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RedisValue]> {
        match self {
            RedisValue::Array(v) | RedisValue::Set(v) | RedisValue::Push(v) => Some(v),
            _ => None,
        }
    }

    /// Unwraps a top-level attribute, if present, returning the inner
    /// value — most callers don't care about out-of-band metadata.
    pub fn without_attribute(self) -> RedisValue {
        match self {
            RedisValue::Attribute { value, .. } => value.without_attribute(),
            other => other,
        }
    }
}
