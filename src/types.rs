use serde::{de::DeserializeOwned, Serialize};
use std::{any, fmt};

pub use serde_json::Value;

/// Positional arguments of a call.
pub type Args = Vec<Value>;

/// Keyword arguments of a call.
pub type Kwargs = serde_json::Map<String, Value>;

/// Correlation identifier of a tracked call.
pub type CallId = u64;

/// Decode the positional argument at `index` into a `T`.
///
/// A missing argument is decoded from `null`, so `Option<T>` parameters may be
/// left off the end of the argument list.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, TypeMismatch> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    decode(value, Position::Index(index))
}

/// Decode the keyword argument `name` into a `T`, with the same `null` rule as [`arg`].
pub fn kwarg<T: DeserializeOwned>(kwargs: &Kwargs, name: &str) -> Result<T, TypeMismatch> {
    let value = kwargs.get(name).cloned().unwrap_or(Value::Null);
    decode(value, Position::Name(name.to_owned()))
}

/// Encode a handler return value.
pub fn to_value<T: Serialize>(val: T) -> Result<Value, TypeMismatch> {
    serde_json::to_value(val).map_err(|e| TypeMismatch {
        position: Position::Return,
        expected: any::type_name::<T>(),
        value: Value::Null,
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(value: Value, position: Position) -> Result<T, TypeMismatch> {
    serde_json::from_value(value.clone()).map_err(|e| TypeMismatch {
        position,
        expected: any::type_name::<T>(),
        value,
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Position {
    Index(usize),
    Name(String),
    Return,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Position::Index(i) => write!(f, "argument {i}"),
            Position::Name(name) => write!(f, "keyword argument `{name}`"),
            Position::Return => f.write_str("return value"),
        }
    }
}

/// An argument or return value did not have the shape a handler expected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("type error: {position} = {value} :/: {expected} ({reason})")]
pub struct TypeMismatch {
    position: Position,
    expected: &'static str,
    value: Value,
    reason: String,
}
