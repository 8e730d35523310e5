use crate::error::CoerceError;
use crate::field::FieldKind;

/// A column value converted from text.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Str(String),
    Int(i64),
    Uint(u64),
}

/// Convert a raw token into a value of the given kind.
///
/// Tokens are taken as-is: no trimming, no quote stripping.
pub fn coerce(kind: FieldKind, raw: &str) -> Result<Value, CoerceError> {
    match kind {
        FieldKind::Float => raw
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| CoerceError::coercion(kind, raw, e)),
        FieldKind::Int => raw
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| CoerceError::coercion(kind, raw, e)),
        FieldKind::Uint => raw
            .parse::<u64>()
            .map(Value::Uint)
            .map_err(|e| CoerceError::coercion(kind, raw, e)),
        FieldKind::Str => Ok(Value::Str(raw.to_string())),
        FieldKind::Unsupported(type_name) => Err(CoerceError::UnsupportedType { type_name }),
    }
}
