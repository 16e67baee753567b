use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::shared::SharedArray;

/// Value tree of the reference engine. Everything except `Handle`, `Func`
/// and `Shared` is a plain immutable tree; those three carry identity and
/// need special handling when crossing heaps or being serialized.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Array(Arc<Vec<Value>>),
    Map(Arc<Vec<(Value, Value)>>),
    /// Reference to a function inside a named unit.
    Func { unit: Arc<str>, name: Arc<str> },
    /// Opaque runtime-object handle; meaningful only to the host registry.
    Handle(u64),
    /// Shared atomic buffer, passed between heaps without cloning.
    Shared(Arc<SharedArray>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    pub fn bytes(b: &[u8]) -> Value {
        Value::Bytes(Arc::from(b))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(items))
    }

    pub fn func(unit: &str, name: &str) -> Value {
        Value::Func {
            unit: Arc::from(unit),
            name: Arc::from(name),
        }
    }

    pub fn shared(len: usize) -> Value {
        Value::Shared(Arc::new(SharedArray::new(len)))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<u64> {
        match self {
            Value::Handle(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_shared(&self) -> Option<&Arc<SharedArray>> {
        match self {
            Value::Shared(arr) => Some(arr),
            _ => None,
        }
    }

    pub(crate) fn to_portable(&self) -> Result<Portable, RuntimeError> {
        Ok(match self {
            Value::Null => Portable::Null,
            Value::Bool(b) => Portable::Bool(*b),
            Value::Int(n) => Portable::Int(*n),
            Value::Float(x) => Portable::Float(*x),
            Value::Str(s) => Portable::Str(s.to_string()),
            Value::Bytes(b) => Portable::Bytes(b.to_vec()),
            Value::Array(items) => Portable::Array(
                items
                    .iter()
                    .map(|v| v.to_portable())
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(pairs) => Portable::Map(
                pairs
                    .iter()
                    .map(|(k, v)| Ok((k.to_portable()?, v.to_portable()?)))
                    .collect::<Result<_, RuntimeError>>()?,
            ),
            Value::Func { unit, name } => Portable::Func {
                unit: unit.to_string(),
                name: name.to_string(),
            },
            Value::Handle(_) => {
                return Err(RuntimeError::transfer("handle values are not serializable"))
            }
            Value::Shared(_) => {
                return Err(RuntimeError::transfer(
                    "shared array values are not serializable",
                ))
            }
        })
    }

    pub(crate) fn from_portable(portable: Portable) -> Value {
        match portable {
            Portable::Null => Value::Null,
            Portable::Bool(b) => Value::Bool(b),
            Portable::Int(n) => Value::Int(n),
            Portable::Float(x) => Value::Float(x),
            Portable::Str(s) => Value::str(&s),
            Portable::Bytes(b) => Value::Bytes(Arc::from(&b[..])),
            Portable::Array(items) => {
                Value::array(items.into_iter().map(Value::from_portable).collect())
            }
            Portable::Map(pairs) => Value::Map(Arc::new(
                pairs
                    .into_iter()
                    .map(|(k, v)| (Value::from_portable(k), Value::from_portable(v)))
                    .collect(),
            )),
            Portable::Func { unit, name } => Value::func(&unit, &name),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (
                Value::Func { unit: ua, name: na },
                Value::Func { unit: ub, name: nb },
            ) => ua == ub && na == nb,
            (Value::Handle(a), Value::Handle(b)) => a == b,
            (Value::Shared(a), Value::Shared(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", &**s),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Func { unit, name } => write!(f, "{}:{}", unit, name),
            Value::Handle(id) => write!(f, "handle#{}", id),
            Value::Shared(arr) => write!(f, "shared[{}]", arr.len()),
        }
    }
}

/// Serde mirror of the serializable subset of `Value`.
#[derive(Serialize, Deserialize)]
pub(crate) enum Portable {
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Portable>),
    Map(Vec<(Portable, Portable)>),
    Func { unit: String, name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_equality() {
        let a = Value::array(vec![Value::Int(1), Value::str("x")]);
        let b = Value::array(vec![Value::Int(1), Value::str("x")]);
        assert_eq!(a, b);
        assert_ne!(a, Value::array(vec![Value::Int(2), Value::str("x")]));
    }

    #[test]
    fn shared_compares_by_identity() {
        let arr = Arc::new(SharedArray::new(1));
        assert_eq!(Value::Shared(arr.clone()), Value::Shared(arr));
        assert_ne!(
            Value::Shared(Arc::new(SharedArray::new(1))),
            Value::Shared(Arc::new(SharedArray::new(1)))
        );
    }

    #[test]
    fn handles_are_not_portable() {
        let err = Value::array(vec![Value::Handle(7)]).to_portable();
        assert!(err.is_err());
        assert!(err.err().map(|e| e.is_transfer()).unwrap_or(false));
    }
}
