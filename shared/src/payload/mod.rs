// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Argument payloads crossing the gateway.
//!
//! Payloads are polymorphic values over a closed set of variants. The
//! gateway never marshals them; each bridge adapts them to (and from) its
//! host language's native types, and is free to reject variants it cannot
//! represent.

use serde::{Deserialize, Serialize};

/// A handle referencing a bridge-owned object. The gateway treats it as
/// opaque; only the owning bridge can resolve `raw`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    /// Language name of the owning bridge.
    pub owner: String,
    /// Bridge-scoped object token.
    pub raw: u64,
}

/// A polymorphic argument or return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// IEEE-754 double.
    Float(f64),
    /// UTF-8 string.
    String(String),
    Bytes(Vec<u8>),
    /// Homogeneous array; see [`Value::array`].
    Array(Vec<Value>),
    /// Opaque reference to a bridge-owned object.
    Handle(Handle),
}

/// Discriminant of a [`Value`], used for homogeneity checks and for
/// conversion error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Array,
    Handle,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Null => "null",
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::String => "string",
            Kind::Bytes => "bytes",
            Kind::Array => "array",
            Kind::Handle => "handle",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) => Kind::Int,
            Value::Float(_) => Kind::Float,
            Value::String(_) => Kind::String,
            Value::Bytes(_) => Kind::Bytes,
            Value::Array(_) => Kind::Array,
            Value::Handle(_) => Kind::Handle,
        }
    }

    /// Construct a homogeneous array, rejecting mixed element kinds. An
    /// empty array is homogeneous.
    pub fn array(elements: Vec<Value>) -> Result<Value, Kind> {
        if let Some(first) = elements.first() {
            let expect = first.kind();
            for e in elements.iter().skip(1) {
                if e.kind() != expect {
                    return Err(e.kind());
                }
            }
        }
        Ok(Value::Array(elements))
    }

    /// Returns true when every element of every (nested) array shares its
    /// siblings' kind.
    pub fn is_homogeneous(&self) -> bool {
        match self {
            Value::Array(elements) => {
                let mut kinds = elements.iter().map(Value::kind);
                match kinds.next() {
                    None => true,
                    Some(first) => {
                        kinds.all(|k| k == first)
                            && elements.iter().all(Value::is_homogeneous)
                    }
                }
            }
            _ => true,
        }
    }

    /// Returns true when the value contains no opaque handles, i.e. it can
    /// round-trip through any bridge's encode/decode pair.
    pub fn is_transparent(&self) -> bool {
        match self {
            Value::Handle(_) => false,
            Value::Array(elements) => elements.iter().all(Value::is_transparent),
            _ => true,
        }
    }

    /// Approximate in-memory footprint in bytes, used for call-scoped
    /// memory accounting.
    pub fn approx_size(&self) -> u64 {
        match self {
            Value::Null | Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::String(s) => s.len() as u64,
            Value::Bytes(b) => b.len() as u64,
            Value::Array(elements) => {
                8 + elements.iter().map(Value::approx_size).sum::<u64>()
            }
            Value::Handle(h) => 8 + h.owner.len() as u64,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_rejects_mixed_kinds() {
        let ok = Value::array(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(ok, Ok(Value::Array(vec![Value::Int(1), Value::Int(2)])));

        let bad = Value::array(vec![Value::Int(1), Value::Bool(true)]);
        assert_eq!(bad, Err(Kind::Bool));

        assert!(Value::array(vec![]).is_ok());
    }

    #[test]
    fn homogeneity_is_recursive() {
        let nested = Value::Array(vec![
            Value::Array(vec![Value::Int(1)]),
            Value::Array(vec![Value::Int(2), Value::Bool(false)]),
        ]);
        assert!(!nested.is_homogeneous());
    }

    #[test]
    fn handles_are_opaque() {
        let v = Value::Array(vec![Value::Handle(Handle {
            owner: "py".into(),
            raw: 9,
        })]);
        assert!(!v.is_transparent());
        assert!(Value::String("x".into()).is_transparent());
    }

    #[test]
    fn transparent_values_round_trip_through_encoding() {
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(1.5),
            Value::String("héllo".into()),
            Value::Bytes(vec![0, 255, 7]),
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        ];
        for v in values {
            let encoded = serde_json::to_string(&v).unwrap();
            let back: Value = serde_json::from_str(&encoded).unwrap();
            assert_eq!(back, v);
        }
    }
}
