//! Untyped rows produced by the fetcher, before assembly.

use std::collections::BTreeMap;

use alloy::primitives::U256;

use crate::Timestamp;

/// A single field value of a raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    UInt(u64),
    U256(U256),
    Binary(Vec<u8>),
    String(String),
    Timestamp(Timestamp),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::UInt(_) => "uint",
            Value::U256(_) => "u256",
            Value::Binary(_) => "binary",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<U256> for Value {
    fn from(value: U256) -> Self {
        Value::U256(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Binary(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Binary(value.to_vec())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Timestamp> for Value {
    fn from(value: Timestamp) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// One row as returned by the remote source, keyed by column name.
///
/// A column that the source did not return is simply absent; the assembler decides whether that
/// is acceptable for the projected schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord(BTreeMap<&'static str, Value>);

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: &'static str, value: impl Into<Value>) {
        self.0.insert(column, value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.0.remove(column)
    }
}
