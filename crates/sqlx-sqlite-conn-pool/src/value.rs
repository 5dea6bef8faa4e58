//! Column values and rows
//!
//! Values are a closed set over SQLite's storage classes. Converting to a Rust
//! type goes through [`FromValue`], which fails with [`Error::TypeMismatch`]
//! instead of guessing.

use std::fmt;
use std::sync::Arc;

use crate::Result;
use crate::error::Error;

/// SQLite storage class of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
   Integer,
   Float,
   Text,
   Blob,
   Null,
}

impl fmt::Display for StorageClass {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         StorageClass::Integer => "integer",
         StorageClass::Float => "float",
         StorageClass::Text => "text",
         StorageClass::Blob => "blob",
         StorageClass::Null => "null",
      };
      f.write_str(name)
   }
}

/// A single SQLite value, used both for bound parameters and result columns
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
}

impl Value {
   pub fn storage_class(&self) -> StorageClass {
      match self {
         Value::Null => StorageClass::Null,
         Value::Integer(_) => StorageClass::Integer,
         Value::Real(_) => StorageClass::Float,
         Value::Text(_) => StorageClass::Text,
         Value::Blob(_) => StorageClass::Blob,
      }
   }

   pub fn is_null(&self) -> bool {
      matches!(self, Value::Null)
   }

   fn mismatch(&self, expected: &'static str) -> Error {
      Error::TypeMismatch {
         expected,
         found: self.storage_class(),
      }
   }
}

impl From<i64> for Value {
   fn from(v: i64) -> Self {
      Value::Integer(v)
   }
}

impl From<i32> for Value {
   fn from(v: i32) -> Self {
      Value::Integer(v.into())
   }
}

impl From<u32> for Value {
   fn from(v: u32) -> Self {
      Value::Integer(v.into())
   }
}

impl From<bool> for Value {
   fn from(v: bool) -> Self {
      Value::Integer(v as i64)
   }
}

impl From<f64> for Value {
   fn from(v: f64) -> Self {
      Value::Real(v)
   }
}

impl From<&str> for Value {
   fn from(v: &str) -> Self {
      Value::Text(v.to_owned())
   }
}

impl From<String> for Value {
   fn from(v: String) -> Self {
      Value::Text(v)
   }
}

impl From<Vec<u8>> for Value {
   fn from(v: Vec<u8>) -> Self {
      Value::Blob(v)
   }
}

impl From<&[u8]> for Value {
   fn from(v: &[u8]) -> Self {
      Value::Blob(v.to_vec())
   }
}

impl<T: Into<Value>> From<Option<T>> for Value {
   fn from(v: Option<T>) -> Self {
      v.map_or(Value::Null, Into::into)
   }
}

/// Conversion from a column [`Value`] into a Rust type
pub trait FromValue: Sized {
   fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for Value {
   fn from_value(value: &Value) -> Result<Self> {
      Ok(value.clone())
   }
}

impl FromValue for i64 {
   fn from_value(value: &Value) -> Result<Self> {
      match value {
         Value::Integer(v) => Ok(*v),
         other => Err(other.mismatch("i64")),
      }
   }
}

impl FromValue for i32 {
   fn from_value(value: &Value) -> Result<Self> {
      let v = i64::from_value(value).map_err(|_| value.mismatch("i32"))?;
      i32::try_from(v).map_err(|_| Error::IntegerOutOfRange {
         value: v,
         target: "i32",
      })
   }
}

impl FromValue for u32 {
   fn from_value(value: &Value) -> Result<Self> {
      let v = i64::from_value(value).map_err(|_| value.mismatch("u32"))?;
      u32::try_from(v).map_err(|_| Error::IntegerOutOfRange {
         value: v,
         target: "u32",
      })
   }
}

impl FromValue for bool {
   fn from_value(value: &Value) -> Result<Self> {
      match value {
         Value::Integer(v) => Ok(*v != 0),
         other => Err(other.mismatch("bool")),
      }
   }
}

impl FromValue for f64 {
   fn from_value(value: &Value) -> Result<Self> {
      match value {
         Value::Real(v) => Ok(*v),
         Value::Integer(v) => Ok(*v as f64),
         other => Err(other.mismatch("f64")),
      }
   }
}

impl FromValue for String {
   fn from_value(value: &Value) -> Result<Self> {
      match value {
         Value::Text(v) => Ok(v.clone()),
         other => Err(other.mismatch("String")),
      }
   }
}

impl FromValue for Vec<u8> {
   fn from_value(value: &Value) -> Result<Self> {
      match value {
         Value::Blob(v) => Ok(v.clone()),
         Value::Text(v) => Ok(v.clone().into_bytes()),
         other => Err(other.mismatch("Vec<u8>")),
      }
   }
}

impl<T: FromValue> FromValue for Option<T> {
   fn from_value(value: &Value) -> Result<Self> {
      match value {
         Value::Null => Ok(None),
         other => T::from_value(other).map(Some),
      }
   }
}

/// A result row: column names shared across the result set plus this row's values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
   columns: Arc<[String]>,
   values: Vec<Value>,
}

impl Row {
   pub(crate) fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
      Self { columns, values }
   }

   pub fn columns(&self) -> &[String] {
      &self.columns
   }

   pub fn len(&self) -> usize {
      self.values.len()
   }

   pub fn is_empty(&self) -> bool {
      self.values.is_empty()
   }

   pub fn value(&self, index: usize) -> Option<&Value> {
      self.values.get(index)
   }

   /// Converts the value at `index`
   pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
      let value = self.values.get(index).ok_or(Error::ColumnOutOfRange {
         index,
         len: self.values.len(),
      })?;
      T::from_value(value)
   }

   /// Converts the value of the first column named `name`
   pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
      let index = self
         .columns
         .iter()
         .position(|c| c == name)
         .ok_or_else(|| Error::NoSuchColumn(name.to_string()))?;
      self.get(index)
   }

   pub fn into_values(self) -> Vec<Value> {
      self.values
   }
}
