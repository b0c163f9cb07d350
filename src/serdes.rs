//! Serialization of durable values.
//!
//! Every result that crosses an invocation boundary goes through [`SerDes`].
//! The default is JSON via serde; the trait exists so callers can plug in a
//! different codec per type without touching the handlers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

use crate::error::WorkflowError;

/// Codec for one durable value type.
pub trait SerDes<T>: Send + Sync {
    /// Serializes a value to its durable string form.
    fn serialize(&self, value: &T) -> Result<String, WorkflowError>;

    /// Deserializes a value from its durable string form.
    fn deserialize(&self, data: &str) -> Result<T, WorkflowError>;
}

/// JSON codec backed by serde_json. The default for all handlers.
pub struct JsonSerDes<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerDes<T> {
    /// Creates a new JSON codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerDes<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SerDes<T> for JsonSerDes<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<String, WorkflowError> {
        serde_json::to_string(value)
            .map_err(|e| WorkflowError::serde(format!("failed to serialize value: {e}")))
    }

    fn deserialize(&self, data: &str) -> Result<T, WorkflowError> {
        serde_json::from_str(data)
            .map_err(|e| WorkflowError::serde(format!("failed to deserialize value: {e}")))
    }
}

/// Serializes a value with the default JSON codec.
pub fn to_durable<T: Serialize>(value: &T) -> Result<String, WorkflowError> {
    serde_json::to_string(value)
        .map_err(|e| WorkflowError::serde(format!("failed to serialize value: {e}")))
}

/// Deserializes a cached result with the default JSON codec.
///
/// A missing result deserializes as JSON `null`, so unit-returning operations
/// replay without a stored payload.
pub fn from_durable<T: DeserializeOwned>(data: Option<&str>) -> Result<T, WorkflowError> {
    let data = data.unwrap_or("null");
    serde_json::from_str(data)
        .map_err(|e| WorkflowError::serde(format!("failed to deserialize cached result: {e}")))
}
