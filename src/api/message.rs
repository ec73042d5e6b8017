//! Request/response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ApiError;

/// One request frame. `id` is monotonically increasing per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub target_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Message {
    pub fn new(id: u64, target_id: &str, method: &str, args: Vec<Value>) -> Self {
        Self {
            id,
            target_id: target_id.to_string(),
            method: method.to_string(),
            args,
        }
    }

    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("message serializes")
    }

    pub fn from_frame(frame: &str) -> Result<Self, ApiError> {
        serde_json::from_str(frame)
            .map_err(|e| ApiError::ConnectionNonsense(format!("unparseable request: {e}")))
    }
}

/// Wire form of an error: stable name plus human detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub detail: String,
}

/// One response frame, matched to its request by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self { id, ok: true, result: Some(result), error: None }
    }

    pub fn failure(id: u64, error: &ApiError) -> Self {
        Self { id, ok: false, result: None, error: Some(error.to_error_info()) }
    }

    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("response serializes")
    }

    pub fn from_frame(frame: &str) -> Result<Self, ApiError> {
        serde_json::from_str(frame)
            .map_err(|e| ApiError::ConnectionNonsense(format!("unparseable response: {e}")))
    }
}
