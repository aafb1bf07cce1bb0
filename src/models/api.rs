//! Marketplace API request and response shapes
//!
//! Responses are typed where the engine depends on a field and keep every
//! other field in a flattened `extra` map.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::account::{AccountCredentials, OperationType};
use super::batch::WriteOperation;

/// Message attached to an API response
///
/// The remote side sends either plain strings or `{code, message}` objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawApiMessage")]
pub struct ApiMessage {
    /// Machine-readable code, when the remote provides one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable text
    pub message: String,
}

impl ApiMessage {
    /// Plain text message
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Message with a code
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ApiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawApiMessage {
    Text(String),
    Detailed {
        #[serde(default)]
        code: Option<String>,
        #[serde(default, alias = "text", alias = "detail")]
        message: Option<String>,
    },
    Other(Value),
}

impl From<RawApiMessage> for ApiMessage {
    fn from(raw: RawApiMessage) -> Self {
        match raw {
            RawApiMessage::Text(message) => ApiMessage::text(message),
            RawApiMessage::Detailed { code, message } => ApiMessage {
                code,
                message: message.unwrap_or_default(),
            },
            RawApiMessage::Other(value) => ApiMessage::text(value.to_string()),
        }
    }
}

/// One page of a paginated listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
    /// Raw remote records
    #[serde(default, deserialize_with = "null_as_default")]
    pub results: Vec<Value>,

    /// Error indicator; `None` when the field is absent
    #[serde(default, alias = "is_error", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,

    /// Messages attached by the remote side
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<ApiMessage>,

    /// Explicit end-of-data signal, when the remote sends one
    #[serde(default, alias = "has_more", skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,

    /// Unmodelled fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Response to a batch write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    /// Error indicator; authoritative over the HTTP status when present
    #[serde(default, alias = "is_error", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,

    /// Messages attached by the remote side
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<ApiMessage>,

    /// Per-item results
    #[serde(default, deserialize_with = "null_as_default")]
    pub results: Vec<Value>,
}

impl BatchResponse {
    /// Successful response without messages
    pub fn ok() -> Self {
        Self {
            is_error: Some(false),
            ..Default::default()
        }
    }

    /// Failed response carrying one message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: Some(true),
            messages: vec![ApiMessage::text(message)],
            results: vec![],
        }
    }

    /// Messages joined for logging
    pub fn joined_messages(&self) -> String {
        self.messages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Request for one page of a listing
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub credentials: AccountCredentials,
    pub operation: OperationType,
    /// 1-based page number
    pub page: u32,
    pub items_per_page: u32,
    pub filters: BTreeMap<String, String>,
}

/// Request for one batch write
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub credentials: AccountCredentials,
    pub operation: WriteOperation,
    pub items: Vec<Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
