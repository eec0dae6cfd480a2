//! Message representations at the different pipeline stages.
//!
//! A transport hands over an [`IncomingMessage`] (headers + raw body), the
//! receive pipeline turns it into a [`LogicalMessage`] (type name + JSON
//! body), and the outgoing pipeline produces an [`OutgoingMessage`] for the
//! dispatcher.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Well-known header keys
pub mod headers {
    /// Logical message id, overrides the transport-native id when present
    pub const MESSAGE_ID: &str = "Sagabus.MessageId";

    /// Comma-separated list of message type names enclosed in the body
    pub const ENCLOSED_MESSAGE_TYPES: &str = "Sagabus.EnclosedMessageTypes";

    /// Correlation id used for replies
    pub const CORRELATION_ID: &str = "Sagabus.CorrelationId";

    /// Address replies should be sent to
    pub const REPLY_TO_ADDRESS: &str = "Sagabus.ReplyToAddress";

    /// Endpoint that sent the message
    pub const ORIGINATING_ENDPOINT: &str = "Sagabus.OriginatingEndpoint";

    /// Body content type
    pub const CONTENT_TYPE: &str = "Sagabus.ContentType";

    /// Saga instance that sent the message
    pub const ORIGINATING_SAGA_ID: &str = "Sagabus.OriginatingSagaId";
}

/// Content type written by the outgoing serializer
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// The raw message coming from the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Message id (the `Sagabus.MessageId` header wins over the native id)
    pub message_id: String,

    /// Message headers
    pub headers: HashMap<String, String>,

    /// Raw body bytes
    pub body: Vec<u8>,
}

impl IncomingMessage {
    /// Create a new incoming message
    pub fn new(native_id: impl Into<String>, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        let message_id = headers
            .get(headers::MESSAGE_ID)
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| native_id.into());

        Self {
            message_id,
            headers,
            body,
        }
    }

    /// Build an incoming message carrying a JSON payload of the given type
    pub fn json(message_type: &str, body: &Value) -> Result<Self> {
        let bytes = serde_json::to_vec(body).context("Failed to serialize message body")?;
        let mut headers = HashMap::new();
        headers.insert(headers::ENCLOSED_MESSAGE_TYPES.to_string(), message_type.to_string());
        headers.insert(headers::CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());

        Ok(Self::new(Uuid::new_v4().to_string(), headers, bytes))
    }

    /// Add or replace a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Look up a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The most specific enclosed message type, if any
    pub fn enclosed_message_type(&self) -> Option<&str> {
        self.header(headers::ENCLOSED_MESSAGE_TYPES)
            .and_then(|types| types.split(',').map(str::trim).find(|t| !t.is_empty()))
    }
}

/// A deserialized message identified by its type name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalMessage {
    /// Full name of the message type
    pub message_type: String,

    /// Message payload
    pub body: Value,
}

impl LogicalMessage {
    /// Create a logical message from a raw JSON payload
    pub fn new(message_type: impl Into<String>, body: Value) -> Self {
        Self {
            message_type: message_type.into(),
            body,
        }
    }

    /// Create a logical message from any serializable payload
    pub fn from_payload<T: Serialize>(message_type: impl Into<String>, payload: &T) -> Result<Self> {
        let body = serde_json::to_value(payload).context("Failed to serialize message payload")?;
        Ok(Self::new(message_type, body))
    }

    /// Value of a top-level property; missing properties read as null
    pub fn property(&self, name: &str) -> Value {
        self.body.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// A serialized message ready to be handed to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Message id
    pub message_id: String,

    /// Message headers
    pub headers: HashMap<String, String>,

    /// Serialized body
    pub body: Vec<u8>,
}
