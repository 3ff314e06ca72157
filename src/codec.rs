//! Message body decoders and reply encoders.

use serde_json::Value;

use crate::error::DispatchError;

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Structured JSON payload.
    Json(Value),
    /// UTF-8 text that is not JSON.
    Text(String),
    /// Bytes left untouched.
    Raw(Vec<u8>),
}

impl Body {
    /// The decoded JSON value, if the body was decoded as JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the body was passed on undecoded.
    pub fn is_raw(&self) -> bool {
        matches!(self, Body::Raw(_))
    }

    /// The body as a JSON value; text becomes a JSON string.
    pub fn to_value(&self) -> Value {
        match self {
            Body::Json(value) => value.clone(),
            Body::Text(text) => Value::String(text.clone()),
            Body::Raw(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// The body as text; JSON is re-serialised.
    pub fn to_text(&self) -> String {
        match self {
            Body::Json(Value::String(text)) => text.clone(),
            Body::Json(value) => value.to_string(),
            Body::Text(text) => text.clone(),
            Body::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// The body as bytes; JSON is serialised, text is UTF-8 encoded.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Body::Json(value) => value.to_string().into_bytes(),
            Body::Text(text) => text.into_bytes(),
            Body::Raw(bytes) => bytes,
        }
    }
}

/// Turns raw message bytes into a [`Body`].
pub trait Decoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<Body, DispatchError>;
}

/// Turns a handler's return value into reply bytes.
pub trait Encoder: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, DispatchError>;

    /// Content type set on published replies.
    fn content_type(&self) -> &str;
}

/// Decodes JSON, falling back to text and then to raw bytes. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDecoder;

impl Decoder for AutoDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Body, DispatchError> {
        if let Ok(value) = serde_json::from_slice(raw) {
            return Ok(Body::Json(value));
        }
        Ok(match std::str::from_utf8(raw) {
            Ok(text) => Body::Text(text.to_string()),
            Err(_) => Body::Raw(raw.to_vec()),
        })
    }
}

/// Strict JSON decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Body, DispatchError> {
        Ok(Body::Json(serde_json::from_slice(raw)?))
    }
}

/// Hands the bytes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDecoder;

impl Decoder for PassthroughDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Body, DispatchError> {
        Ok(Body::Raw(raw.to_vec()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, DispatchError> {
        serde_json::to_vec(value).map_err(|e| DispatchError::Encode(e.to_string()))
    }

    fn content_type(&self) -> &str {
        "application/json"
    }
}

/// Objects and arrays as JSON, strings verbatim, other scalars as their text form.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoEncoder;

impl Encoder for AutoEncoder {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, DispatchError> {
        match value {
            Value::Object(_) | Value::Array(_) => JsonEncoder.encode(value),
            Value::String(text) => Ok(text.clone().into_bytes()),
            other => Ok(other.to_string().into_bytes()),
        }
    }

    fn content_type(&self) -> &str {
        "application/json"
    }
}
