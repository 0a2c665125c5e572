//! Request body normalization.
//!
//! Turns a raw request payload into a flat key/value context that templates
//! can reference by name. The decoding is picked from the declared
//! `Content-Type`.

use axum::body::{Body, Bytes};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Form field whose upload is replaced by its raw bytes.
pub const FILE_FIELD: &str = "file";

/// The body does not match the encoding its content type declares.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("body is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid multipart body: {0}")]
    Multipart(String),
}

/// Content type family of a request, as far as body decoding cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    /// No `Content-Type` header
    Missing,
    /// `application/json`
    Json,
    /// `application/x-www-form-urlencoded`
    Form,
    /// `multipart/form-data`; holds the full header value for the boundary
    Multipart(String),
    /// Anything else. Accepted only when the body is JSON text.
    Other(String),
}

impl ContentKind {
    /// Classify a `Content-Type` header value.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(raw) = content_type else {
            return ContentKind::Missing;
        };

        let essence = raw
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "application/json" => ContentKind::Json,
            "application/x-www-form-urlencoded" => ContentKind::Form,
            "multipart/form-data" => ContentKind::Multipart(raw.to_string()),
            _ => ContentKind::Other(raw.to_string()),
        }
    }
}

/// A single body value: structured data, or raw bytes of a file upload.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyValue {
    Json(Value),
    Bytes(Bytes),
}

impl BodyValue {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            BodyValue::Json(v) => Some(v),
            BodyValue::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BodyValue::Bytes(b) => Some(b),
            BodyValue::Json(_) => None,
        }
    }
}

impl From<Value> for BodyValue {
    fn from(value: Value) -> Self {
        BodyValue::Json(value)
    }
}

// Templates see uploaded bytes as (lossy) text.
impl Serialize for BodyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BodyValue::Json(v) => v.serialize(serializer),
            BodyValue::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
        }
    }
}

/// Normalized request body: top-level template variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BodyContext(BTreeMap<String, BodyValue>);

impl BodyContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&BodyValue> {
        self.0.get(key)
    }

    /// Insert a value, replacing any earlier value for the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<BodyValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BodyValue)> {
        self.0.iter()
    }
}

impl From<serde_json::Map<String, Value>> for BodyContext {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map.into_iter().map(|(k, v)| (k, BodyValue::Json(v))).collect())
    }
}

/// Decode `body` according to `kind`.
///
/// A JSON body whose top level is not an object carries no named variables
/// and yields an empty context.
pub async fn normalize(kind: &ContentKind, body: Bytes) -> Result<BodyContext, BodyError> {
    match kind {
        ContentKind::Missing => Ok(BodyContext::new()),
        ContentKind::Json => parse_json_object(&body),
        ContentKind::Form => Ok(parse_form(&body)),
        ContentKind::Multipart(content_type) => parse_multipart(content_type, body).await,
        ContentKind::Other(_) => parse_text_as_json(&body),
    }
}

fn parse_json_object(body: &[u8]) -> Result<BodyContext, BodyError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => Ok(BodyContext::from(map)),
        other => {
            debug!(kind = json_type_name(&other), "JSON body has no top-level keys");
            Ok(BodyContext::new())
        }
    }
}

fn parse_text_as_json(body: &[u8]) -> Result<BodyContext, BodyError> {
    let text = std::str::from_utf8(body).map_err(|_| BodyError::InvalidUtf8)?;
    parse_json_object(text.as_bytes())
}

fn parse_form(body: &[u8]) -> BodyContext {
    let mut context = BodyContext::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        context.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    context
}

// The transport has already bounded the body, so the parser adds no size
// limit of its own.
async fn parse_multipart(content_type: &str, body: Bytes) -> Result<BodyContext, BodyError> {
    let boundary =
        multer::parse_boundary(content_type).map_err(|e| BodyError::Multipart(e.to_string()))?;
    let mut multipart = multer::Multipart::new(Body::from(body).into_data_stream(), boundary);

    let mut context = BodyContext::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BodyError::Multipart(e.to_string()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let is_upload = field.file_name().is_some();
        let data = field
            .bytes()
            .await
            .map_err(|e| BodyError::Multipart(e.to_string()))?;

        if is_upload && name == FILE_FIELD {
            context.insert(name, BodyValue::Bytes(data));
        } else {
            let text = String::from_utf8_lossy(&data).into_owned();
            context.insert(name, Value::String(text));
        }
    }

    Ok(context)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
