//! Mock resolution engine.
//!
//! Takes a raw request from the transport, normalizes its body, resolves the
//! path against the catalog and renders the matching template. Unmatched
//! paths get a fixed fallback payload.

use crate::body::{normalize, BodyContext, BodyError, ContentKind};
use crate::catalog::Catalog;
use crate::config::GlobalSettings;
use crate::matcher::Matcher;
use crate::template::{RenderError, TemplateEngine};
use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Message of the payload returned when no definition matches.
pub const NO_MOCK_MESSAGE: &str = "No mock data found";

/// Payload returned when no definition matches the request path.
pub fn fallback_payload() -> Value {
    json!({ "error": NO_MOCK_MESSAGE })
}

/// Per-request failure. Contained to the request that caused it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    MalformedBody(#[from] BodyError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl EngineError {
    /// HTTP status the transport should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            EngineError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A request as delivered by the transport.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    /// Decoded path with leading slash, no query string
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Declared `Content-Type`, if present and readable.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// A request after body normalization.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: BodyContext,
}

/// How a request was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A definition matched and rendered
    Rendered {
        template: String,
        response: Value,
    },
    /// No definition matched the path
    Unmatched,
}

impl Resolution {
    /// JSON payload to send back.
    pub fn into_payload(self) -> Value {
        match self {
            Resolution::Rendered { response, .. } => response,
            Resolution::Unmatched => fallback_payload(),
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Resolution::Rendered { .. })
    }
}

/// Mock resolution engine over an immutable catalog.
pub struct MockEngine {
    catalog: Arc<Catalog>,
    matcher: Matcher,
    template_engine: TemplateEngine,
    settings: GlobalSettings,
}

impl MockEngine {
    /// Create a new engine over `catalog`.
    pub fn new(catalog: Arc<Catalog>, template_extension: &str, settings: GlobalSettings) -> Self {
        let matcher = Matcher::new(catalog.definitions());
        let template_engine = TemplateEngine::new(template_extension);

        info!(
            definitions = catalog.len(),
            template_extension = %template_extension,
            "Mock engine initialized"
        );

        Self {
            catalog,
            matcher,
            template_engine,
            settings,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Answer one request.
    pub async fn handle(&self, request: RawRequest) -> Result<Resolution, EngineError> {
        let normalized = self.normalize(request).await?;
        self.resolve(&normalized)
    }

    /// Decode the request body according to its content type.
    pub async fn normalize(&self, request: RawRequest) -> Result<NormalizedRequest, EngineError> {
        let kind = ContentKind::from_content_type(request.content_type());
        let body = match normalize(&kind, request.body).await {
            Ok(body) => body,
            Err(e) => {
                if self.settings.log_requests {
                    info!(
                        path = %request.path,
                        headers = ?request.headers,
                        error = %e,
                        "Request received with malformed body"
                    );
                }
                return Err(e.into());
            }
        };
        Ok(NormalizedRequest {
            path: request.path,
            headers: request.headers,
            body,
        })
    }

    /// Resolve and render a normalized request.
    pub fn resolve(&self, request: &NormalizedRequest) -> Result<Resolution, EngineError> {
        if self.settings.log_requests {
            info!(
                path = %request.path,
                headers = ?request.headers,
                body = ?request.body,
                "Request received"
            );
        }

        let Some(definition) = self
            .matcher
            .find_match(self.catalog.definitions(), &request.path)
        else {
            debug!(path = %request.path, "No mock definition matches");
            return Ok(Resolution::Unmatched);
        };

        debug!(path = %request.path, source = %definition.source, "Request matched definition");

        let rendered = self
            .template_engine
            .render(&self.catalog, &definition.path, &request.body)?;

        if self.settings.log_rendered {
            debug!(template = %rendered.template, document = %rendered.document, "Template expanded");
            info!(template = %rendered.template, response = %rendered.response, "Mock response");
        }

        Ok(Resolution::Rendered {
            template: rendered.template,
            response: rendered.response,
        })
    }
}
