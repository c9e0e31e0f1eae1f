//! Request and response types flowing through the recovery pipeline

use std::collections::BTreeSet;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::retry::RetryCounter;

/// Typed per-request metadata consulted by policy filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Explicit opt-in/opt-out for session handling (REST-style callers)
    pub requires_session: Option<bool>,

    /// Tags attached by the caller or by an upstream tagging layer
    pub tags: BTreeSet<String>,

    /// Replays this logical request has been through
    pub retries: RetryCounter,
}

impl RequestMeta {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Identity of this dispatch attempt; a replay gets a fresh one
    pub id: Uuid,
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    pub meta: RequestMeta,
    /// Caller-side cancellation signal
    pub cancel: Option<CancellationToken>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            meta: RequestMeta::default(),
            cancel: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn meta(mut self, meta: RequestMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.meta.tags.insert(tag.into());
        self
    }

    pub fn requires_session(mut self, required: bool) -> Self {
        self.meta.requires_session = Some(required);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Same logical request under a new attempt identity.
    pub(crate) fn next_attempt(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }
}

/// A response produced by the inner service.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Value::Null,
        }
    }

    pub fn ok(body: Value) -> Self {
        Self {
            body,
            ..Self::new(StatusCode::OK)
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }
}
