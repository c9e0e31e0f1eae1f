//! Session refresh: a ready-made policy for expired-session recovery
//!
//! What this module provides
//! - `SessionManager`: the caller-supplied seam (expiry lookup, refresh, invalid-session hook)
//! - `SessionPolicy`: builds a [`Policy`] that triggers on 401 or on a locally expired session
//!   and recovers by refreshing it
//! - `admit`: admission predicates over [`RequestMeta`] so REST-style callers (explicit flag) and
//!   RPC-style callers (tags) share one engine
//! - `UrlTagLayer`: upstream middleware tagging requests by URL pattern, for clients that cannot
//!   attach metadata themselves
//!
//! Composition
//! - `ServiceBuilder::new().layer(UrlTagLayer::new().rule(r"/rpc/", "session")?)
//!   .layer(RecoveryLayer::new([session_policy])).service(transport)`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tower::{BoxError, Layer, Service};
use tracing::warn;

use crate::error::{ConfigError, Result};
use crate::policy::{Policy, Recover, Trigger};
use crate::request::{Request, RequestMeta, Response};

/// Caller-supplied session operations.
#[async_trait]
pub trait SessionManager: Send + Sync + 'static {
    /// When the current session expires, if known locally.
    fn expires_at(&self) -> Option<DateTime<Utc>>;

    async fn refresh_session(&self) -> std::result::Result<(), BoxError>;

    /// Called once a refresh has failed, before the round is failed.
    async fn on_session_invalid(&self);
}

/// Predicate over request metadata deciding which requests the policy handles.
pub type MetaPredicate = Arc<dyn Fn(&RequestMeta) -> bool + Send + Sync>;

pub mod admit {
    use super::*;

    /// REST style: admit unless the caller explicitly opted out.
    pub fn requires_session() -> MetaPredicate {
        Arc::new(|meta: &RequestMeta| meta.requires_session.unwrap_or(true))
    }

    /// RPC style: admit requests carrying `tag`.
    pub fn tagged(tag: impl Into<String>) -> MetaPredicate {
        let tag = tag.into();
        Arc::new(move |meta: &RequestMeta| meta.has_tag(&tag))
    }

    pub fn any_of(predicates: Vec<MetaPredicate>) -> MetaPredicate {
        Arc::new(move |meta: &RequestMeta| predicates.iter().any(|p| p(meta)))
    }
}

struct SessionTrigger {
    manager: Arc<dyn SessionManager>,
    skew: chrono::Duration,
}

#[async_trait]
impl Trigger for SessionTrigger {
    async fn triggered(&self, response: &Response, _request: &Request) -> bool {
        response.is_unauthorized()
            || self
                .manager
                .expires_at()
                .is_some_and(|expiry| Utc::now() >= expiry - self.skew)
    }
}

struct SessionRecover {
    manager: Arc<dyn SessionManager>,
}

#[async_trait]
impl Recover for SessionRecover {
    async fn recover(&self) -> std::result::Result<(), BoxError> {
        match self.manager.refresh_session().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "session refresh failed");
                self.manager.on_session_invalid().await;
                Err(err)
            }
        }
    }
}

/// Builder for the session-refresh policy
pub struct SessionPolicy {
    manager: Arc<dyn SessionManager>,
    admit: MetaPredicate,
    skew: chrono::Duration,
    max_retries: u32,
    debug: bool,
}

impl SessionPolicy {
    pub fn builder(manager: Arc<dyn SessionManager>) -> Self {
        Self {
            manager,
            admit: admit::requires_session(),
            skew: chrono::Duration::seconds(1),
            max_retries: 1,
            debug: false,
        }
    }

    pub fn admit(mut self, predicate: MetaPredicate) -> Self {
        self.admit = predicate;
        self
    }

    /// Treat the session as expired this long before its actual expiry.
    pub fn skew(mut self, skew: chrono::Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn build(self) -> Result<Policy> {
        let admit = self.admit;
        Policy::builder("session")
            .trigger_with(SessionTrigger {
                manager: self.manager.clone(),
                skew: self.skew,
            })
            .recover_with(SessionRecover {
                manager: self.manager,
            })
            .match_rule(move |req: &Request| admit(&req.meta))
            .max_retries(self.max_retries)
            .debug(self.debug)
            .build()
    }
}

/// Layer tagging requests whose URL matches a pattern.
#[derive(Clone, Default)]
pub struct UrlTagLayer {
    rules: Arc<Vec<(Regex, String)>>,
}

impl UrlTagLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule; requests whose URL matches `pattern` get `tag`.
    pub fn rule(self, pattern: &str, tag: impl Into<String>) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let mut rules = Arc::unwrap_or_clone(self.rules);
        rules.push((regex, tag.into()));
        Ok(Self {
            rules: Arc::new(rules),
        })
    }
}

impl<S> Layer<S> for UrlTagLayer {
    type Service = UrlTag<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UrlTag {
            inner,
            rules: self.rules.clone(),
        }
    }
}

#[derive(Clone)]
pub struct UrlTag<S> {
    inner: S,
    rules: Arc<Vec<(Regex, String)>>,
}

impl<S> Service<Request> for UrlTag<S>
where
    S: Service<Request>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        for (pattern, tag) in self.rules.iter() {
            if pattern.is_match(&request.url) {
                request.meta.tags.insert(tag.clone());
            }
        }
        Box::pin(self.inner.call(request))
    }
}
