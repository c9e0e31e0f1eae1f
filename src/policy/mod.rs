//! Coordination policies
//!
//! What this module provides
//! - `Policy`: one coordination unit (applicability filter, trigger, recovery handler,
//!   opt-out filter, retry bound, debug flag)
//! - `Trigger` / `Recover`: the two async seams a policy is built from
//! - `PolicySet`: ordered evaluation of several independent policies over one request stream
//!
//! Evaluation contract
//! - A policy admits a request when its match rule accepts it and its ignore filter does not
//! - Triggers are evaluated in registration order; the first one returning `true` wins
//! - Recovery handlers report an outcome through their returned future instead of a callback

use std::fmt;
use std::future::Future;
use std::ops::Index;
use std::sync::Arc;

use async_trait::async_trait;
use tower::BoxError;

use crate::error::{ConfigError, Result};
use crate::request::{Request, Response};

/// Predicate over a request, used for match rules and ignore filters.
pub type RequestFilter = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Decides whether a response calls for recovery.
#[async_trait]
pub trait Trigger: Send + Sync + 'static {
    async fn triggered(&self, response: &Response, request: &Request) -> bool;
}

/// The side-effecting operation that clears a triggering condition.
#[async_trait]
pub trait Recover: Send + Sync + 'static {
    async fn recover(&self) -> std::result::Result<(), BoxError>;
}

/// Adapter for synchronous trigger closures.
pub struct FnTrigger<F>(pub F);

#[async_trait]
impl<F> Trigger for FnTrigger<F>
where
    F: Fn(&Response, &Request) -> bool + Send + Sync + 'static,
{
    async fn triggered(&self, response: &Response, request: &Request) -> bool {
        (self.0)(response, request)
    }
}

/// Adapter for recovery closures returning a future.
pub struct FnRecover<F>(pub F);

#[async_trait]
impl<F, Fut> Recover for FnRecover<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    async fn recover(&self) -> std::result::Result<(), BoxError> {
        (self.0)().await
    }
}

/// One coordination policy. Cheap to clone; clones share their handlers.
#[derive(Clone)]
pub struct Policy {
    name: Arc<str>,
    trigger: Arc<dyn Trigger>,
    recover: Arc<dyn Recover>,
    match_rule: Option<RequestFilter>,
    ignore: Option<RequestFilter>,
    max_retries: u32,
    debug: bool,
}

impl Policy {
    pub fn builder(name: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Match rule alone; defaults to accepting everything.
    pub fn matches(&self, request: &Request) -> bool {
        self.match_rule.as_ref().map_or(true, |rule| rule(request))
    }

    /// Ignore filter alone; defaults to ignoring nothing.
    pub fn ignores(&self, request: &Request) -> bool {
        self.ignore.as_ref().is_some_and(|ignore| ignore(request))
    }

    /// Whether this policy tracks `request` at all.
    pub fn admits(&self, request: &Request) -> bool {
        !self.ignores(request) && self.matches(request)
    }

    pub async fn is_triggered(&self, response: &Response, request: &Request) -> bool {
        self.trigger.triggered(response, request).await
    }

    pub(crate) fn recover_handle(&self) -> Arc<dyn Recover> {
        self.recover.clone()
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("has_match_rule", &self.match_rule.is_some())
            .field("has_ignore", &self.ignore.is_some())
            .field("max_retries", &self.max_retries)
            .field("debug", &self.debug)
            .finish()
    }
}

/// Builder for [`Policy`]
pub struct PolicyBuilder {
    name: String,
    trigger: Option<Arc<dyn Trigger>>,
    recover: Option<Arc<dyn Recover>>,
    match_rule: Option<RequestFilter>,
    ignore: Option<RequestFilter>,
    max_retries: u32,
    debug: bool,
}

impl PolicyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger: None,
            recover: None,
            match_rule: None,
            ignore: None,
            max_retries: 1,
            debug: false,
        }
    }

    pub fn trigger<F>(self, f: F) -> Self
    where
        F: Fn(&Response, &Request) -> bool + Send + Sync + 'static,
    {
        self.trigger_with(FnTrigger(f))
    }

    pub fn trigger_with(mut self, trigger: impl Trigger) -> Self {
        self.trigger = Some(Arc::new(trigger));
        self
    }

    pub fn recover<F, Fut>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.recover_with(FnRecover(f))
    }

    pub fn recover_with(mut self, recover: impl Recover) -> Self {
        self.recover = Some(Arc::new(recover));
        self
    }

    pub fn match_rule<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.match_rule = Some(Arc::new(f));
        self
    }

    pub fn ignore<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.ignore = Some(Arc::new(f));
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
        let trigger = self.trigger.ok_or_else(|| ConfigError::MissingTrigger {
            policy: self.name.clone(),
        })?;
        let recover = self.recover.ok_or_else(|| ConfigError::MissingRecover {
            policy: self.name.clone(),
        })?;
        Ok(Policy {
            name: self.name.into(),
            trigger,
            recover,
            match_rule: self.match_rule,
            ignore: self.ignore,
            max_retries: self.max_retries,
            debug: self.debug,
        })
    }
}

/// Policies of one engine, in registration order.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: Vec<Policy>,
}

impl PolicySet {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter()
    }

    /// Indices of the policies that admit `request`.
    pub fn admitting(&self, request: &Request) -> Vec<usize> {
        self.policies
            .iter()
            .enumerate()
            .filter(|(_, policy)| policy.admits(request))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// First policy among `admitted` whose trigger fires.
    pub async fn first_triggered(
        &self,
        admitted: &[usize],
        response: &Response,
        request: &Request,
    ) -> Option<usize> {
        for &idx in admitted {
            if self.policies[idx].is_triggered(response, request).await {
                return Some(idx);
            }
        }
        None
    }
}

impl Index<usize> for PolicySet {
    type Output = Policy;

    fn index(&self, idx: usize) -> &Policy {
        &self.policies[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn on_status(name: &str, status: StatusCode) -> PolicyBuilder {
        Policy::builder(name)
            .trigger(move |res: &Response, _req: &Request| res.status == status)
            .recover(|| async { Ok(()) })
    }

    #[test]
    fn build_requires_trigger_and_recover() {
        let err = Policy::builder("p")
            .recover(|| async { Ok(()) })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingTrigger { .. }));

        let err = Policy::builder("p")
            .trigger(|_res: &Response, _req: &Request| true)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRecover { .. }));
    }

    #[test]
    fn defaults_admit_everything_with_one_retry() {
        let policy = on_status("p", StatusCode::UNAUTHORIZED).build().unwrap();
        assert_eq!(policy.max_retries(), 1);
        assert!(!policy.debug());
        assert!(policy.admits(&Request::get("/anything")));
    }

    #[test]
    fn ignore_overrides_match_rule() {
        let policy = on_status("p", StatusCode::UNAUTHORIZED)
            .match_rule(|req| req.url.starts_with("/api"))
            .ignore(|req| req.url.ends_with("/login"))
            .build()
            .unwrap();

        assert!(policy.admits(&Request::get("/api/me")));
        assert!(!policy.admits(&Request::get("/api/login")));
        assert!(!policy.admits(&Request::get("/static/app.js")));
    }

    #[tokio::test]
    async fn first_trigger_wins_in_registration_order() {
        let set = PolicySet::new(vec![
            on_status("unauthorized", StatusCode::UNAUTHORIZED).build().unwrap(),
            on_status("forbidden", StatusCode::FORBIDDEN).build().unwrap(),
            on_status("also-forbidden", StatusCode::FORBIDDEN).build().unwrap(),
        ]);
        let req = Request::get("/x");
        let admitted = set.admitting(&req);
        assert_eq!(admitted, vec![0, 1, 2]);

        let res = Response::new(StatusCode::FORBIDDEN);
        assert_eq!(set.first_triggered(&admitted, &res, &req).await, Some(1));

        let res = Response::new(StatusCode::OK);
        assert_eq!(set.first_triggered(&admitted, &res, &req).await, None);
    }

    #[tokio::test]
    async fn async_trigger_is_awaited() {
        struct SlowTrigger;

        #[async_trait]
        impl Trigger for SlowTrigger {
            async fn triggered(&self, response: &Response, _request: &Request) -> bool {
                tokio::task::yield_now().await;
                response.status.is_client_error()
            }
        }

        let policy = Policy::builder("slow")
            .trigger_with(SlowTrigger)
            .recover(|| async { Ok(()) })
            .build()
            .unwrap();
        let req = Request::get("/x");
        assert!(
            policy
                .is_triggered(&Response::new(StatusCode::CONFLICT), &req)
                .await
        );
        assert!(!policy.is_triggered(&Response::new(StatusCode::OK), &req).await);
    }
}
