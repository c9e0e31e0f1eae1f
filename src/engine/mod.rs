//! Recovery engine: coalesce recoverable responses into one recovery round
//!
//! What this module provides
//! - `RecoveryLayer`: a Tower layer that wraps any `Service<Request, Response = Response>`
//! - `Recovery<S>`: the resulting service; clones share one engine instance
//! - `EngineStats` / `PolicyStats`: a read-only view of the pending set and per-policy state
//!
//! How a call flows
//! - Requests no policy admits pass straight through, untracked
//! - If an admitting policy is recovering, the request is suspended in that policy's queue
//!   without being dispatched
//! - Otherwise it is dispatched and registered in the pending set with its own abort token
//! - When the response arrives the caller re-checks for promotion and for a round that started
//!   meanwhile, then takes its entry out of the pending set and evaluates triggers
//! - A response no policy triggers on goes straight back; the first triggering policy starts
//!   (or joins) a round
//! - A round runs on its own task (see `controller`): wait out the coalescing window, promote
//!   admissible pending entries, invoke the handler once, then replay or reject the queue
//!
//! Concurrency
//! - Each policy's phase and queue sit behind one `parking_lot::Mutex`; the pending set has its own
//! - Lock order is pending set before policy state; no lock is held across an `.await`
//! - Settling a caller happens through a oneshot channel owned by exactly one side at a time

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::debug;

/// Log a policy lifecycle event; policies built with `debug(true)` log at info.
macro_rules! lifecycle {
    ($policy:expr, $($rest:tt)+) => {{
        let policy: &$crate::policy::Policy = $policy;
        if policy.debug() {
            tracing::info!(policy = %policy.name(), $($rest)+);
        } else {
            tracing::debug!(policy = %policy.name(), $($rest)+);
        }
    }};
}

mod controller;
mod queue;

use self::queue::{PolicyState, QueueItem};
use crate::config::EngineConfig;
use crate::error::RecoveryError;
use crate::pending::{PendingEntry, PendingSet};
use crate::policy::{Policy, PolicySet};
use crate::request::{Request, Response};

/// Layer installing a recovery engine with the given policies.
///
/// Every call to [`Layer::layer`] builds an independent engine.
#[derive(Debug, Clone)]
pub struct RecoveryLayer {
    policies: PolicySet,
    config: EngineConfig,
}

impl RecoveryLayer {
    pub fn new(policies: impl IntoIterator<Item = Policy>) -> Self {
        Self {
            policies: PolicySet::new(policies.into_iter().collect()),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = Recovery<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Recovery {
            engine: Arc::new(Engine::new(inner, self.policies.clone(), self.config.clone())),
        }
    }
}

/// Service wrapper running the recovery engine around `S`.
pub struct Recovery<S> {
    engine: Arc<Engine<S>>,
}

impl<S> Clone for Recovery<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<S> Recovery<S> {
    pub fn new(
        inner: S,
        policies: impl IntoIterator<Item = Policy>,
        config: EngineConfig,
    ) -> Self {
        RecoveryLayer::new(policies).with_config(config).layer(inner)
    }

    /// Snapshot of the pending set size and each policy's state.
    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }
}

/// Point-in-time view of one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Dispatched requests not yet settled or promoted
    pub pending: usize,
    pub policies: Vec<PolicyStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStats {
    pub name: String,
    pub recovering: bool,
    pub queued: usize,
    /// Recovery handler invocations so far
    pub rounds: u64,
}

impl<S> Service<Request> for Recovery<S>
where
    S: Service<Request, Response = Response, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        Box::pin(self.engine.clone().handle(request))
    }
}

pub(crate) struct Engine<S> {
    inner: Mutex<S>,
    policies: PolicySet,
    states: Vec<Mutex<PolicyState>>,
    pending: Mutex<PendingSet>,
    next_seq: AtomicU64,
    config: EngineConfig,
}

/// How the dispatch race ended for the caller.
enum Attempt {
    Promoted,
    CallerCancelled,
    Finished(Result<Response, BoxError>),
}

/// Where a pending entry stands once its caller looks at it again.
enum Standing {
    /// Already promoted by a round
    Gone,
    /// Just moved into a recovering policy's queue
    Suspended,
    Live,
}

/// Who settles the caller.
enum Claim {
    Engine,
    Caller(PendingEntry),
}

/// Removes the caller's pending entry if the caller goes away mid-flight.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingSet>,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(self.seq);
    }
}

impl<S> Engine<S> {
    fn new(inner: S, policies: PolicySet, config: EngineConfig) -> Self {
        let states = (0..policies.len())
            .map(|_| Mutex::new(PolicyState::new()))
            .collect();
        Self {
            inner: Mutex::new(inner),
            policies,
            states,
            pending: Mutex::new(PendingSet::default()),
            next_seq: AtomicU64::new(0),
            config,
        }
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            pending: self.pending.lock().len(),
            policies: self
                .policies
                .iter()
                .zip(&self.states)
                .map(|(policy, state)| {
                    let state = state.lock();
                    PolicyStats {
                        name: policy.name().to_string(),
                        recovering: state.is_recovering(),
                        queued: state.queued(),
                        rounds: state.rounds(),
                    }
                })
                .collect(),
        }
    }

    /// Suspend a fresh request if one of its policies is mid-round; hands it back otherwise.
    fn suspend_on_arrival(&self, admitted: &[usize], item: QueueItem) -> Option<QueueItem> {
        for &idx in admitted {
            let mut state = self.states[idx].lock();
            if state.is_recovering() {
                lifecycle!(&self.policies[idx], url = %item.request.url, "suspending request until recovery completes");
                state.push(item);
                return None;
            }
        }
        Some(item)
    }

    fn standing(&self, pending: &mut PendingSet, seq: u64) -> Standing {
        let Some(entry) = pending.get(seq) else {
            return Standing::Gone;
        };
        for idx in entry.policies.clone() {
            let mut state = self.states[idx].lock();
            if state.is_recovering() {
                if let Some(entry) = pending.remove(seq) {
                    lifecycle!(&self.policies[idx], url = %entry.request.url, "response raced a recovery round; suspending");
                    state.push(QueueItem::promoted(seq, entry));
                }
                return Standing::Suspended;
            }
        }
        Standing::Live
    }

    /// Take the entry out of the pending set if nobody else has.
    fn claim(&self, seq: u64) -> Claim {
        let mut pending = self.pending.lock();
        match self.standing(&mut pending, seq) {
            Standing::Live => pending.remove(seq).map_or(Claim::Engine, Claim::Caller),
            Standing::Gone | Standing::Suspended => Claim::Engine,
        }
    }
}

impl<S> Engine<S>
where
    S: Service<Request, Response = Response, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    fn dispatcher(&self) -> S {
        self.inner.lock().clone()
    }

    async fn handle(self: Arc<Self>, request: Request) -> Result<Response, BoxError> {
        let admitted = self.policies.admitting(&request);
        if admitted.is_empty() {
            return self.dispatcher().oneshot(request).await;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply, settled) = oneshot::channel();
        let Some(QueueItem { request, reply, .. }) =
            self.suspend_on_arrival(&admitted, QueueItem::arrived(seq, request, reply))
        else {
            return settle(settled).await;
        };

        let abort = CancellationToken::new();
        let external = request.cancel.clone();
        self.pending.lock().insert(
            seq,
            PendingEntry {
                request: request.clone(),
                policies: admitted.clone(),
                abort: abort.clone(),
                reply,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            seq,
        };

        let attempt = tokio::select! {
            biased;
            _ = abort.cancelled() => Attempt::Promoted,
            _ = cancelled(external) => Attempt::CallerCancelled,
            result = self.dispatcher().oneshot(request.clone()) => Attempt::Finished(result),
        };

        let response = match attempt {
            Attempt::Promoted => return settle(settled).await,
            Attempt::CallerCancelled => {
                return match self.claim(seq) {
                    // queue membership outranks the caller's own signal
                    Claim::Engine => settle(settled).await,
                    Claim::Caller(_) => {
                        debug!(url = %request.url, "request cancelled by caller");
                        Err(RecoveryError::Cancelled.into())
                    }
                };
            }
            Attempt::Finished(Err(err)) => {
                return match self.claim(seq) {
                    Claim::Engine => settle(settled).await,
                    Claim::Caller(_) => Err(err),
                };
            }
            Attempt::Finished(Ok(response)) => response,
        };

        // The response is in hand, so the request is no longer in flight and no
        // round may collect it while its triggers are evaluated.
        let entry = match self.claim(seq) {
            Claim::Engine => return settle(settled).await,
            Claim::Caller(entry) => entry,
        };

        let Some(winner) = self
            .policies
            .first_triggered(&admitted, &response, &request)
            .await
        else {
            return Ok(response);
        };

        let policy = &self.policies[winner];
        let retries = entry.request.meta.retries;
        if retries.exhausted(policy.max_retries()) {
            lifecycle!(policy, url = %entry.request.url, retries = retries.count(), "retries exhausted; returning last response");
            return Ok(response);
        }

        lifecycle!(policy, url = %entry.request.url, status = %response.status, "trigger detected");
        self.enqueue_triggered(winner, QueueItem::promoted(seq, entry));
        settle(settled).await
    }
}

async fn settle(
    settled: oneshot::Receiver<Result<Response, BoxError>>,
) -> Result<Response, BoxError> {
    settled
        .await
        .unwrap_or_else(|_| Err(RecoveryError::EngineShutdown.into()))
}

async fn cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tower::service_fn;

    fn unauthorized_policy(recoveries: Arc<AtomicUsize>) -> Policy {
        Policy::builder("session")
            .trigger(|res: &Response, _req: &Request| res.is_unauthorized())
            .recover(move || {
                let recoveries = recoveries.clone();
                async move {
                    recoveries.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn non_triggering_response_passes_through() {
        let recoveries = Arc::new(AtomicUsize::new(0));
        let inner = service_fn(|req: Request| async move {
            Ok::<_, BoxError>(Response::ok(serde_json::json!({ "url": req.url })))
        });
        let mut svc = RecoveryLayer::new([unauthorized_policy(recoveries.clone())]).layer(inner);

        let res = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(Request::get("/me"))
            .await
            .unwrap();

        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["url"], "/me");
        assert_eq!(recoveries.load(Ordering::SeqCst), 0);
        assert_eq!(svc.stats().pending, 0);
    }

    #[tokio::test]
    async fn inner_errors_pass_through_unchanged() {
        let recoveries = Arc::new(AtomicUsize::new(0));
        let inner = service_fn(|_req: Request| async move {
            Err::<Response, BoxError>("connection reset".into())
        });
        let mut svc = RecoveryLayer::new([unauthorized_policy(recoveries)]).layer(inner);

        let err = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(Request::get("/me"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
        assert_eq!(svc.stats().pending, 0);
    }

    #[tokio::test]
    async fn dropped_caller_leaves_no_pending_entry() {
        let recoveries = Arc::new(AtomicUsize::new(0));
        let inner = service_fn(|_req: Request| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, BoxError>(Response::new(StatusCode::OK))
        });
        let mut svc = RecoveryLayer::new([unauthorized_policy(recoveries)]).layer(inner);

        let call = svc.call(Request::get("/slow"));
        let outcome = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert!(outcome.is_err());
        assert_eq!(svc.stats().pending, 0);
    }

    #[tokio::test]
    async fn layers_build_independent_engines() {
        let recoveries = Arc::new(AtomicUsize::new(0));
        let layer = RecoveryLayer::new([unauthorized_policy(recoveries)]);
        let inner = service_fn(|_req: Request| async move {
            Ok::<_, BoxError>(Response::new(StatusCode::UNAUTHORIZED))
        });
        let a = layer.layer(inner.clone());
        let b = layer.layer(inner);

        let _ = a.clone().oneshot(Request::get("/a")).await.unwrap();
        assert_eq!(a.stats().policies[0].rounds, 1);
        assert_eq!(b.stats().policies[0].rounds, 0);
    }
}
