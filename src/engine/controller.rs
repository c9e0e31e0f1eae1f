//! Recovery rounds for one policy.
//!
//! A round is driven by a spawned task so that no caller dropping its future
//! can strand the rest of the queue. The policy stays `Recovering` until its
//! queue is empty, which is what keeps a second handler invocation out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tokio::time::{sleep, timeout};
use tower::{BoxError, Service, ServiceExt};
use tracing::{info_span, warn, Instrument};

use super::queue::{Phase, QueueItem};
use super::Engine;
use crate::error::RecoveryError;
use crate::request::{Request, Response};

impl<S> Engine<S>
where
    S: Service<Request, Response = Response, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    /// Queue a triggering request; the first one for an idle policy starts its round.
    pub(super) fn enqueue_triggered(self: &Arc<Self>, idx: usize, item: QueueItem) {
        let start = {
            let mut state = self.states[idx].lock();
            state.push(item);
            if state.is_recovering() {
                false
            } else {
                state.phase = Phase::Recovering;
                true
            }
        };
        if start {
            let span = info_span!("recovery", policy = %self.policies[idx].name());
            tokio::spawn(self.clone().drive(idx).instrument(span));
        }
    }

    async fn drive(self: Arc<Self>, idx: usize) {
        let policy = &self.policies[idx];
        let mut needs_recovery = true;
        loop {
            if needs_recovery {
                sleep(self.config.coalesce_window()).await;
                self.collect_pending(idx);

                let round = self.states[idx].lock().begin_round();
                lifecycle!(policy, round, "recovery round started");
                if let Err(err) = self.recover(idx).await {
                    warn!(policy = %policy.name(), round, error = %err, "recovery failed; rejecting queued requests");
                    self.reject_queue(idx, err);
                    return;
                }
                lifecycle!(policy, round, "recovery succeeded");
            }

            let batch = {
                let mut state = self.states[idx].lock();
                let batch = state.take_batch();
                if batch.is_empty() {
                    state.phase = Phase::Idle;
                    lifecycle!(policy, "queue drained");
                    return;
                }
                batch
            };

            lifecycle!(policy, replays = batch.len(), "replaying suspended requests");
            join_all(batch.into_iter().map(|item| self.clone().replay(idx, item))).await;

            // Retries that triggered again need a fresh round; requests that merely
            // arrived during replay are sent on without calling the handler again.
            needs_recovery = self.states[idx].lock().has_retriggered();
        }
    }

    /// Promote every in-flight request admissible to this policy.
    fn collect_pending(&self, idx: usize) {
        let drained = self.pending.lock().drain_admissible(idx);
        if drained.is_empty() {
            return;
        }
        lifecycle!(&self.policies[idx], collected = drained.len(), "suspending in-flight requests");
        let mut state = self.states[idx].lock();
        for (seq, entry) in drained {
            entry.abort.cancel();
            state.push(QueueItem::promoted(seq, entry));
        }
    }

    async fn recover(&self, idx: usize) -> Result<(), RecoveryError> {
        let policy = &self.policies[idx];
        let handler = policy.recover_handle();
        let attempt = AssertUnwindSafe(async move { handler.recover().await }).catch_unwind();

        let outcome = match self.config.recovery_timeout() {
            Some(limit) => timeout(limit, attempt).await.map_err(|_| {
                RecoveryError::RecoveryTimedOut {
                    policy: policy.name().to_string(),
                    timeout: limit,
                }
            })?,
            None => attempt.await,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(RecoveryError::RecoveryFailed {
                policy: policy.name().to_string(),
                message: err.to_string(),
            }),
            Err(panic) => Err(RecoveryError::RecoveryFailed {
                policy: policy.name().to_string(),
                message: panic_message("recovery handler", &*panic),
            }),
        }
    }

    /// Fail the whole queue with the round's error and go idle.
    fn reject_queue(&self, idx: usize, err: RecoveryError) {
        let items = {
            let mut state = self.states[idx].lock();
            let items = state.take_batch();
            state.phase = Phase::Idle;
            items
        };
        for item in items {
            item.settle(Err(err.clone().into()));
        }
    }

    /// Replay one item on behalf of policy `idx`. A panic in user code settles
    /// only this item; the rest of the batch and the driver carry on.
    async fn replay(self: Arc<Self>, idx: usize, mut item: QueueItem) {
        if item.dispatched {
            item.request.meta.retries.bump();
        }
        item.request = item.request.next_attempt();
        item.dispatched = true;
        item.retriggered = false;

        let attempt = AssertUnwindSafe(self.redispatch(&item.request))
            .catch_unwind()
            .await;
        let (response, winner) = match attempt {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return item.settle(Err(err)),
            Err(panic) => {
                let policy = &self.policies[idx];
                let message = panic_message("replay", &*panic);
                warn!(policy = %policy.name(), url = %item.request.url, error = %message, "replay failed");
                return item.settle(Err(RecoveryError::RecoveryFailed {
                    policy: policy.name().to_string(),
                    message,
                }
                .into()));
            }
        };
        let Some(winner) = winner else {
            return item.settle(Ok(response));
        };

        let policy = &self.policies[winner];
        let retries = item.request.meta.retries;
        if retries.exhausted(policy.max_retries()) {
            lifecycle!(policy, url = %item.request.url, retries = retries.count(), "retries exhausted; returning last response");
            return item.settle(Ok(response));
        }

        lifecycle!(policy, url = %item.request.url, status = %response.status, "replay triggered again");
        item.retriggered = true;
        self.enqueue_triggered(winner, item);
    }

    /// Send one attempt and find the policy its response triggers, if any.
    async fn redispatch(&self, request: &Request) -> Result<(Response, Option<usize>), BoxError> {
        let response = self.dispatcher().oneshot(request.clone()).await?;
        let admitted = self.policies.admitting(request);
        let winner = self
            .policies
            .first_triggered(&admitted, &response, request)
            .await;
        Ok((response, winner))
    }
}

fn panic_message(context: &str, payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("{context} panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("{context} panicked: {msg}")
    } else {
        format!("{context} panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            panic_message("recovery handler", &*payload),
            "recovery handler panicked: boom"
        );

        let payload: Box<dyn Any + Send> = Box::new(String::from("bad state"));
        assert_eq!(
            panic_message("replay", &*payload),
            "replay panicked: bad state"
        );

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message("replay", &*payload), "replay panicked");
    }
}
