//! # tower-recovery
//!
//! Tower middleware that turns a recoverable response (an expired session, a
//! stale CSRF token, ...) seen by many concurrent requests into a single
//! recovery operation, suspends every affected request while it runs, and
//! replays them afterwards in dispatch order.
//!
//! ## Core Concepts
//!
//! - **Policy**: a trigger predicate, a recovery handler, admission filters and a retry bound.
//!   Several policies run side by side over one request stream, each with its own queue.
//! - **Round**: one recovery handler invocation plus the replay of everything it suspended.
//!   Concurrent triggers for the same policy join the round already underway.
//! - **Replay**: re-sending a suspended request once recovery succeeds; a replay that triggers
//!   again is re-queued until the policy's `max_retries` is spent, after which the last response
//!   is returned as-is.
//!
//! ## Getting Started
//!
//! ```rust
//! use tower_recovery::{Policy, RecoveryLayer, Request, Response};
//! use tower::{service_fn, BoxError, Layer, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), BoxError> {
//! let policy = Policy::builder("session")
//!     .trigger(|res: &Response, _req: &Request| res.is_unauthorized())
//!     .recover(|| async {
//!         // refresh credentials here
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let transport = service_fn(|_req: Request| async move {
//!     Ok::<_, BoxError>(Response::ok(serde_json::json!({ "name": "ada" })))
//! });
//!
//! let svc = RecoveryLayer::new([policy]).layer(transport);
//! let res = svc.oneshot(Request::get("/me")).await?;
//! assert_eq!(res.body["name"], "ada");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod policy;
pub mod request;
pub mod retry;
pub mod session;

mod pending;

pub use config::{ConfigBuilder, EngineConfig};
pub use engine::{EngineStats, PolicyStats, Recovery, RecoveryLayer};
pub use error::{ConfigError, RecoveryError, Result};
pub use policy::{Policy, PolicyBuilder, PolicySet, Recover, Trigger};
pub use request::{Request, RequestMeta, Response};
pub use retry::RetryCounter;
pub use session::{admit, SessionManager, SessionPolicy, UrlTagLayer};

// Re-export Tower traits that users need
pub use tower::{BoxError, Layer, Service, ServiceExt};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn root_reexports_assemble_a_layer() {
        let policy = Policy::builder("session")
            .trigger(|res: &Response, _req: &Request| res.is_unauthorized())
            .recover(|| async { Ok(()) })
            .max_retries(2)
            .build()
            .unwrap();
        let policies = PolicySet::new(vec![policy.clone()]);
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].name(), "session");

        let config = ConfigBuilder::new()
            .coalesce_window(Duration::from_millis(5))
            .build();
        let _layer: RecoveryLayer = RecoveryLayer::new([policy]).with_config(config);

        assert!(RetryCounter::new(2).exhausted(policies[0].max_retries()));
        assert_eq!(RecoveryError::Cancelled.policy(), None);
    }
}
