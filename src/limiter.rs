use crate::key;
use crate::policy::Policy;
use crate::store::{CheckInput, CounterStore, RollbackToken};
use actix_web::dev::ServiceRequest;
use actix_web::rt::time::{timeout, Instant};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Upper bound on a single store round-trip. A store that has not answered by
/// then is treated the same as an unreachable one.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// The outcome of one admission check. Infallible: a failing store surfaces
/// here as an allowed decision, never as an error.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Number of requests that will be permitted until the limit resets.
    pub remaining: u64,
    /// Time at which the window resets.
    pub reset: Instant,
    /// Rejection message, present only on a denied decision.
    pub message: Option<String>,
    /// Handle to deduct the recorded event, absent when the store failed.
    pub(crate) rollback: Option<RollbackToken>,
}

impl AdmissionDecision {
    /// Seconds until the window resets (rounded upwards, so that it is
    /// guaranteed to be reset after waiting for the duration).
    pub fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }

    /// The reset time as epoch milliseconds, for the outbound response
    /// contract.
    pub fn reset_epoch_ms(&self) -> u64 {
        let until_reset = self.reset.saturating_duration_since(Instant::now());
        (SystemTime::now() + until_reset)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Binds an admission [Policy] to a [CounterStore] and answers, per key,
/// whether the current event is admitted.
///
/// Availability is prioritized over strict enforcement: when the store is
/// unreachable, times out, or fails, the check **fails open** — the event is
/// admitted and the failure logged, so a counting outage never becomes a
/// service outage.
pub struct RateLimiter<B: CounterStore> {
    store: B,
    policy: Policy,
    store_timeout: Duration,
}

impl<B: CounterStore> RateLimiter<B> {
    pub fn new(store: B, policy: Policy) -> Self {
        Self {
            store,
            policy,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Override the bound on a single store round-trip.
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Check a pre-derived counting key.
    pub async fn check_key(&self, key: &str) -> AdmissionDecision {
        run_check(&self.store, &self.policy, key, self.store_timeout).await
    }

    /// Derive the counting key for `req` (see [crate::key::derive_key]) and
    /// check it.
    pub async fn check_request(
        &self,
        req: &ServiceRequest,
        identifier: Option<&str>,
    ) -> AdmissionDecision {
        let key = key::derive_key(req, identifier);
        self.check_key(&key).await
    }
}

pub(crate) async fn run_check<B: CounterStore>(
    store: &B,
    policy: &Policy,
    key: &str,
    store_timeout: Duration,
) -> AdmissionDecision {
    let input = CheckInput {
        window: policy.window,
        max_requests: policy.max_requests,
        key: key.to_owned(),
    };
    match timeout(store_timeout, store.record(input)).await {
        Ok(Ok((decision, output, token))) => AdmissionDecision {
            allowed: decision.is_allowed(),
            limit: output.limit,
            remaining: output.remaining,
            reset: output.reset,
            message: decision.is_denied().then(|| policy.message.clone()),
            rollback: Some(token),
        },
        Ok(Err(e)) => {
            log::error!("counter store failed for {key}: {e}, admitting the request");
            fail_open(policy)
        }
        Err(_) => {
            log::error!(
                "counter store timed out after {store_timeout:?} for {key}, admitting the request"
            );
            fail_open(policy)
        }
    }
}

fn fail_open(policy: &Policy) -> AdmissionDecision {
    AdmissionDecision {
        allowed: true,
        limit: policy.max_requests,
        remaining: policy.max_requests.saturating_sub(1),
        reset: Instant::now() + policy.window,
        message: None,
        rollback: None,
    }
}
