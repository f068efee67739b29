use crate::limiter::{AdmissionDecision, DEFAULT_STORE_TIMEOUT};
use crate::middleware::{AdmissionGate, GateConfig, IdentifierFn, PolicySource};
use crate::policy::Policy;
use crate::store::CounterStore;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::rc::Rc;
use std::time::Duration;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub struct AdmissionGateBuilder<B> {
    store: B,
    source: PolicySource,
    identifier_fn: Option<IdentifierFn>,
    store_timeout: Duration,
}

impl<B: CounterStore + 'static> AdmissionGateBuilder<B> {
    pub(super) fn new(store: B, source: PolicySource) -> Self {
        Self {
            store,
            source,
            identifier_fn: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Supply the identity layer's hook: given a request, extract the caller
    /// identifier (e.g. an authenticated user id) to throttle on. Requests
    /// for which the hook returns [None] are keyed by client IP and path
    /// instead.
    pub fn identifier_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<String> + 'static,
    {
        self.identifier_fn = Some(Box::new(f));
        self
    }

    /// Override the bound on a single store round-trip. A check that exceeds
    /// it is treated as a store failure and fails open.
    pub fn store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn build(self) -> AdmissionGate<B> {
        AdmissionGate {
            config: Rc::new(GateConfig {
                store: self.store,
                source: self.source,
                identifier_fn: self.identifier_fn,
                store_timeout: self.store_timeout,
            }),
        }
    }
}

#[derive(Serialize)]
struct RejectionBody<'a> {
    error: &'a str,
    #[serde(rename = "rateLimitExceeded")]
    rate_limit_exceeded: bool,
    limit: u64,
    remaining: u64,
    #[serde(rename = "resetTime")]
    reset_time: u64,
}

pub(super) fn rejection_response(policy: &Policy, decision: &AdmissionDecision) -> HttpResponse {
    let reset_ms = decision.reset_epoch_ms();
    let seconds = decision.seconds_until_reset();
    let message = decision.message.as_deref().unwrap_or(&policy.message);
    let mut response = HttpResponse::TooManyRequests().json(RejectionBody {
        error: message,
        rate_limit_exceeded: true,
        limit: decision.limit,
        remaining: decision.remaining,
        reset_time: reset_ms,
    });
    let map = response.headers_mut();
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining),
    );
    map.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(reset_ms));
    map.insert(RETRY_AFTER, HeaderValue::from(seconds));
    response
}

pub(super) fn append_status_headers(
    map: &mut HeaderMap,
    decision: &AdmissionDecision,
    rolled_back: bool,
) {
    // A rolled back event is credited back to the caller's budget.
    let remaining = if rolled_back {
        decision.remaining.saturating_add(1).min(decision.limit)
    } else {
        decision.remaining
    };
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    map.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(decision.reset_epoch_ms()),
    );
}
