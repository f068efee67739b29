pub mod builder;
#[cfg(test)]
mod tests;

use crate::key;
use crate::limiter::run_check;
use crate::policy::{Category, Policy};
use crate::settings::PolicyLoader;
use crate::store::CounterStore;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::StatusCode;
use builder::AdmissionGateBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

pub(crate) type IdentifierFn = Box<dyn Fn(&ServiceRequest) -> Option<String>>;

/// Where the middleware's admission policy comes from.
#[derive(Clone)]
pub enum PolicySource {
    /// A fixed policy chosen at construction time, from the static table or
    /// hand-built.
    Static(Policy),
    /// Per-request resolution through the dynamic policy loader, so limit
    /// changes and the global enable switch apply without a restart.
    Dynamic {
        loader: Arc<PolicyLoader>,
        category: Category,
    },
}

pub(crate) struct GateConfig<B> {
    pub(crate) store: B,
    pub(crate) source: PolicySource,
    pub(crate) identifier_fn: Option<IdentifierFn>,
    pub(crate) store_timeout: Duration,
}

/// Admission control middleware.
///
/// Checks every incoming request against its policy and either forwards it
/// (with `X-RateLimit-*` status headers appended to the response) or rejects
/// it with a structured 429. A failing counter store admits the request; the
/// only caller-visible failure mode of this middleware is a deliberate 429.
pub struct AdmissionGate<B: CounterStore> {
    pub(crate) config: Rc<GateConfig<B>>,
}

impl<B: CounterStore> Clone for AdmissionGate<B> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl<B: CounterStore + 'static> AdmissionGate<B> {
    /// # Arguments
    ///
    /// * `store`: The counting backend shared by every request through this
    ///   gate.
    /// * `source`: A fixed policy, or a loader plus category for dynamic
    ///   policies.
    pub fn builder(store: B, source: PolicySource) -> AdmissionGateBuilder<B> {
        AdmissionGateBuilder::new(store, source)
    }
}

impl<S, Bd, B> Transform<S, ServiceRequest> for AdmissionGate<B>
where
    S: Service<ServiceRequest, Response = ServiceResponse<Bd>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    Bd: 'static,
    B: CounterStore + 'static,
{
    type Response = ServiceResponse<EitherBody<Bd>>;
    type Error = actix_web::Error;
    type Transform = AdmissionGateMiddleware<S, B>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AdmissionGateMiddleware {
            service: Rc::new(RefCell::new(service)),
            config: self.config.clone(),
        })
    }
}

pub struct AdmissionGateMiddleware<S, B> {
    service: Rc<RefCell<S>>,
    config: Rc<GateConfig<B>>,
}

impl<S, Bd, B> Service<ServiceRequest> for AdmissionGateMiddleware<S, B>
where
    S: Service<ServiceRequest, Response = ServiceResponse<Bd>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    Bd: 'static,
    B: CounterStore + 'static,
{
    type Response = ServiceResponse<EitherBody<Bd>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let config = self.config.clone();

        Box::pin(async move {
            // Whitelisted admin addresses bypass counting entirely.
            if let PolicySource::Dynamic { loader, .. } = &config.source {
                if loader.is_whitelisted(&key::client_ip(&req)).await {
                    let service_response = service.call(req).await?;
                    return Ok(service_response.map_into_left_body());
                }
            }

            let policy = match &config.source {
                PolicySource::Static(policy) => policy.clone(),
                PolicySource::Dynamic { loader, category } => loader.policy_for(*category).await,
            };

            let identifier = config.identifier_fn.as_ref().and_then(|f| f(&req));
            let counting_key = key::derive_key(&req, identifier.as_deref());
            let decision =
                run_check(&config.store, &policy, &counting_key, config.store_timeout).await;

            if !decision.allowed {
                let response = builder::rejection_response(&policy, &decision);
                return Ok(req.into_response(response).map_into_right_body());
            }

            let mut service_response = service.call(req).await?;

            // Selective counting: deduct the recorded event again when the
            // response outcome matches a policy skip flag.
            let mut rolled_back = false;
            if let Some(token) = decision.rollback.clone() {
                if should_rollback(&policy, service_response.status()) {
                    match config.store.rollback(token).await {
                        Ok(()) => rolled_back = true,
                        Err(e) => log::error!(
                            "unable to roll back admission count for {counting_key}: {e}"
                        ),
                    }
                }
            }

            builder::append_status_headers(service_response.headers_mut(), &decision, rolled_back);
            Ok(service_response.map_into_left_body())
        })
    }
}

fn should_rollback(policy: &Policy, status: StatusCode) -> bool {
    (policy.skip_successful_requests && status.is_success())
        || (policy.skip_failed_requests && (status.is_client_error() || status.is_server_error()))
}
