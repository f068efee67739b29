use crate::middleware::builder::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
use crate::middleware::{AdmissionGate, PolicySource};
use crate::policy::{Category, Policy};
use crate::settings::{PolicyLoader, SettingEntry, SettingsError, SettingsSource};
use crate::store::{CheckInput, CheckOutput, CounterStore, Decision, RollbackToken};
use actix_web::http::StatusCode;
use actix_web::rt::time::Instant;
use actix_web::test::{self, TestRequest};
use actix_web::{get, App, HttpResponse, Responder};
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

#[get("/200")]
async fn route_200() -> impl Responder {
    HttpResponse::Ok().body("Hello world!")
}

#[get("/500")]
async fn route_500() -> impl Responder {
    HttpResponse::InternalServerError().body("Internal error")
}

#[derive(Clone, Default)]
struct MockStore(Arc<MockStoreInner>);

#[derive(Default)]
struct MockStoreInner {
    counter: AtomicU64,
    fail: AtomicBool,
    last_key: Mutex<Option<String>>,
}

#[derive(Debug)]
struct MockError;

impl Display for MockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock store error")
    }
}

impl CounterStore for MockStore {
    type Error = MockError;

    async fn record(
        &self,
        input: CheckInput,
    ) -> Result<(Decision, CheckOutput, RollbackToken), Self::Error> {
        if self.0.fail.load(Ordering::Relaxed) {
            return Err(MockError);
        }
        *self.0.last_key.lock().unwrap() = Some(input.key.clone());
        let count = self.0.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let allow = count <= input.max_requests;
        let output = CheckOutput {
            limit: input.max_requests,
            remaining: input.max_requests.saturating_sub(count),
            reset: Instant::now() + input.window,
        };
        let token = RollbackToken {
            key: input.key,
            member: None,
        };
        Ok((Decision::from_allowed(allow), output, token))
    }

    async fn rollback(&self, _token: RollbackToken) -> Result<(), Self::Error> {
        self.0.counter.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_key(&self, _key: &str) -> Result<(), Self::Error> {
        self.0.counter.store(0, Ordering::Relaxed);
        Ok(())
    }
}

struct StaticSource(Vec<SettingEntry>);

#[async_trait]
impl SettingsSource for StaticSource {
    async fn fetch_category(&self, _category: &str) -> Result<Vec<SettingEntry>, SettingsError> {
        Ok(self.0.clone())
    }
}

fn entry(key: &str, value: &str) -> SettingEntry {
    SettingEntry {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn dynamic_source(entries: Vec<SettingEntry>) -> PolicySource {
    PolicySource::Dynamic {
        loader: Arc::new(PolicyLoader::new(Arc::new(StaticSource(entries)))),
        category: Category::ApiRequests,
    }
}

#[actix_web::test]
async fn test_allow_deny() {
    let store = MockStore::default();
    let gate = AdmissionGate::builder(store, PolicySource::Static(Policy::new(MINUTE, 1))).build();
    let app = test::init_service(App::new().service(route_200).wrap(gate)).await;

    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert!(response.status().is_success());

    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = response.headers().clone();
    assert_eq!(headers.get(&*X_RATELIMIT_LIMIT).unwrap(), "1");
    assert_eq!(headers.get(&*X_RATELIMIT_REMAINING).unwrap(), "0");
    let reset: u64 = headers
        .get(&*X_RATELIMIT_RESET)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(reset > 0);
    let retry_after: u64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after <= 60);

    let body: serde_json::Value = test::read_body_json(response).await;
    assert_eq!(body["rateLimitExceeded"], true);
    assert_eq!(body["limit"], 1);
    assert_eq!(body["remaining"], 0);
    assert!(body["error"].as_str().unwrap().contains("Too many"));
    assert!(body["resetTime"].as_u64().unwrap() > 0);
}

#[actix_web::test]
async fn test_allowed_response_headers() {
    let store = MockStore::default();
    let gate = AdmissionGate::builder(store, PolicySource::Static(Policy::new(MINUTE, 5))).build();
    let app = test::init_service(App::new().service(route_200).wrap(gate)).await;

    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(&*X_RATELIMIT_LIMIT).unwrap(), "5");
    assert_eq!(response.headers().get(&*X_RATELIMIT_REMAINING).unwrap(), "4");
    assert!(response.headers().contains_key(&*X_RATELIMIT_RESET));
}

#[actix_web::test]
async fn test_fail_open() {
    let store = MockStore::default();
    store.0.fail.store(true, Ordering::Relaxed);
    let gate =
        AdmissionGate::builder(store.clone(), PolicySource::Static(Policy::new(MINUTE, 1))).build();
    let app = test::init_service(App::new().service(route_200).wrap(gate)).await;

    // The store is down; every request is still admitted
    for _ in 0..3 {
        let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(store.0.counter.load(Ordering::Relaxed), 0);
}

#[actix_web::test]
async fn test_skip_successful_requests() {
    let store = MockStore::default();
    let policy = Policy::new(MINUTE, 5).skip_successful_requests();
    let gate = AdmissionGate::builder(store.clone(), PolicySource::Static(policy)).build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .service(route_500)
            .wrap(gate),
    )
    .await;

    // A successful response is deducted again, and the credit is reflected
    // in the reported remaining count
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(&*X_RATELIMIT_REMAINING).unwrap(), "5");
    assert_eq!(store.0.counter.load(Ordering::Relaxed), 0);

    // A failed response still counts
    let response = test::call_service(&app, TestRequest::get().uri("/500").to_request()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(store.0.counter.load(Ordering::Relaxed), 1);
}

#[actix_web::test]
async fn test_skip_failed_requests() {
    let store = MockStore::default();
    let policy = Policy::new(MINUTE, 5).skip_failed_requests();
    let gate = AdmissionGate::builder(store.clone(), PolicySource::Static(policy)).build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .service(route_500)
            .wrap(gate),
    )
    .await;

    let response = test::call_service(&app, TestRequest::get().uri("/500").to_request()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(store.0.counter.load(Ordering::Relaxed), 0);

    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.0.counter.load(Ordering::Relaxed), 1);
}

#[actix_web::test]
async fn test_dynamic_disabled_switch() {
    let store = MockStore::default();
    // Enforcement off: even a zero limit admits everything
    let source = dynamic_source(vec![
        entry("enabled", "false"),
        entry("apiRequests", r#"{"limit":0,"window":"minute"}"#),
    ]);
    let gate = AdmissionGate::builder(store, source).build();
    let app = test::init_service(App::new().service(route_200).wrap(gate)).await;

    for _ in 0..5 {
        let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[actix_web::test]
async fn test_dynamic_limit_enforced() {
    let store = MockStore::default();
    // floor(2 * 100 / 100) = 2 requests per minute
    let source = dynamic_source(vec![
        entry("burstAllowance", "100"),
        entry("apiRequests", r#"{"limit":2,"window":"minute"}"#),
    ]);
    let gate = AdmissionGate::builder(store, source).build();
    let app = test::init_service(App::new().service(route_200).wrap(gate)).await;

    for _ in 0..2 {
        let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_whitelist_bypass() {
    let store = MockStore::default();
    let source = dynamic_source(vec![
        entry("whitelistAdminIPs", r#"["9.9.9.9"]"#),
        entry("apiRequests", r#"{"limit":0,"window":"minute"}"#),
    ]);
    let gate = AdmissionGate::builder(store.clone(), source).build();
    let app = test::init_service(App::new().service(route_200).wrap(gate)).await;

    // Whitelisted address is never counted
    let request = TestRequest::get()
        .uri("/200")
        .insert_header(("x-forwarded-for", "9.9.9.9"))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.0.counter.load(Ordering::Relaxed), 0);

    // Anyone else is subject to the (zero) limit
    let request = TestRequest::get()
        .uri("/200")
        .insert_header(("x-forwarded-for", "1.2.3.4"))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_identifier_fn() {
    let store = MockStore::default();
    let gate = AdmissionGate::builder(store.clone(), PolicySource::Static(Policy::new(MINUTE, 5)))
        .identifier_fn(|req| {
            req.headers()
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .map(|id| format!("user:{id}"))
        })
        .build();
    let app = test::init_service(App::new().service(route_200).wrap(gate)).await;

    let request = TestRequest::get()
        .uri("/200")
        .insert_header(("x-user-id", "42"))
        .to_request();
    test::call_service(&app, request).await;
    assert_eq!(
        store.0.last_key.lock().unwrap().as_deref(),
        Some("rate_limit:user:42")
    );

    // Without an identifier the key falls back to address and path
    let request = TestRequest::get()
        .uri("/200")
        .insert_header(("x-forwarded-for", "1.2.3.4"))
        .to_request();
    test::call_service(&app, request).await;
    assert_eq!(
        store.0.last_key.lock().unwrap().as_deref(),
        Some("rate_limit:1.2.3.4:/200")
    );
}
