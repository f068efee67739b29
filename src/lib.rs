#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod key;
pub mod limiter;
mod middleware;
pub mod policy;
pub mod settings;
pub mod store;

pub use limiter::{AdmissionDecision, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use middleware::builder::AdmissionGateBuilder;
pub use middleware::{AdmissionGate, PolicySource};
pub use policy::{Category, Policy};
