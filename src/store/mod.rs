#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

use actix_web::rt::time::Instant;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Input to a single admission check.
#[derive(Debug, Clone)]
pub struct CheckInput {
    /// Length of the counting window.
    pub window: Duration,
    /// The total events permitted within the window.
    pub max_requests: u64,
    /// The counting key for the subject being throttled.
    pub key: String,
}

/// Result of a single admission check.
#[derive(Debug, Clone)]
pub struct CheckOutput {
    /// Total number of events permitted within the window.
    pub limit: u64,
    /// Events that will still be admitted before the limit resets.
    pub remaining: u64,
    /// Time at which the window resets.
    pub reset: Instant,
}

/// Handle to the event recorded by [CounterStore::record], used to deduct it
/// again when selective counting excludes the finished request.
#[derive(Debug, Clone)]
pub struct RollbackToken {
    pub(crate) key: String,
    /// Set by stores that record one entry per event rather than a single
    /// counter, identifying the entry to delete.
    pub(crate) member: Option<String>,
}

/// A counting backend tracking recent activity per key.
///
/// A store is required to implement [Clone]; usually this means wrapping the
/// underlying map or connection within an [Arc](std::sync::Arc), although many
/// connection managers already do so internally.
///
/// Every check is also a write: the current event is recorded whether or not
/// it is admitted, so rejected callers still count toward future windows.
pub trait CounterStore: Clone {
    type Error: Display;

    /// Record the current event under `input.key` and decide whether to admit
    /// it based on the activity already inside the window.
    fn record(
        &self,
        input: CheckInput,
    ) -> impl Future<Output = Result<(Decision, CheckOutput, RollbackToken), Self::Error>>;

    /// Deduct a previously recorded event.
    ///
    /// Used after the protected operation completes, when its outcome means it
    /// should not count toward the window (see the policy skip flags). If this
    /// fails the request has already been admitted, so the caller can only log.
    fn rollback(&self, token: RollbackToken) -> impl Future<Output = Result<(), Self::Error>>;

    /// Remove all recorded activity for a key.
    ///
    /// Intended for resetting a subject before changing its policy.
    fn remove_key(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}
