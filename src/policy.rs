use std::time::Duration;

/// Maximum requests served while enforcement is globally disabled, effectively
/// unlimited for any realistic window.
pub const DISABLED_MAX_REQUESTS: u64 = 999_999;

const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// An immutable admission policy: how long the counting window is, how many
/// events it admits, and what the caller is told on rejection.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Length of the counting window.
    pub window: Duration,
    /// The total events permitted within the window.
    pub max_requests: u64,
    /// Rejection message shown to the caller.
    pub message: String,
    /// Deduct the recorded event again when the response was a success.
    pub skip_successful_requests: bool,
    /// Deduct the recorded event again when the response was an error.
    pub skip_failed_requests: bool,
}

impl Policy {
    pub fn new(window: Duration, max_requests: u64) -> Self {
        assert!(!window.is_zero(), "policy window must be non-zero");
        Self {
            window,
            max_requests,
            message: DEFAULT_MESSAGE.to_string(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_owned();
        self
    }

    /// Only count requests whose response was an error.
    pub fn skip_successful_requests(mut self) -> Self {
        self.skip_successful_requests = true;
        self
    }

    /// Only count requests whose response was a success.
    pub fn skip_failed_requests(mut self) -> Self {
        self.skip_failed_requests = true;
        self
    }

    /// The permissive policy served while the global enable switch is off.
    pub fn unlimited() -> Self {
        Self::new(Duration::from_secs(60), DISABLED_MAX_REQUESTS)
    }

    // Static fallback table, always available even when dynamic loading fails.

    /// Authentication attempts: 5 per 15 minutes.
    pub fn auth() -> Self {
        Self::new(Duration::from_secs(15 * 60), 5)
            .with_message("Too many authentication attempts, please try again later.")
    }

    /// General API requests: 100 per minute.
    pub fn api() -> Self {
        Self::new(Duration::from_secs(60), 100)
    }

    /// Uploads: 10 per minute.
    pub fn upload() -> Self {
        Self::new(Duration::from_secs(60), 10)
            .with_message("Too many uploads, please try again later.")
    }

    /// Outbound email: 50 per hour.
    pub fn email() -> Self {
        Self::new(Duration::from_secs(60 * 60), 50)
            .with_message("Too many emails sent, please try again later.")
    }

    /// Account registrations: 5 per minute.
    pub fn registration() -> Self {
        Self::new(Duration::from_secs(60), 5)
            .with_message("Too many registration attempts, please try again later.")
    }
}

/// The categories the dynamic policy loader knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    ApiRequests,
    Registrations,
    LoginAttempts,
    Messaging,
}

impl Category {
    /// The key this category is stored under in the settings store.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::ApiRequests => "apiRequests",
            Category::Registrations => "registrations",
            Category::LoginAttempts => "loginAttempts",
            Category::Messaging => "messaging",
        }
    }

    pub(crate) fn rejection_message(self) -> &'static str {
        match self {
            Category::ApiRequests => DEFAULT_MESSAGE,
            Category::Registrations => "Too many registration attempts, please try again later.",
            Category::LoginAttempts => "Too many login attempts, please try again later.",
            Category::Messaging => "Too many messages sent, please try again later.",
        }
    }
}
