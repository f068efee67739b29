//! Live-reloadable per-category policies, read from an external settings
//! store and cached behind a short TTL so the store is not consulted on every
//! request.

use crate::policy::{Category, Policy};
use actix_web::rt::time::Instant;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// The settings-store category holding all rate limit configuration.
pub const SETTINGS_CATEGORY: &str = "rateLimits";

/// How long a fetched snapshot is served before the store is consulted again.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings store unavailable: {0}")]
    Unavailable(String),
}

/// One stored setting: a key within the category and its JSON-encoded value.
#[derive(Debug, Clone)]
pub struct SettingEntry {
    pub key: String,
    pub value: String,
}

/// Boundary to the external settings store.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Fetch all entries in the given category in one query.
    async fn fetch_category(&self, category: &str) -> Result<Vec<SettingEntry>, SettingsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowUnit {
    Minute,
    Hour,
    Day,
}

impl WindowUnit {
    pub fn duration(self) -> Duration {
        match self {
            WindowUnit::Minute => Duration::from_secs(60),
            WindowUnit::Hour => Duration::from_secs(60 * 60),
            WindowUnit::Day => Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A stored per-category limit: so many events per window unit.
#[derive(Debug, Clone, Deserialize)]
pub struct CategoryLimit {
    pub limit: u64,
    pub window: WindowUnit,
}

impl CategoryLimit {
    fn new(limit: u64, window: WindowUnit) -> Self {
        Self { limit, window }
    }
}

/// The full rate limit configuration table.
///
/// [Default] is the built-in fallback used whenever the settings store cannot
/// be read.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Global enforcement switch; when off, every category serves
    /// [Policy::unlimited].
    pub enabled: bool,
    /// Percentage multiplier applied to every category limit to tolerate
    /// short spikes (150 = 1.5x).
    pub burst_allowance: u64,
    pub api_requests: CategoryLimit,
    pub registrations: CategoryLimit,
    pub login_attempts: CategoryLimit,
    pub messaging: CategoryLimit,
    /// Client IPs exempt from admission control entirely.
    pub whitelist_admin_ips: Vec<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            burst_allowance: 150,
            api_requests: CategoryLimit::new(100, WindowUnit::Minute),
            registrations: CategoryLimit::new(5, WindowUnit::Minute),
            login_attempts: CategoryLimit::new(10, WindowUnit::Minute),
            messaging: CategoryLimit::new(20, WindowUnit::Hour),
            whitelist_admin_ips: Vec::new(),
        }
    }
}

impl RateLimitSettings {
    /// Overlay the stored entries on the built-in defaults. A malformed entry
    /// is logged and skipped; the remaining entries still apply.
    fn from_entries(entries: &[SettingEntry]) -> Self {
        let mut settings = Self::default();
        for entry in entries {
            if let Err(e) = settings.apply(entry) {
                log::warn!("skipping malformed rate limit setting {}: {e}", entry.key);
            }
        }
        settings
    }

    fn apply(&mut self, entry: &SettingEntry) -> Result<(), serde_json::Error> {
        match entry.key.as_str() {
            "enabled" => self.enabled = serde_json::from_str(&entry.value)?,
            "burstAllowance" => self.burst_allowance = serde_json::from_str(&entry.value)?,
            "apiRequests" => self.api_requests = serde_json::from_str(&entry.value)?,
            "registrations" => self.registrations = serde_json::from_str(&entry.value)?,
            "loginAttempts" => self.login_attempts = serde_json::from_str(&entry.value)?,
            "messaging" => self.messaging = serde_json::from_str(&entry.value)?,
            "whitelistAdminIPs" => self.whitelist_admin_ips = serde_json::from_str(&entry.value)?,
            other => log::debug!("ignoring unknown rate limit setting {other}"),
        }
        Ok(())
    }

    fn category(&self, category: Category) -> &CategoryLimit {
        match category {
            Category::ApiRequests => &self.api_requests,
            Category::Registrations => &self.registrations,
            Category::LoginAttempts => &self.login_attempts,
            Category::Messaging => &self.messaging,
        }
    }

    /// Materialize the effective policy for one category.
    pub fn policy_for(&self, category: Category) -> Policy {
        if !self.enabled {
            return Policy::unlimited();
        }
        let limit = self.category(category);
        let effective_max = limit.limit * self.burst_allowance / 100;
        Policy::new(limit.window.duration(), effective_max)
            .with_message(category.rejection_message())
    }
}

struct Snapshot {
    settings: RateLimitSettings,
    fetched_at: Instant,
}

/// TTL-cached view over the settings store.
///
/// Many callers read the cache concurrently; a refresh replaces the snapshot
/// in one swap, so in-flight readers keep the old snapshot until the new one
/// lands. Concurrent refreshes race harmlessly (last writer wins). When the
/// store cannot be read the built-in defaults are served and the cache is
/// left untouched, so the next call retries.
pub struct PolicyLoader {
    source: Arc<dyn SettingsSource>,
    cache: RwLock<Option<Snapshot>>,
    ttl: Duration,
}

impl PolicyLoader {
    pub fn new(source: Arc<dyn SettingsSource>) -> Self {
        Self::with_cache_ttl(source, DEFAULT_CACHE_TTL)
    }

    /// Override the snapshot TTL.
    pub fn with_cache_ttl(source: Arc<dyn SettingsSource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
            ttl,
        }
    }

    /// The effective policy for a category, served from the cached snapshot
    /// when it is still fresh.
    pub async fn policy_for(&self, category: Category) -> Policy {
        self.current_settings().await.policy_for(category)
    }

    /// Whether a client IP is exempt from admission control.
    pub async fn is_whitelisted(&self, ip: &str) -> bool {
        self.current_settings()
            .await
            .whitelist_admin_ips
            .iter()
            .any(|whitelisted| whitelisted == ip)
    }

    pub async fn current_settings(&self) -> RateLimitSettings {
        {
            let cache = self.cache.read().unwrap();
            if let Some(snapshot) = cache.as_ref() {
                if snapshot.fetched_at.elapsed() < self.ttl {
                    return snapshot.settings.clone();
                }
            }
            // Guard dropped before the fetch; stale readers are served the
            // old snapshot until the swap below.
        }
        self.refresh().await
    }

    /// Force a re-fetch, bypassing the TTL.
    pub async fn refresh(&self) -> RateLimitSettings {
        match self.source.fetch_category(SETTINGS_CATEGORY).await {
            Ok(entries) => {
                let settings = RateLimitSettings::from_entries(&entries);
                let mut cache = self.cache.write().unwrap();
                *cache = Some(Snapshot {
                    settings: settings.clone(),
                    fetched_at: Instant::now(),
                });
                settings
            }
            Err(e) => {
                log::error!("failed to load rate limit settings: {e}, using built-in defaults");
                RateLimitSettings::default()
            }
        }
    }
}
