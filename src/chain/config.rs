//! Cache settings read from the environment.

use std::env;

use chrono::Duration;
use log::warn;

/// Default freshness window, in seconds.
pub const DEFAULT_FRESHNESS_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub freshness_secs: i64,
    pub redis_url: Option<String>,
    pub store_secret: Option<[u8; 32]>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            freshness_secs: DEFAULT_FRESHNESS_SECS,
            redis_url: None,
            store_secret: None,
        }
    }
}

impl CacheSettings {
    /// Read `SIGCHAIN_FRESHNESS_SECS`, `SIGCHAIN_REDIS_URL` and
    /// `SIGCHAIN_STORE_SECRET`. Unset or unparseable values fall back to the
    /// defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let freshness_secs = lookup("SIGCHAIN_FRESHNESS_SECS")
            .and_then(|v| match v.parse::<i64>() {
                Ok(secs) if secs >= 0 => Some(secs),
                _ => {
                    warn!("Ignoring bad SIGCHAIN_FRESHNESS_SECS value: {}", v);
                    None
                }
            })
            .unwrap_or(DEFAULT_FRESHNESS_SECS);

        let redis_url = lookup("SIGCHAIN_REDIS_URL").filter(|v| !v.is_empty());

        let store_secret = lookup("SIGCHAIN_STORE_SECRET").and_then(|v| {
            let secret = hex::decode(v.trim())
                .ok()
                .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok());
            if secret.is_none() {
                warn!("SIGCHAIN_STORE_SECRET must be 32 bytes of hex; ignoring it");
            }
            secret
        });

        Self {
            freshness_secs,
            redis_url,
            store_secret,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness_secs = freshness.num_seconds();
        self
    }

    pub fn freshness(&self) -> Duration {
        Duration::seconds(self.freshness_secs)
    }

    /// Both a Redis URL and a secret are needed for a persistent store.
    pub fn store_enabled(&self) -> bool {
        self.redis_url.is_some() && self.store_secret.is_some()
    }
}
