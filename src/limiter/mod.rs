//! Per-url Rate Limiter
//!
//! Keeps the same url from being admitted into the queueing pipeline more
//! than once per cooldown window. An entry older than the window counts as
//! absent whether or not [`RateLimiter::cleanup`] has removed it yet.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{Clock, SystemClock};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Minimum time between two admissions of the same url
    pub window: Duration,

    /// How often expired entries are garbage collected
    pub cleanup_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(30_000),
            cleanup_interval: Duration::from_millis(60_000),
        }
    }
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Cooldown gate keyed by url.
pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    last_admitted: DashMap<String, DateTime<Utc>>,
}

impl RateLimiter {
    /// Create a limiter reading the system clock.
    pub fn new(config: RateLimiterConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            last_admitted: DashMap::new(),
        })
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Admit `key` if it has no live entry, recording the admission time.
    ///
    /// The check and the update happen under the entry's shard lock, so two
    /// callers can never both be admitted for the same key inside one window.
    pub fn can_add(&self, key: &str) -> bool {
        let now = self.clock.now();

        match self.last_admitted.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            Entry::Occupied(mut slot) => {
                if self.is_expired(*slot.get(), now) {
                    slot.insert(now);
                    true
                } else {
                    debug!("Rate limited {}", key);
                    false
                }
            }
        }
    }

    /// Forget the admission of `key`, so its next call is admitted.
    pub fn release(&self, key: &str) {
        if self.last_admitted.remove(key).is_some() {
            debug!("Released rate limit entry for {}", key);
        }
    }

    /// Drop every entry whose cooldown has elapsed. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.last_admitted.len();
        self.last_admitted
            .retain(|_, last| !self.is_expired(*last, now));
        let removed = before.saturating_sub(self.last_admitted.len());

        if removed > 0 {
            debug!("Rate limiter cleanup removed {} entries", removed);
        }
        removed
    }

    /// Number of physically stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.last_admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_admitted.is_empty()
    }

    /// Run periodic cleanup until `shutdown` fires.
    pub async fn run_cleanup(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.cleanup_interval;
        info!("Starting rate limiter cleanup every {:?}", period);

        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Rate limiter cleanup shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.cleanup();
                }
            }
        }
    }

    fn is_expired(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(last);
        match chrono::Duration::from_std(self.config.window) {
            Ok(window) => elapsed >= window,
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.config.window)
            .field("entries", &self.last_admitted.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ManualClock;
    use proptest::prelude::*;

    fn limiter() -> (Arc<RateLimiter>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::with_clock(RateLimiterConfig::default(), clock.clone());
        (limiter, clock)
    }

    // =========================================================================
    // Config Tests
    // =========================================================================

    #[test]
    fn test_config_default() {
        let config = RateLimiterConfig::default();

        assert_eq!(config.window, Duration::from_millis(30_000));
        assert_eq!(config.cleanup_interval, Duration::from_millis(60_000));
    }

    // =========================================================================
    // Admission Tests
    // =========================================================================

    #[test]
    fn test_second_call_rejected() {
        let (limiter, _) = limiter();

        assert!(limiter.can_add("https://x.test"));
        assert!(!limiter.can_add("https://x.test"));
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _) = limiter();

        assert!(limiter.can_add("https://a.test"));
        assert!(limiter.can_add("https://b.test"));
        assert!(!limiter.can_add("https://a.test"));
    }

    #[test]
    fn test_admits_again_at_exact_window() {
        let (limiter, clock) = limiter();

        assert!(limiter.can_add("k"));
        clock.advance_ms(30_000);
        assert!(limiter.can_add("k"));
    }

    #[test]
    fn test_rejection_does_not_refresh_entry() {
        let (limiter, clock) = limiter();

        assert!(limiter.can_add("k"));
        clock.advance_ms(20_000);
        assert!(!limiter.can_add("k"));
        clock.advance_ms(10_000);
        // 30s since the admission, only 10s since the rejection
        assert!(limiter.can_add("k"));
    }

    #[test]
    fn test_release_readmits() {
        let (limiter, _) = limiter();

        assert!(limiter.can_add("k"));
        limiter.release("k");
        assert!(limiter.can_add("k"));
        assert!(!limiter.can_add("k"));

        limiter.release("unknown");
        assert_eq!(limiter.len(), 1);
    }

    // =========================================================================
    // Cleanup Tests
    // =========================================================================

    #[test]
    fn test_cleanup_removes_expired_only() {
        let (limiter, clock) = limiter();

        limiter.can_add("old");
        clock.advance_ms(25_000);
        limiter.can_add("new");
        clock.advance_ms(5_000);

        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.len(), 1);
        assert!(!limiter.can_add("new"));
    }

    #[test]
    fn test_cleanup_on_empty_is_noop() {
        let (limiter, _) = limiter();
        assert_eq!(limiter.cleanup(), 0);
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cleanup_stops_on_shutdown() {
        let (limiter, clock) = limiter();
        limiter.can_add("k");
        clock.advance_ms(31_000);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(limiter.clone().run_cleanup(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(60_001)).await;
        assert!(limiter.is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    // =========================================================================
    // Property Tests
    // =========================================================================

    proptest! {
        #[test]
        fn prop_window_boundary(advance in 0i64..60_000) {
            let (limiter, clock) = limiter();
            prop_assert!(limiter.can_add("k"));
            clock.advance_ms(advance);
            prop_assert_eq!(limiter.can_add("k"), advance >= 30_000);
        }

        #[test]
        fn prop_cleanup_does_not_change_admission(advance in 0i64..60_000, clean in any::<bool>()) {
            let (limiter, clock) = limiter();
            limiter.can_add("k");
            clock.advance_ms(advance);
            if clean {
                limiter.cleanup();
            }
            prop_assert_eq!(limiter.can_add("k"), advance >= 30_000);
        }
    }
}
