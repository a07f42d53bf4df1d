//! In-memory state behind the admission gate: rate records, suspicion
//! scores, the temporary blacklist, and anonymous client tokens.
//!
//! The gate is written against the [`GateStore`] trait so a deployment
//! needing cross-instance consistency can swap in an external store
//! without touching the decision logic.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, info};

/// Rate tier selected by the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    /// Default cap for ordinary API routes
    Default,
    /// Strictest cap, for file-upload routes
    Upload,
    /// Relaxed cap for designated high-volume routes
    HighVolume,
}

impl RateTier {
    fn key_prefix(self) -> &'static str {
        match self {
            RateTier::Default => "default",
            RateTier::Upload => "upload",
            RateTier::HighVolume => "high",
        }
    }
}

/// Abstract store the admission gate makes its decisions against
pub trait GateStore: Send + Sync {
    /// Record one request against the identity's window for the tier.
    /// Returns `false` when the cap is now exceeded.
    fn record_hit(&self, identity: &str, tier: RateTier, cap: u32) -> bool;

    /// Record one anomaly for the identity. Returns `true` when this
    /// crossed the threshold and promoted the identity to the blacklist.
    fn record_suspicion(&self, identity: &str, reason: &'static str) -> bool;

    /// Whether the identity currently has a live blacklist entry
    fn is_blacklisted(&self, identity: &str) -> bool;

    /// Mint and remember a fresh client token
    fn issue_token(&self) -> String;

    /// Whether the token is known and unexpired
    fn is_token_valid(&self, token: &str) -> bool;

    /// Purge expired rate records, suspicion records, blacklist entries,
    /// and tokens
    fn sweep(&self);
}

/// Windowed counter: count + window start
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u32,
    window_start: Instant,
}

#[derive(Debug)]
struct BlacklistEntry {
    inserted_at: Instant,
    reason: &'static str,
}

/// Process-local `GateStore` backed by concurrent maps. State is not
/// durable and resets on restart.
pub struct MemoryStore {
    rate_window: Duration,
    suspicion_threshold: u32,
    suspicion_window: Duration,
    blacklist_duration: Duration,
    token_lifetime: Duration,
    // Keyed "tier:identity" so the same identity tracks per-tier windows
    rates: DashMap<String, WindowCounter>,
    suspicion: DashMap<String, WindowCounter>,
    blacklist: DashMap<String, BlacklistEntry>,
    tokens: DashMap<String, Instant>,
}

impl MemoryStore {
    pub fn new(
        rate_window: Duration,
        suspicion_threshold: u32,
        suspicion_window: Duration,
        blacklist_duration: Duration,
        token_lifetime: Duration,
    ) -> Self {
        Self {
            rate_window,
            suspicion_threshold,
            suspicion_window,
            blacklist_duration,
            token_lifetime,
            rates: DashMap::new(),
            suspicion: DashMap::new(),
            blacklist: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.rate_window,
            config.suspicion_threshold,
            config.suspicion_window,
            config.blacklist_duration,
            config.token_lifetime,
        )
    }
}

impl GateStore for MemoryStore {
    fn record_hit(&self, identity: &str, tier: RateTier, cap: u32) -> bool {
        let key = format!("{}:{}", tier.key_prefix(), identity);
        let mut entry = self.rates.entry(key).or_insert(WindowCounter {
            count: 0,
            window_start: Instant::now(),
        });
        if entry.window_start.elapsed() > self.rate_window {
            entry.count = 1;
            entry.window_start = Instant::now();
        } else {
            entry.count += 1;
        }
        entry.count <= cap
    }

    fn record_suspicion(&self, identity: &str, reason: &'static str) -> bool {
        let mut entry = self
            .suspicion
            .entry(identity.to_string())
            .or_insert(WindowCounter {
                count: 0,
                window_start: Instant::now(),
            });
        if entry.window_start.elapsed() > self.suspicion_window {
            entry.count = 1;
            entry.window_start = Instant::now();
        } else {
            entry.count += 1;
        }
        debug!(identity, reason, count = entry.count, "Suspicious activity");
        if entry.count >= self.suspicion_threshold {
            drop(entry);
            self.suspicion.remove(identity);
            self.blacklist.insert(
                identity.to_string(),
                BlacklistEntry {
                    inserted_at: Instant::now(),
                    reason,
                },
            );
            info!(identity, reason, "Identity blacklisted");
            return true;
        }
        false
    }

    fn is_blacklisted(&self, identity: &str) -> bool {
        // Drop the read guard before removing; a remove on the same
        // shard would otherwise deadlock
        let expired = match self.blacklist.get(identity) {
            Some(entry) if entry.inserted_at.elapsed() <= self.blacklist_duration => {
                debug!(identity, reason = entry.reason, "Blocked blacklisted identity");
                return true;
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.blacklist.remove(identity);
        }
        false
    }

    fn issue_token(&self) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(48)
            .map(char::from)
            .collect();
        self.tokens.insert(token.clone(), Instant::now());
        token
    }

    fn is_token_valid(&self, token: &str) -> bool {
        match self.tokens.get(token) {
            Some(issued_at) => issued_at.elapsed() <= self.token_lifetime,
            None => false,
        }
    }

    fn sweep(&self) {
        let rate_window = self.rate_window;
        self.rates
            .retain(|_, counter| counter.window_start.elapsed() <= rate_window);
        let suspicion_window = self.suspicion_window;
        self.suspicion
            .retain(|_, counter| counter.window_start.elapsed() <= suspicion_window);
        let blacklist_duration = self.blacklist_duration;
        self.blacklist
            .retain(|_, entry| entry.inserted_at.elapsed() <= blacklist_duration);
        let token_lifetime = self.token_lifetime;
        self.tokens
            .retain(|_, issued_at| issued_at.elapsed() <= token_lifetime);
        debug!(
            rates = self.rates.len(),
            suspicion = self.suspicion.len(),
            blacklist = self.blacklist.len(),
            tokens = self.tokens.len(),
            "Swept expired gate state"
        );
    }
}

/// Simple fixed-window per-identity limiter for the relay endpoint,
/// layered on top of the gate's tiered limits.
pub struct RelayLimiter {
    cap: u32,
    window: Duration,
    counters: DashMap<String, WindowCounter>,
}

impl RelayLimiter {
    pub fn new(cap: u32, window: Duration) -> Self {
        Self {
            cap,
            window,
            counters: DashMap::new(),
        }
    }

    /// Returns `true` if the request is allowed
    pub fn check(&self, identity: &str) -> bool {
        let mut entry = self
            .counters
            .entry(identity.to_string())
            .or_insert(WindowCounter {
                count: 0,
                window_start: Instant::now(),
            });
        if entry.window_start.elapsed() > self.window {
            entry.count = 1;
            entry.window_start = Instant::now();
            true
        } else if entry.count < self.cap {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    pub fn cleanup(&self) {
        let window = self.window;
        self.counters
            .retain(|_, counter| counter.window_start.elapsed() <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_store() -> MemoryStore {
        MemoryStore::new(
            Duration::from_millis(50),  // rate window
            3,                          // suspicion threshold
            Duration::from_millis(200), // suspicion window
            Duration::from_millis(100), // blacklist duration
            Duration::from_millis(100), // token lifetime
        )
    }

    #[test]
    fn test_rate_cap_and_window_reset() {
        let store = quick_store();
        for _ in 0..5 {
            assert!(store.record_hit("1.2.3.4", RateTier::Default, 5));
        }
        // Sixth request in the same window exceeds the cap
        assert!(!store.record_hit("1.2.3.4", RateTier::Default, 5));

        std::thread::sleep(Duration::from_millis(60));
        assert!(store.record_hit("1.2.3.4", RateTier::Default, 5));
    }

    #[test]
    fn test_rate_tiers_are_independent() {
        let store = quick_store();
        assert!(!(0..3).all(|_| store.record_hit("1.2.3.4", RateTier::Upload, 2)));
        // Upload tier exhaustion does not touch the default tier
        assert!(store.record_hit("1.2.3.4", RateTier::Default, 2));
    }

    #[test]
    fn test_suspicion_promotes_to_blacklist() {
        let store = quick_store();
        assert!(!store.record_suspicion("6.6.6.6", "rate"));
        assert!(!store.record_suspicion("6.6.6.6", "rate"));
        assert!(store.record_suspicion("6.6.6.6", "bot"));
        assert!(store.is_blacklisted("6.6.6.6"));
        // Promotion clears the suspicion record
        assert!(store.suspicion.get("6.6.6.6").is_none());
    }

    #[test]
    fn test_blacklist_expires() {
        let store = quick_store();
        for _ in 0..3 {
            store.record_suspicion("6.6.6.6", "rate");
        }
        assert!(store.is_blacklisted("6.6.6.6"));
        std::thread::sleep(Duration::from_millis(110));
        assert!(!store.is_blacklisted("6.6.6.6"));
    }

    #[test]
    fn test_token_lifecycle() {
        let store = quick_store();
        let token = store.issue_token();
        assert_eq!(token.len(), 48);
        assert!(store.is_token_valid(&token));
        assert!(!store.is_token_valid("unknown-token"));

        std::thread::sleep(Duration::from_millis(110));
        assert!(!store.is_token_valid(&token));
    }

    #[test]
    fn test_sweep_purges_expired_entries() {
        let store = quick_store();
        store.record_hit("1.2.3.4", RateTier::Default, 10);
        store.issue_token();
        store.record_suspicion("6.6.6.6", "rate");
        std::thread::sleep(Duration::from_millis(250));
        store.sweep();
        assert!(store.rates.is_empty());
        assert!(store.tokens.is_empty());
        assert!(store.suspicion.is_empty());
    }

    #[test]
    fn test_relay_limiter() {
        let limiter = RelayLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.check("9.9.9.9"));
        assert!(limiter.check("9.9.9.9"));
        assert!(!limiter.check("9.9.9.9"));
        // Other identities are unaffected
        assert!(limiter.check("8.8.8.8"));

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.check("9.9.9.9"));
    }
}
