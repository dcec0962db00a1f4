//! Fixed-window request counting per client identifier.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{config::RateLimitPolicy, error::Error};

/// Counter for one identifier within its current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    /// Unix milliseconds after which the window is over
    pub reset_at: u64,
}

impl RateLimitEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.reset_at
    }
}

/// Storage for rate-limit counters.
///
/// `update` must run the closure atomically with respect to other calls for
/// the same key; that is what keeps concurrent requests from over-admitting.
pub trait RateLimitStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<RateLimitEntry>;

    /// Runs `op` against the slot for `key` and returns its verdict.
    fn update(&self, key: &str, op: &mut dyn FnMut(&mut Option<RateLimitEntry>) -> bool) -> bool;

    /// Removes expired entries, returning how many were dropped.
    fn remove_expired(&self, now: u64) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store behind a single mutex
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RateLimitEntry>> {
        // Entries stay consistent even if a holder panicked
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RateLimitStore for MemoryStore {
    fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.lock().get(key).copied()
    }

    fn update(&self, key: &str, op: &mut dyn FnMut(&mut Option<RateLimitEntry>) -> bool) -> bool {
        let mut entries = self.lock();
        let mut slot = entries.get(key).copied();
        let verdict = op(&mut slot);
        match slot {
            Some(entry) => {
                entries.insert(key.to_string(), entry);
            }
            None => {
                entries.remove(key);
            }
        }
        verdict
    }

    fn remove_expired(&self, now: u64) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Snapshot of a limiter check, enough to render rate-limit headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix milliseconds
    pub reset_at: u64,
    /// Whole seconds until the window resets, at least 1
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at.div_ceil(1000)
    }
}

pub struct RateLimiter {
    policy: RateLimitPolicy,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    /// Limiter backed by a fresh in-memory store
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_store(policy, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(policy: RateLimitPolicy, store: Arc<dyn RateLimitStore>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub fn is_allowed(&self, identifier: &str) -> bool {
        self.is_allowed_at(identifier, now_millis())
    }

    pub fn is_allowed_at(&self, identifier: &str, now: u64) -> bool {
        self.admit(identifier, now).0
    }

    /// Counts one request, returning the verdict and the entry as it stood
    /// when the store lock was released.
    fn admit(&self, identifier: &str, now: u64) -> (bool, RateLimitEntry) {
        let max = self.policy.max_requests;
        let window = window_millis(self.policy.window);
        let mut snapshot = RateLimitEntry {
            count: 0,
            reset_at: now.saturating_add(window),
        };

        let allowed = self.store.update(identifier, &mut |slot| {
            if let Some(entry) = slot.as_mut().filter(|entry| !entry.is_expired(now)) {
                snapshot = *entry;
                if entry.count >= max {
                    return false;
                }
                entry.count += 1;
                snapshot = *entry;
                return true;
            }

            let entry = RateLimitEntry {
                count: 1,
                reset_at: now.saturating_add(window),
            };
            *slot = Some(entry);
            snapshot = entry;
            true
        });

        (allowed, snapshot)
    }

    pub fn remaining(&self, identifier: &str) -> u32 {
        self.remaining_at(identifier, now_millis())
    }

    pub fn remaining_at(&self, identifier: &str, now: u64) -> u32 {
        match self.store.get(identifier) {
            Some(entry) if !entry.is_expired(now) => {
                self.policy.max_requests.saturating_sub(entry.count)
            }
            _ => self.policy.max_requests,
        }
    }

    /// Unix milliseconds at which the identifier's window resets
    pub fn reset_time(&self, identifier: &str) -> u64 {
        self.reset_time_at(identifier, now_millis())
    }

    pub fn reset_time_at(&self, identifier: &str, now: u64) -> u64 {
        match self.store.get(identifier) {
            Some(entry) => entry.reset_at,
            None => now.saturating_add(window_millis(self.policy.window)),
        }
    }

    pub fn check(&self, identifier: &str) -> RateLimitDecision {
        self.check_at(identifier, now_millis())
    }

    /// Counts one request and reports the resulting window state.
    pub fn check_at(&self, identifier: &str, now: u64) -> RateLimitDecision {
        let (allowed, entry) = self.admit(identifier, now);
        let retry_after_secs = entry.reset_at.saturating_sub(now).div_ceil(1000).max(1);

        if !allowed {
            warn!(
                identifier = %identifier,
                limit = self.policy.max_requests,
                retry_after_secs,
                "Rate limit exceeded"
            );
        }

        RateLimitDecision {
            allowed,
            limit: self.policy.max_requests,
            remaining: self.policy.max_requests.saturating_sub(entry.count),
            reset_at: entry.reset_at,
            retry_after_secs,
        }
    }

    /// Like [`check`](Self::check) but rejects with [`Error::RateLimitExceeded`].
    pub fn acquire(&self, identifier: &str) -> Result<RateLimitDecision, Error> {
        let decision = self.check(identifier);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(Error::RateLimitExceeded {
                limit: decision.limit,
                reset_at: decision.reset_at,
                retry_after: decision.retry_after_secs,
            })
        }
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(now_millis())
    }

    pub fn sweep_expired_at(&self, now: u64) -> usize {
        let removed = self.store.remove_expired(now);
        if removed > 0 {
            debug!(removed, remaining = self.store.len(), "Swept expired rate-limit windows");
        }
        removed
    }

    /// Sweeps expired windows every `interval` until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.sweep_expired();
                    }
                    None => break,
                }
            }
        })
    }
}

fn window_millis(window: Duration) -> u64 {
    window.as_millis().try_into().unwrap_or(u64::MAX)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
