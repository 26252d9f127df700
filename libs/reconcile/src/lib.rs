//! Convergence helpers shared by reconcilers.
//!
//! - [`SpecHash`]: fingerprint of a desired state, used to skip work that was
//!   already applied
//! - [`BackoffPolicy`]: exponential delay with jitter between retries
//! - [`RetryTracker`]: bounded failure budget per key within a time window

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Default retry limit for transient convergence failures.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default window in which failures count against the retry limit.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(600);

// =============================================================================
// Fingerprints
// =============================================================================

/// Fingerprint of a desired state.
///
/// Object keys are fingerprinted in sorted order, so two states that differ
/// only in key order share a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Fingerprint a JSON document.
    pub fn from_json(json: &Value) -> Self {
        let digest = Sha256::digest(sorted_keys(json).to_string().as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Fingerprint any serializable state.
    pub fn of<T: Serialize>(state: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(state).map(|json| Self::from_json(&json))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Copy of `value` with every object's keys in sorted order, whether or not
/// serde_json preserves insertion order.
fn sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_keys).collect()),
        other => other.clone(),
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff: `base * 2^attempt`, capped at `max`, spread by
/// `±jitter` of the delay.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any delay.
    pub max: Duration,

    /// Fraction of the delay to randomize by, clamped to 0.0..=1.0.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        let delay = self.base.saturating_mul(factor).min(self.max);

        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 || delay.is_zero() {
            return delay;
        }
        let scale = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        delay.mul_f64(scale).min(self.max)
    }
}

// =============================================================================
// Retry budget
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    count: u32,
    opened: Instant,
}

/// Counts failures per key; a key whose count exceeds `max_retries` within
/// one window is exhausted. A failure after the window has passed opens a
/// fresh window.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,
    failures: BTreeMap<String, FailureWindow>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for `key`. Returns true once the budget is exhausted.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let entry = self
            .failures
            .entry(key.to_string())
            .or_insert(FailureWindow { count: 0, opened: now });
        if now.duration_since(entry.opened) > self.window {
            *entry = FailureWindow { count: 0, opened: now };
        }
        entry.count += 1;
        entry.count > self.max_retries
    }

    /// Failures recorded for `key` in its current window.
    pub fn failures(&self, key: &str) -> u32 {
        match self.failures.get(key) {
            Some(w) if w.opened.elapsed() <= self.window => w.count,
            _ => 0,
        }
    }

    /// Forget `key`, typically after it succeeded.
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }
}
