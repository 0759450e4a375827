//! Sliding-window rate limiting shared across concurrent runs.
//!
//! One [`SlidingWindowLimiter`] exists per model identifier. It tracks two
//! trailing 60-second windows: request timestamps (for the requests-per-minute
//! ceiling) and `(timestamp, tokens)` records (for the tokens-per-minute
//! ceiling). Entries are pruned lazily whenever the limiter is touched.
//!
//! Token accounting happens after the fact through
//! [`record_tokens`](SlidingWindowLimiter::record_tokens): the request that
//! pushes usage over the ceiling is admitted, and only subsequent requests
//! wait for the window to drain.
//!
//! Limiters live in a [`RateLimiterRegistry`]. The engine takes the registry
//! as a dependency; [`RateLimiterRegistry::global`] provides the process-wide
//! instance for callers that want cross-engine sharing without plumbing.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Length of both sliding windows.
pub const WINDOW: Duration = Duration::from_secs(60);

// ── Limits ─────────────────────────────────────────────────────────

/// Per-minute ceilings. `None` (or zero) means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RateLimits {
    /// Requests per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    /// Tokens per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u64>,
}

impl RateLimits {
    pub fn new(rpm: Option<u32>, tpm: Option<u64>) -> Self {
        Self {
            rpm: rpm.filter(|&r| r > 0),
            tpm: tpm.filter(|&t| t > 0),
        }
    }

    pub fn rpm(rpm: u32) -> Self {
        Self::new(Some(rpm), None)
    }

    pub fn is_unbounded(&self) -> bool {
        self.rpm.is_none() && self.tpm.is_none()
    }

    /// The more restrictive of two limit sets, per ceiling. A bounded ceiling
    /// always beats an unbounded one.
    pub fn stricter(self, other: RateLimits) -> RateLimits {
        let a = RateLimits::new(self.rpm, self.tpm);
        let b = RateLimits::new(other.rpm, other.tpm);
        RateLimits {
            rpm: min_bound(a.rpm, b.rpm),
            tpm: min_bound(a.tpm, b.tpm),
        }
    }
}

fn min_bound<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

// ── Limiter ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Windows {
    limits: RateLimits,
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
    token_sum: u64,
}

impl Windows {
    fn prune(&mut self, now: Instant) {
        while let Some(&t) = self.requests.front() {
            if now.duration_since(t) >= WINDOW {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some(&(t, n)) = self.tokens.front() {
            if now.duration_since(t) >= WINDOW {
                self.tokens.pop_front();
                self.token_sum = self.token_sum.saturating_sub(n);
            } else {
                break;
            }
        }
    }

    /// How long until the oldest entry of a saturated window ages out, or
    /// `None` when a request can be admitted now.
    fn admission_wait(&self, now: Instant) -> Option<Duration> {
        let until_expiry = |t: Instant| (t + WINDOW).saturating_duration_since(now);

        let request_wait = match (self.limits.rpm.filter(|&r| r > 0), self.requests.front()) {
            (Some(rpm), Some(&oldest)) if self.requests.len() >= rpm as usize => {
                Some(until_expiry(oldest))
            }
            _ => None,
        };
        let token_wait = match (self.limits.tpm.filter(|&t| t > 0), self.tokens.front()) {
            (Some(tpm), Some(&(oldest, _))) if self.token_sum >= tpm => Some(until_expiry(oldest)),
            _ => None,
        };

        match (request_wait, token_wait) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Point-in-time copy of a limiter's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterSnapshot {
    pub model: String,
    pub limits: RateLimits,
    pub requests_in_window: usize,
    pub tokens_in_window: u64,
}

/// Request and token throttle for one model.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    model: String,
    windows: Mutex<Windows>,
}

impl SlidingWindowLimiter {
    pub fn new(model: impl Into<String>, limits: RateLimits) -> Self {
        Self {
            model: model.into(),
            windows: Mutex::new(Windows {
                limits: RateLimits::new(limits.rpm, limits.tpm),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn limits(&self) -> RateLimits {
        self.lock().limits
    }

    /// Replace the limits with the stricter of the current and `limits`.
    /// Never relaxes an existing ceiling.
    pub fn tighten(&self, limits: RateLimits) {
        let mut w = self.lock();
        let next = w.limits.stricter(limits);
        if next != w.limits {
            debug!(
                "Rate limits for {} tightened: {:?} -> {:?}",
                self.model, w.limits, next
            );
            w.limits = next;
        }
    }

    /// Wait until a request may be sent, then record it.
    ///
    /// Suspends without holding the lock, so concurrent callers interleave.
    /// Returns the total time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut w = self.lock();
                let now = Instant::now();
                w.prune(now);
                match w.admission_wait(now) {
                    None => {
                        w.requests.push_back(now);
                        return waited;
                    }
                    Some(wait) => wait,
                }
            };
            debug!(
                "Rate limit reached for {}; waiting {:.1}s",
                self.model,
                wait.as_secs_f64()
            );
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Record token usage observed after a request completed.
    pub fn record_tokens(&self, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let mut w = self.lock();
        let now = Instant::now();
        w.prune(now);
        w.tokens.push_back((now, tokens));
        w.token_sum += tokens;
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let mut w = self.lock();
        w.prune(Instant::now());
        LimiterSnapshot {
            model: self.model.clone(),
            limits: w.limits,
            requests_in_window: w.requests.len(),
            tokens_in_window: w.token_sum,
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────

static GLOBAL: LazyLock<Arc<RateLimiterRegistry>> =
    LazyLock::new(|| Arc::new(RateLimiterRegistry::new()));

/// Per-model limiter registry, guarded by one mutex.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<SlidingWindowLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<RateLimiterRegistry> {
        Arc::clone(&GLOBAL)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SlidingWindowLimiter>>> {
        self.limiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get or create the limiter for `model`. Re-registering an existing
    /// model keeps the shared instance and applies the stricter limits.
    pub fn register(&self, model: &str, limits: RateLimits) -> Arc<SlidingWindowLimiter> {
        let mut map = self.lock();
        match map.get(model) {
            Some(existing) => {
                existing.tighten(limits);
                Arc::clone(existing)
            }
            None => {
                info!("Registering rate limiter for {model}: {limits:?}");
                let limiter = Arc::new(SlidingWindowLimiter::new(model, limits));
                map.insert(model.to_string(), Arc::clone(&limiter));
                limiter
            }
        }
    }

    pub fn get(&self, model: &str) -> Option<Arc<SlidingWindowLimiter>> {
        self.lock().get(model).cloned()
    }

    /// Copy of every limiter's state, ordered by model.
    pub fn snapshot(&self) -> Vec<LimiterSnapshot> {
        let limiters: Vec<_> = self.lock().values().cloned().collect();
        let mut snaps: Vec<_> = limiters.iter().map(|l| l.snapshot()).collect();
        snaps.sort_by(|a, b| a.model.cmp(&b.model));
        snaps
    }

    /// Drop every limiter. Intended for isolating sessions and tests.
    pub fn reset(&self) {
        self.lock().clear();
    }
}
