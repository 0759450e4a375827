//! Model-facing plumbing shared by every engine run.
//!
//! - [`retry`]: exponential backoff with jitter for transient (rate-limited)
//!   failures. Everything else propagates immediately.
//! - [`rate_limit`]: per-model sliding-window limiter and the registry that
//!   shares limiters across concurrent runs.
//! - [`tracing`]: trace IDs and cumulative [`CostTracker`].

pub mod rate_limit;
pub mod retry;
pub mod tracing;

pub use rate_limit::{RateLimiterRegistry, RateLimits, SlidingWindowLimiter};
pub use retry::{RetryPolicy, with_retry};
pub use tracing::{CostTracker, ModelPricing, generate_trace_id};
