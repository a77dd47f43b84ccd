//! Per-vendor admission control.
//!
//! The orchestrator only sees the [`RateLimiter`] contract; the in-process
//! sliding window and the Redis-backed variant are interchangeable.

pub mod sliding_window;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use vendorgate_core::VendorId;

pub use sliding_window::SlidingWindowRateLimiter;
#[cfg(feature = "redis")]
pub use self::redis::RedisRateLimiter;

/// Default window length for per-minute limits.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Namespace for shared limiter state.
pub const DEFAULT_KEY_PREFIX: &str = "vendorgate:ratelimit";

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request admitted and recorded against the window.
    Allowed {
        /// Admissions still available in the current window.
        remaining: u32,
    },
    /// Window is full.
    Denied {
        /// When the oldest admission leaves the window.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("no rate limit registered for vendor '{0}'")]
    UnknownVendor(VendorId),

    #[error("rate limit backend error: {0}")]
    Backend(String),
}

/// Admission control keyed by vendor.
///
/// Implementations must never admit more than the vendor's configured
/// ceiling within any window, even under concurrent callers.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn try_acquire(&self, vendor: &VendorId) -> Result<Admission, RateLimitError>;
}

#[async_trait]
impl<R> RateLimiter for Arc<R>
where
    R: RateLimiter + ?Sized,
{
    async fn try_acquire(&self, vendor: &VendorId) -> Result<Admission, RateLimitError> {
        (**self).try_acquire(vendor).await
    }
}
