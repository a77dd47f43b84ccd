//! In-process sliding-window limiter.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vendorgate_core::{Clock, SystemClock, VendorConfig, VendorId};

use super::{Admission, DEFAULT_WINDOW, RateLimitError, RateLimiter};

/// Admission timestamps for one vendor.
#[derive(Debug)]
struct VendorWindow {
    limit: u32,
    admitted: VecDeque<DateTime<Utc>>,
}

impl VendorWindow {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            admitted: VecDeque::with_capacity(limit as usize),
        }
    }

    /// Drop admissions that are no longer inside `(now - window, now]`.
    fn expire(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if oldest + window <= now {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn admit(&mut self, now: DateTime<Utc>, window: chrono::Duration) -> Admission {
        self.expire(now, window);

        if (self.admitted.len() as u32) < self.limit {
            self.admitted.push_back(now);
            return Admission::Allowed {
                remaining: self.limit - self.admitted.len() as u32,
            };
        }

        let retry_after = self
            .admitted
            .front()
            .map(|oldest| (*oldest + window - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);

        Admission::Denied { retry_after }
    }
}

/// Sliding-window rate limiter shared by every caller in the process.
///
/// Each vendor has its own lock; the check and the record happen inside one
/// critical section, so concurrent callers for the same vendor cannot
/// over-admit and different vendors never contend.
pub struct SlidingWindowRateLimiter {
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
    vendors: RwLock<HashMap<VendorId, Arc<Mutex<VendorWindow>>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(60)),
            clock,
            vendors: RwLock::new(HashMap::new()),
        }
    }

    /// Build a limiter with one registration per vendor config.
    pub fn from_vendors<'a>(
        vendors: impl IntoIterator<Item = &'a VendorConfig>,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = Self::with_clock(window, clock);
        for v in vendors {
            limiter.register(v.id.clone(), v.rate_limit_per_minute);
        }
        limiter
    }

    /// Register (or re-configure) a vendor's per-window ceiling.
    ///
    /// Re-registering keeps the admissions already recorded.
    pub fn register(&self, vendor: VendorId, limit: u32) {
        let mut vendors = self.vendors.write().unwrap_or_else(|e| e.into_inner());
        match vendors.get(&vendor) {
            Some(existing) => {
                existing.lock().unwrap_or_else(|e| e.into_inner()).limit = limit;
            }
            None => {
                vendors.insert(vendor, Arc::new(Mutex::new(VendorWindow::new(limit))));
            }
        }
    }

    /// Admission check at an explicit instant.
    pub fn try_acquire_at(
        &self,
        vendor: &VendorId,
        now: DateTime<Utc>,
    ) -> Result<Admission, RateLimitError> {
        let slot = {
            let vendors = self.vendors.read().unwrap_or_else(|e| e.into_inner());
            vendors
                .get(vendor)
                .cloned()
                .ok_or_else(|| RateLimitError::UnknownVendor(vendor.clone()))?
        };

        let mut window = slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(window.admit(now, self.window))
    }

    /// Admissions currently counted against `vendor`'s window.
    pub fn in_window(&self, vendor: &VendorId) -> usize {
        let now = self.clock.now();
        let vendors = self.vendors.read().unwrap_or_else(|e| e.into_inner());
        vendors
            .get(vendor)
            .map(|slot| {
                let mut window = slot.lock().unwrap_or_else(|e| e.into_inner());
                window.expire(now, self.window);
                window.admitted.len()
            })
            .unwrap_or(0)
    }
}

impl Default for SlidingWindowRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn try_acquire(&self, vendor: &VendorId) -> Result<Admission, RateLimitError> {
        let now = self.clock.now();
        let admission = self.try_acquire_at(vendor, now)?;
        if let Admission::Denied { retry_after } = admission {
            tracing::debug!(
                vendor = %vendor,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limit window full"
            );
        }
        Ok(admission)
    }
}
