//! Redis-backed sliding-window limiter (optional).
//!
//! Admissions live in one sorted set per vendor, scored by admission time in
//! milliseconds. The expire/count/record sequence runs as a single Lua script
//! so concurrent processes sharing the Redis instance cannot over-admit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use vendorgate_core::{Clock, SystemClock, VendorConfig, VendorId};

use super::{Admission, DEFAULT_KEY_PREFIX, RateLimitError, RateLimiter};

const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, window)
  return {1, limit - count - 1}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local retry = 0
if oldest[2] then
  retry = tonumber(oldest[2]) + window - now
end
return {0, retry}
"#;

#[derive(Clone)]
pub struct RedisRateLimiter {
    client: redis::Client,
    script: Arc<redis::Script>,
    key_prefix: String,
    window: Duration,
    limits: Arc<HashMap<VendorId, u32>>,
    clock: Arc<dyn Clock>,
}

impl RedisRateLimiter {
    pub fn new<'a>(
        redis_url: impl AsRef<str>,
        vendors: impl IntoIterator<Item = &'a VendorConfig>,
        window: Duration,
    ) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;

        let limits = vendors
            .into_iter()
            .map(|v| (v.id.clone(), v.rate_limit_per_minute))
            .collect();

        Ok(Self {
            client,
            script: Arc::new(redis::Script::new(ACQUIRE_SCRIPT)),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            window,
            limits: Arc::new(limits),
            clock: Arc::new(SystemClock::new()),
        })
    }

    /// Separates deployments sharing one Redis instance.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, vendor: &VendorId) -> String {
        format!("{}:{}", self.key_prefix, vendor)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn try_acquire(&self, vendor: &VendorId) -> Result<Admission, RateLimitError> {
        let limit = *self
            .limits
            .get(vendor)
            .ok_or_else(|| RateLimitError::UnknownVendor(vendor.clone()))?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;

        let now_ms = self.clock.now().timestamp_millis();
        let member = format!("{now_ms}-{}", Uuid::now_v7());

        let (allowed, value): (i64, i64) = self
            .script
            .key(self.key(vendor))
            .arg(now_ms)
            .arg(self.window.as_millis() as i64)
            .arg(limit as i64)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;

        if allowed == 1 {
            Ok(Admission::Allowed {
                remaining: value.max(0) as u32,
            })
        } else {
            Ok(Admission::Denied {
                retry_after: Duration::from_millis(value.max(0) as u64),
            })
        }
    }
}
