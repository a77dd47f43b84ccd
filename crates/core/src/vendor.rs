//! Vendor descriptors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::VendorId;

/// How a vendor delivers its result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorMode {
    /// Result is the inline HTTP response
    Sync,
    /// Request is acknowledged; result arrives later via webhook
    Async,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Registered configuration of one vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorConfig {
    pub id: VendorId,
    pub mode: VendorMode,
    pub base_url: String,
    /// Endpoint path appended to `base_url` (e.g. `/process`)
    pub path: String,
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl VendorConfig {
    pub fn new(
        id: impl Into<VendorId>,
        mode: VendorMode,
        base_url: impl Into<String>,
        path: impl Into<String>,
        rate_limit_per_minute: u32,
    ) -> Self {
        Self {
            id: id.into(),
            mode,
            base_url: base_url.into(),
            path: path.into(),
            rate_limit_per_minute,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Synchronous vendor answering on `POST {base_url}/process`.
    pub fn sync(id: impl Into<VendorId>, base_url: impl Into<String>, rate_limit_per_minute: u32) -> Self {
        Self::new(id, VendorMode::Sync, base_url, "/process", rate_limit_per_minute)
    }

    /// Asynchronous vendor accepting on `POST {base_url}/submit`.
    pub fn asynchronous(
        id: impl Into<VendorId>,
        base_url: impl Into<String>,
        rate_limit_per_minute: u32,
    ) -> Self {
        Self::new(id, VendorMode::Async, base_url, "/submit", rate_limit_per_minute)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(DomainError::validation("vendor id must not be empty"));
        }
        if self.rate_limit_per_minute == 0 {
            return Err(DomainError::validation(format!(
                "vendor '{}' must allow at least one request per minute",
                self.id
            )));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(DomainError::validation(format!(
                "vendor '{}' base_url must be an http(s) URL",
                self.id
            )));
        }
        Ok(())
    }
}
