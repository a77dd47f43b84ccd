//! `vendorgate-core`: domain foundation for vendor job orchestration.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job record and its lifecycle, vendor descriptors and the
//! clock port used to keep time-dependent logic testable.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod vendor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, VendorId};
pub use job::{DispatchEligibility, FailureReason, Job, JobStatus, JobUpdate, StatusChange};
pub use vendor::{VendorConfig, VendorMode};
