//! Core components of the wagate limiter library
//!
//! This module contains the fundamental building blocks:
//! - [`policy`]: Categories and their static limits
//! - [`bucket`]: The token-bucket admission state machine
//! - [`registry`]: Lazily populated limiters keyed by scope and category

pub mod bucket;
pub mod policy;
pub mod registry;

pub use bucket::{Blocked, Bucket, BucketStatus, Submission, Waiter};
pub use policy::{Category, Policy, PolicyTable};
pub use registry::{GLOBAL_SCOPE, LimiterKey, LimiterRegistry, ReapPolicy};

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Errors that can occur while scheduling work through a limiter
///
/// # Variants
///
/// - [`InvalidPolicy`](ThrottleError::InvalidPolicy): A policy or policy name was rejected
/// - [`QueueTimeout`](ThrottleError::QueueTimeout): A queued job was not admitted before its deadline
/// - [`Shutdown`](ThrottleError::Shutdown): The limiter owner stopped before answering
///
/// None of these ever wraps the error of a job itself: job outcomes are
/// returned to the caller untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    /// A policy or policy name was rejected
    InvalidPolicy(String),
    /// Admission did not happen within the configured deadline
    QueueTimeout { key: LimiterKey, waited: Duration },
    /// The limiter owner is gone
    Shutdown,
}

impl fmt::Display for ThrottleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleError::InvalidPolicy(msg) => write!(f, "invalid policy: {msg}"),
            ThrottleError::QueueTimeout { key, waited } => write!(
                f,
                "queued on limiter {key} for {}ms without admission",
                waited.as_millis()
            ),
            ThrottleError::Shutdown => write!(f, "rate limiter has shut down"),
        }
    }
}

impl Error for ThrottleError {}
