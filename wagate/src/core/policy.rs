//! Limiter categories and their static policies
//!
//! Every limiter is built from a [`Policy`]: a concurrency cap, a minimum
//! spacing between dispatches, and a reservoir that refills on a fixed
//! wall-clock schedule. The [`PolicyTable`] holds one policy per
//! [`Category`]; its default encodes the published WhatsApp Cloud API
//! per-number and per-account throughput ceilings.

use super::ThrottleError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Named policy class a limiter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Free-form outbound messages, scoped per phone number
    Messaging,
    /// Template messages, scoped per phone number
    Templates,
    /// Generic Graph API calls
    Api,
    /// Account-wide ceiling every outbound call must also clear
    Global,
    /// Inbound webhook processing
    Webhook,
    /// Event fan-out to live listeners
    Events,
}

impl Category {
    /// All categories, in table order
    pub const ALL: [Category; 6] = [
        Category::Messaging,
        Category::Templates,
        Category::Api,
        Category::Global,
        Category::Webhook,
        Category::Events,
    ];

    /// Lowercase name used in keys, logs and status reports
    pub const fn as_str(self) -> &'static str {
        match self {
            Category::Messaging => "messaging",
            Category::Templates => "templates",
            Category::Api => "api",
            Category::Global => "global",
            Category::Webhook => "webhook",
            Category::Events => "events",
        }
    }

    /// The reference policy for this category
    pub const fn default_policy(self) -> Policy {
        match self {
            Category::Messaging => Policy::new(5, Duration::from_secs(45), 80, 80, HOUR),
            Category::Templates => Policy::new(2, Duration::from_millis(345_600), 250, 250, DAY),
            Category::Api => Policy::new(10, Duration::from_secs(36), 100, 100, HOUR),
            Category::Global => Policy::new(20, Duration::from_millis(3_600), 1000, 1000, HOUR),
            Category::Webhook => Policy::new(10, Duration::from_millis(100), 1000, 1000, HOUR),
            Category::Events => Policy::new(50, Duration::from_millis(50), 2000, 2000, HOUR),
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "messaging" => Ok(Category::Messaging),
            "templates" => Ok(Category::Templates),
            "api" => Ok(Category::Api),
            "global" => Ok(Category::Global),
            "webhook" => Ok(Category::Webhook),
            "events" => Ok(Category::Events),
            _ => Err(ThrottleError::InvalidPolicy(format!(
                "unknown category: {s}. Valid options are: messaging, templates, api, global, webhook, events"
            ))),
        }
    }
}

/// Static limits for one category
///
/// A policy is never mutated once a limiter has been built from it.
///
/// # Example
///
/// ```
/// use wagate::{Category, Policy};
/// use std::time::Duration;
///
/// let messaging = Category::Messaging.default_policy();
/// assert_eq!(messaging.max_concurrent, 5);
///
/// // 10 calls per minute, one at a time, no spacing
/// let custom = Policy::new(1, Duration::ZERO, 10, 10, Duration::from_secs(60));
/// assert!(custom.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Maximum number of jobs in flight at once
    pub max_concurrent: u32,
    /// Minimum time between two dispatches
    pub min_spacing: Duration,
    /// Upper bound of the reservoir
    pub reservoir_capacity: u32,
    /// Tokens added on every refill tick (capped at capacity)
    pub refill_amount: u32,
    /// Period of the refill tick
    pub refill_interval: Duration,
}

impl Policy {
    pub const fn new(
        max_concurrent: u32,
        min_spacing: Duration,
        reservoir_capacity: u32,
        refill_amount: u32,
        refill_interval: Duration,
    ) -> Self {
        Policy {
            max_concurrent,
            min_spacing,
            reservoir_capacity,
            refill_amount,
            refill_interval,
        }
    }

    /// Check that a limiter built from this policy can ever admit work
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::InvalidPolicy`] when the concurrency cap,
    /// the reservoir capacity or the refill interval is zero.
    pub fn validate(&self) -> Result<(), ThrottleError> {
        if self.max_concurrent == 0 {
            return Err(ThrottleError::InvalidPolicy(
                "max_concurrent must be greater than zero".into(),
            ));
        }
        if self.reservoir_capacity == 0 {
            return Err(ThrottleError::InvalidPolicy(
                "reservoir capacity must be greater than zero".into(),
            ));
        }
        if self.refill_interval.is_zero() {
            return Err(ThrottleError::InvalidPolicy(
                "refill interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// One [`Policy`] per [`Category`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    policies: [Policy; 6],
}

impl PolicyTable {
    /// Policy used for limiters of `category`
    pub fn get(&self, category: Category) -> &Policy {
        &self.policies[category.index()]
    }

    /// Replace the policy of one category
    ///
    /// Limiters that already exist keep the policy they were built with;
    /// only limiters created afterwards pick up the new one.
    ///
    /// # Errors
    ///
    /// Rejects policies that fail [`Policy::validate`].
    pub fn set(&mut self, category: Category, policy: Policy) -> Result<(), ThrottleError> {
        policy.validate()?;
        self.policies[category.index()] = policy;
        Ok(())
    }

    /// Builder-style variant of [`set`](Self::set)
    pub fn with(mut self, category: Category, policy: Policy) -> Result<Self, ThrottleError> {
        self.set(category, policy)?;
        Ok(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &Policy)> {
        Category::ALL.iter().map(move |c| (*c, self.get(*c)))
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        PolicyTable {
            policies: Category::ALL.map(Category::default_policy),
        }
    }
}
