//! Keyed collection of limiters
//!
//! Limiters are created lazily the first time a [`LimiterKey`] is seen and
//! dropped by [`LimiterRegistry::reap`] once they hold no work. The registry
//! is the only owner of its buckets; callers borrow them for the duration of
//! a single operation.

use super::ThrottleError;
use super::bucket::{Bucket, BucketStatus, Submission, Waiter};
use super::policy::{Category, PolicyTable};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

// Configuration constants
const DEFAULT_CAPACITY: usize = 64;

/// Scope shared by every untagged call and by the account-wide limiter
pub const GLOBAL_SCOPE: &str = "global";

/// Identity of one limiter: a scope (phone number id, endpoint, account id)
/// plus the category whose policy it enforces
///
/// Keys compare field by field, never as concatenated strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimiterKey {
    pub scope: String,
    pub category: Category,
}

impl LimiterKey {
    pub fn new(scope: impl Into<String>, category: Category) -> Self {
        LimiterKey {
            scope: scope.into(),
            category,
        }
    }

    /// The account-wide limiter every outbound call passes through
    pub fn global() -> Self {
        LimiterKey::new(GLOBAL_SCOPE, Category::Global)
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.category)
    }
}

/// Which limiters an idle sweep may drop
///
/// - **Idle**: nothing running and nobody queued. A limiter recreated later
///   starts with a full reservoir, so bursty traffic with idle gaps can
///   exceed the windowed ceiling.
/// - **Settled**: idle, and additionally holding a full reservoir with no
///   spacing debt, so removal never hands out extra budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReapPolicy {
    #[default]
    Idle,
    Settled,
}

impl FromStr for ReapPolicy {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(ReapPolicy::Idle),
            "settled" => Ok(ReapPolicy::Settled),
            _ => Err(ThrottleError::InvalidPolicy(format!(
                "invalid reap policy: {s}. Valid options are: idle, settled"
            ))),
        }
    }
}

impl fmt::Display for ReapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapPolicy::Idle => f.write_str("idle"),
            ReapPolicy::Settled => f.write_str("settled"),
        }
    }
}

/// Lazily populated map from [`LimiterKey`] to [`Bucket`]
///
/// # Example
///
/// ```
/// use wagate::{Category, LimiterKey, LimiterRegistry, PolicyTable, ReapPolicy, Submission, Waiter};
/// use std::time::Instant;
///
/// struct Caller;
/// impl Waiter for Caller {}
///
/// let mut registry: LimiterRegistry<Caller> = LimiterRegistry::new(PolicyTable::default());
/// let key = LimiterKey::new("1234567890", Category::Messaging);
/// let now = Instant::now();
///
/// assert!(matches!(registry.submit(&key, Caller, now), Submission::Admitted(_)));
/// registry.release(&key);
/// assert_eq!(registry.reap(ReapPolicy::Idle, now), 1);
/// ```
pub struct LimiterRegistry<W> {
    policies: PolicyTable,
    limiters: HashMap<LimiterKey, Bucket<W>>,
}

impl<W: Waiter> LimiterRegistry<W> {
    pub fn new(policies: PolicyTable) -> Self {
        Self::with_capacity(policies, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(policies: PolicyTable, capacity: usize) -> Self {
        LimiterRegistry {
            policies,
            limiters: HashMap::with_capacity(capacity),
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    pub fn contains(&self, key: &LimiterKey) -> bool {
        self.limiters.contains_key(key)
    }

    pub fn get(&self, key: &LimiterKey) -> Option<&Bucket<W>> {
        self.limiters.get(key)
    }

    /// Bucket for `key`, created from the category policy on first use
    pub fn bucket_mut(&mut self, key: &LimiterKey, now: Instant) -> &mut Bucket<W> {
        let policy = *self.policies.get(key.category);
        self.limiters
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(policy, now))
    }

    /// Submit a waiter to the limiter for `key`
    pub fn submit(&mut self, key: &LimiterKey, waiter: W, now: Instant) -> Submission<W> {
        self.bucket_mut(key, now).submit(waiter, now)
    }

    /// Free one slot of `key`; a no-op if the limiter no longer exists
    pub fn release(&mut self, key: &LimiterKey) {
        if let Some(bucket) = self.limiters.get_mut(key) {
            bucket.release();
        }
    }

    /// Undo the admission made on `key` at `admitted_at`
    pub fn revoke(&mut self, key: &LimiterKey, admitted_at: Instant) {
        if let Some(bucket) = self.limiters.get_mut(key) {
            bucket.revoke(admitted_at);
        }
    }

    /// Re-evaluate every queue, returning admitted waiters with their keys
    pub fn admit_ready(&mut self, now: Instant) -> Vec<(LimiterKey, W)> {
        let mut admitted = Vec::new();
        for (key, bucket) in self.limiters.iter_mut() {
            if bucket.queued() == 0 {
                continue;
            }
            admitted.extend(
                bucket
                    .admit_ready(now)
                    .into_iter()
                    .map(|waiter| (key.clone(), waiter)),
            );
        }
        admitted
    }

    /// Earliest instant at which any queue head could become admissible
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.limiters
            .values()
            .filter_map(|bucket| bucket.next_wakeup(now))
            .min()
    }

    /// Drop limiters the sweep policy allows, returning how many were removed
    pub fn reap(&mut self, policy: ReapPolicy, now: Instant) -> usize {
        let before = self.limiters.len();
        self.limiters.retain(|_, bucket| match policy {
            ReapPolicy::Idle => !bucket.is_idle(),
            ReapPolicy::Settled => !bucket.is_settled(now),
        });
        before - self.limiters.len()
    }

    /// Snapshot of one limiter, if it exists
    pub fn status(&self, key: &LimiterKey, now: Instant) -> Option<BucketStatus> {
        self.limiters.get(key).map(|bucket| bucket.status(now))
    }

    pub fn keys(&self) -> impl Iterator<Item = &LimiterKey> {
        self.limiters.keys()
    }
}
