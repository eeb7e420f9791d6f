//! Scheduling façade
//!
//! Outbound traffic passes two limiters: one for the resource it targets
//! (a phone number's messaging or template quota, or an API scope) and the
//! account-wide `global:global` limiter. Admission takes the global slot
//! first and the resource slot second; both are released when the job
//! settles, resource first.
//!
//! Jobs are plain futures. Rust futures do nothing until polled, so a job
//! never starts before both admissions are granted.

use crate::actor::LimiterHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use wagate::{Category, GLOBAL_SCOPE, LimiterKey, ThrottleError};

/// Identifier used by webhook and event limiters when none is given
pub const DEFAULT_IDENTIFIER: &str = "default";

/// Snapshot of one limiter as seen by [`Scheduler::rate_limit_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStatus {
    pub running: u32,
    pub queued: usize,
    pub reservoir: u32,
    /// False when the limiter does not exist (never used, or reaped)
    pub active: bool,
}

/// Per-category limiter state for one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub scope: String,
    pub categories: BTreeMap<String, CategoryStatus>,
}

impl RateLimitStatus {
    pub fn get(&self, category: Category) -> Option<&CategoryStatus> {
        self.categories.get(category.as_str())
    }
}

#[derive(Clone)]
pub struct Scheduler {
    limiter: LimiterHandle,
}

impl Scheduler {
    pub fn new(limiter: LimiterHandle) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &LimiterHandle {
        &self.limiter
    }

    /// Run `job` once the phone number's messaging (or template) limiter
    /// and the global limiter both admit it
    pub async fn schedule_message<F>(
        &self,
        phone_number_id: &str,
        job: F,
        is_template: bool,
    ) -> Result<F::Output, ThrottleError>
    where
        F: Future,
    {
        let category = if is_template {
            Category::Templates
        } else {
            Category::Messaging
        };
        self.run_chained(LimiterKey::new(phone_number_id, category), job)
            .await
    }

    /// Run `job` under the API limiter of `scope` (default `"global"`) and
    /// the global limiter
    ///
    /// `endpoint` only labels the request in logs.
    pub async fn schedule_api_call<F>(
        &self,
        endpoint: &str,
        job: F,
        scope: Option<&str>,
    ) -> Result<F::Output, ThrottleError>
    where
        F: Future,
    {
        let key = LimiterKey::new(scope.unwrap_or(GLOBAL_SCOPE), Category::Api);
        tracing::trace!("Scheduling API call to {} on {}", endpoint, key);
        self.run_chained(key, job).await
    }

    /// Run `job` under the webhook limiter of `identifier`
    pub async fn schedule_webhook<F>(
        &self,
        job: F,
        identifier: Option<&str>,
    ) -> Result<F::Output, ThrottleError>
    where
        F: Future,
    {
        let key = LimiterKey::new(identifier.unwrap_or(DEFAULT_IDENTIFIER), Category::Webhook);
        let _permit = self.limiter.acquire(key).await?;
        Ok(job.await)
    }

    /// Run `job` under the event-processing limiter of `identifier`
    pub async fn schedule_event<F>(
        &self,
        job: F,
        identifier: Option<&str>,
    ) -> Result<F::Output, ThrottleError>
    where
        F: Future,
    {
        let key = LimiterKey::new(identifier.unwrap_or(DEFAULT_IDENTIFIER), Category::Events);
        let _permit = self.limiter.acquire(key).await?;
        Ok(job.await)
    }

    async fn run_chained<F>(&self, resource: LimiterKey, job: F) -> Result<F::Output, ThrottleError>
    where
        F: Future,
    {
        // Locals drop in reverse order: resource first, then global
        let global = self.limiter.acquire(LimiterKey::global()).await?;
        let _resource = match self.limiter.acquire(resource).await {
            Ok(permit) => permit,
            Err(error) => {
                // Nothing ran; hand the global token back
                global.refund();
                return Err(error);
            }
        };
        Ok(job.await)
    }

    /// Read-only view of every category's limiter for `scope`
    ///
    /// Messaging, templates and api are looked up under `scope` (default
    /// `"global"`), webhook and events under `scope` (default `"default"`),
    /// and the global category always reports the `global:global` limiter.
    /// Limiters that do not exist are reported idle with a full reservoir.
    pub async fn rate_limit_status(
        &self,
        scope: Option<&str>,
    ) -> Result<RateLimitStatus, ThrottleError> {
        let keys: Vec<LimiterKey> = Category::ALL
            .iter()
            .map(|&category| match category {
                Category::Global => LimiterKey::global(),
                Category::Webhook | Category::Events => {
                    LimiterKey::new(scope.unwrap_or(DEFAULT_IDENTIFIER), category)
                }
                _ => LimiterKey::new(scope.unwrap_or(GLOBAL_SCOPE), category),
            })
            .collect();

        let snapshot = self.limiter.status(keys.clone()).await?;

        let categories = keys
            .iter()
            .zip(snapshot)
            .map(|(key, status)| {
                let entry = match status {
                    Some(status) => CategoryStatus {
                        running: status.running,
                        queued: status.queued,
                        reservoir: status.reservoir,
                        active: true,
                    },
                    None => CategoryStatus {
                        running: 0,
                        queued: 0,
                        reservoir: self.limiter.policies().get(key.category).reservoir_capacity,
                        active: false,
                    },
                };
                (key.category.as_str().to_string(), entry)
            })
            .collect();

        Ok(RateLimitStatus {
            scope: scope.unwrap_or(GLOBAL_SCOPE).to_string(),
            categories,
        })
    }
}
