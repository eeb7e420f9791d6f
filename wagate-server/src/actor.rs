//! Limiter actor
//!
//! A single task owns the [`LimiterRegistry`]; everything else talks to it
//! through a [`LimiterHandle`]. Serializing every lookup, admission, release
//! and sweep through one task means a limiter can never be reaped while a
//! request is being admitted on it.
//!
//! An admitted request receives a [`Permit`]. Dropping the permit frees the
//! concurrency slot, so a job that fails, panics or is cancelled still
//! releases its limiter. A permit whose job never started can be handed back
//! with [`Permit::refund`] instead.

use crate::config::SchedulerConfig;
use crate::events::EventBus;
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use wagate::{
    BucketStatus, LimiterKey, LimiterRegistry, PolicyTable, ReapPolicy, Submission, ThrottleError,
    Waiter,
};

/// Message types for the limiter actor
pub enum LimiterMessage {
    Acquire {
        key: LimiterKey,
        response_tx: oneshot::Sender<Permit>,
    },
    Status {
        keys: Vec<LimiterKey>,
        response_tx: oneshot::Sender<Vec<Option<BucketStatus>>>,
    },
    Reap {
        response_tx: oneshot::Sender<usize>,
    },
    Count {
        response_tx: oneshot::Sender<usize>,
    },
}

/// How a permit goes back to its limiter
#[derive(Debug)]
enum Settlement {
    /// The job ran; free the slot
    Release(LimiterKey),
    /// The job never ran; refund the slot and the token
    Refund {
        key: LimiterKey,
        admitted_at: std::time::Instant,
    },
}

/// Admission of one job on one limiter
///
/// Dropping the permit releases the slot.
#[must_use = "the slot is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct Permit {
    key: LimiterKey,
    admitted_at: std::time::Instant,
    settle_tx: mpsc::UnboundedSender<Settlement>,
    armed: bool,
}

impl Permit {
    pub fn key(&self) -> &LimiterKey {
        &self.key
    }

    /// Hand the admission back unused: the token is returned to the
    /// reservoir along with the slot
    pub fn refund(mut self) {
        self.armed = false;
        let _ = self.settle_tx.send(Settlement::Refund {
            key: self.key.clone(),
            admitted_at: self.admitted_at,
        });
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.armed {
            // Ignore send errors - the actor is gone and so is its bucket
            let _ = self.settle_tx.send(Settlement::Release(self.key.clone()));
        }
    }
}

/// A caller waiting for admission
struct PendingAcquire {
    response_tx: oneshot::Sender<Permit>,
}

impl Waiter for PendingAcquire {
    fn is_cancelled(&self) -> bool {
        self.response_tx.is_closed()
    }
}

/// Handle to communicate with the limiter actor
#[derive(Clone)]
pub struct LimiterHandle {
    tx: mpsc::Sender<LimiterMessage>,
    policies: Arc<PolicyTable>,
    queue_timeout: Option<Duration>,
    events: EventBus,
}

impl LimiterHandle {
    /// Wait for admission on `key`
    ///
    /// # Errors
    ///
    /// - [`ThrottleError::QueueTimeout`] if a queue timeout is configured and
    ///   admission takes longer. An `error` event is published as well.
    /// - [`ThrottleError::Shutdown`] if the actor is gone.
    pub async fn acquire(&self, key: LimiterKey) -> Result<Permit, ThrottleError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(LimiterMessage::Acquire {
                key: key.clone(),
                response_tx,
            })
            .await
            .map_err(|_| ThrottleError::Shutdown)?;

        let Some(limit) = self.queue_timeout else {
            return response_rx.await.map_err(|_| ThrottleError::Shutdown);
        };

        match tokio::time::timeout(limit, response_rx).await {
            Ok(permit) => permit.map_err(|_| ThrottleError::Shutdown),
            Err(_) => {
                // Dropping the receiver marks the waiter as cancelled
                let error = ThrottleError::QueueTimeout {
                    key: key.clone(),
                    waited: limit,
                };
                tracing::warn!("{}", error);
                self.events
                    .emit_error(&error, &format!("rate_limiter:{key}"));
                Err(error)
            }
        }
    }

    /// Snapshot the given limiters; `None` for limiters that do not exist
    pub async fn status(
        &self,
        keys: Vec<LimiterKey>,
    ) -> Result<Vec<Option<BucketStatus>>, ThrottleError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(LimiterMessage::Status { keys, response_tx })
            .await
            .map_err(|_| ThrottleError::Shutdown)?;
        response_rx.await.map_err(|_| ThrottleError::Shutdown)
    }

    /// Run an idle sweep now; returns how many limiters were removed
    pub async fn reap(&self) -> Result<usize, ThrottleError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(LimiterMessage::Reap { response_tx })
            .await
            .map_err(|_| ThrottleError::Shutdown)?;
        response_rx.await.map_err(|_| ThrottleError::Shutdown)
    }

    /// Number of limiters currently held
    pub async fn limiter_count(&self) -> Result<usize, ThrottleError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(LimiterMessage::Count { response_tx })
            .await
            .map_err(|_| ThrottleError::Shutdown)?;
        response_rx.await.map_err(|_| ThrottleError::Shutdown)
    }

    /// Policies new limiters are built from
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }
}

/// The limiter actor
pub struct LimiterActor;

impl LimiterActor {
    /// Spawn the actor on the current tokio runtime
    pub fn spawn(config: &SchedulerConfig, events: EventBus, metrics: Arc<Metrics>) -> LimiterHandle {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();

        let state = ActorState {
            registry: LimiterRegistry::new(config.policies.clone()),
            settle_tx,
            events: events.clone(),
            metrics,
            reap_policy: config.reap_policy,
        };
        let reap_interval = config.reap_interval;

        tokio::spawn(async move {
            run_actor(rx, settle_rx, state, reap_interval).await;
        });

        LimiterHandle {
            tx,
            policies: Arc::new(config.policies.clone()),
            queue_timeout: config.queue_timeout,
            events,
        }
    }
}

struct ActorState {
    registry: LimiterRegistry<PendingAcquire>,
    settle_tx: mpsc::UnboundedSender<Settlement>,
    events: EventBus,
    metrics: Arc<Metrics>,
    reap_policy: ReapPolicy,
}

async fn run_actor(
    mut rx: mpsc::Receiver<LimiterMessage>,
    mut settle_rx: mpsc::UnboundedReceiver<Settlement>,
    mut state: ActorState,
    reap_interval: Duration,
) {
    let mut reaper = tokio::time::interval_at(Instant::now() + reap_interval, reap_interval);
    reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let wakeup = state.registry.next_wakeup(now());

        // Releases go first so a freed slot is visible to the next command
        tokio::select! {
            biased;
            Some(settlement) = settle_rx.recv() => state.settle(settlement),
            msg = rx.recv() => match msg {
                Some(msg) => state.handle(msg),
                None => break,
            },
            _ = sleep_until(wakeup) => {}
            _ = reaper.tick() => {
                state.reap();
            }
        }

        state.admit_ready();
    }

    tracing::info!("Limiter actor shutting down");
}

async fn sleep_until(wakeup: Option<std::time::Instant>) {
    match wakeup {
        Some(at) => tokio::time::sleep_until(Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Current time on the tokio clock, so paused test time drives the buckets
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl ActorState {
    fn handle(&mut self, msg: LimiterMessage) {
        match msg {
            LimiterMessage::Acquire { key, response_tx } => {
                let created = !self.registry.contains(&key);
                if created {
                    tracing::debug!("Creating limiter {}", key);
                }
                let at = now();
                let pending = PendingAcquire { response_tx };
                match self.registry.submit(&key, pending, at) {
                    Submission::Admitted(pending) => self.grant(key, pending, at),
                    Submission::Queued {
                        position,
                        retry_after,
                    } => {
                        let retry_after = retry_after.unwrap_or_default();
                        tracing::debug!(
                            "Request queued on {} at position {}, retry after {:?}",
                            key,
                            position,
                            retry_after
                        );
                        self.events
                            .emit_rate_limit_hit(&key.to_string(), retry_after);
                    }
                }
                if created {
                    self.metrics.update_active_limiters(self.registry.len());
                }
            }
            LimiterMessage::Status { keys, response_tx } => {
                let at = now();
                let snapshot = keys
                    .iter()
                    .map(|key| self.registry.status(key, at))
                    .collect();
                let _ = response_tx.send(snapshot);
            }
            LimiterMessage::Reap { response_tx } => {
                let removed = self.reap();
                let _ = response_tx.send(removed);
            }
            LimiterMessage::Count { response_tx } => {
                let _ = response_tx.send(self.registry.len());
            }
        }
    }

    fn settle(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Release(key) => self.registry.release(&key),
            Settlement::Refund { key, admitted_at } => {
                tracing::debug!("Refunding unused admission on {}", key);
                self.registry.revoke(&key, admitted_at);
            }
        }
    }

    fn admit_ready(&mut self) {
        let at = now();
        for (key, pending) in self.registry.admit_ready(at) {
            self.grant(key, pending, at);
        }
    }

    /// Hand a permit to an admitted caller, refunding it if the caller left
    fn grant(&mut self, key: LimiterKey, pending: PendingAcquire, admitted_at: std::time::Instant) {
        let permit = Permit {
            key: key.clone(),
            admitted_at,
            settle_tx: self.settle_tx.clone(),
            armed: true,
        };
        if let Err(permit) = pending.response_tx.send(permit) {
            permit.disarm();
            self.registry.revoke(&key, admitted_at);
            tracing::debug!("Caller on {} left before admission", key);
        }
    }

    fn reap(&mut self) -> usize {
        let removed = self.registry.reap(self.reap_policy, now());
        if removed > 0 {
            tracing::info!(
                "Reaped {} idle limiters, {} remaining",
                removed,
                self.registry.len()
            );
            self.metrics.record_reaped(removed);
        }
        self.metrics.update_active_limiters(self.registry.len());
        removed
    }
}
