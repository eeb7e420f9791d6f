//! Token-bucket limiter state machine
//!
//! A [`Bucket`] admits units of work under three simultaneous constraints:
//!
//! - at most `max_concurrent` jobs in flight,
//! - a reservoir of tokens, one consumed per admission, refilled by
//!   `refill_amount` every `refill_interval` on a wall-clock schedule,
//! - at least `min_spacing` between two dispatches.
//!
//! Work that cannot be admitted waits in a strict FIFO queue. The bucket never
//! runs anything itself: it hands admitted waiters back to the caller, which
//! is responsible for running the job and calling [`Bucket::release`] when it
//! settles. Time is always passed in, so the state machine is fully
//! deterministic.

use super::policy::Policy;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A party waiting for admission
///
/// Implementors report when they have given up (for example because the
/// caller timed out), so the bucket can skip them without spending budget.
pub trait Waiter {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Why the queue head cannot be admitted right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// `max_concurrent` jobs are in flight
    Concurrency,
    /// The reservoir is empty until the next refill tick
    Reservoir,
    /// The previous dispatch was too recent; carries the remaining wait
    Spacing(Duration),
}

/// Outcome of [`Bucket::submit`]
#[derive(Debug)]
pub enum Submission<W> {
    /// Admitted immediately; the waiter is handed back to run its job
    Admitted(W),
    /// Appended to the queue
    Queued {
        /// 1-based position in the queue
        position: usize,
        /// Best estimate of when the head may be admitted, if known
        retry_after: Option<Duration>,
    },
}

/// Read-only snapshot of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketStatus {
    /// Jobs currently in flight
    pub running: u32,
    /// Live waiters in the queue
    pub queued: usize,
    /// Tokens left, including any refill already due
    pub reservoir: u32,
}

/// Runtime limiter bound to one policy
pub struct Bucket<W> {
    policy: Policy,
    reservoir: u32,
    in_flight: u32,
    queue: VecDeque<W>,
    last_dispatch: Option<Instant>,
    previous_dispatch: Option<Instant>,
    next_refill: Instant,
}

impl<W: Waiter> Bucket<W> {
    /// Create a bucket with a full reservoir; the first refill tick is one
    /// `refill_interval` after `now`.
    pub fn new(policy: Policy, now: Instant) -> Self {
        Bucket {
            policy,
            reservoir: policy.reservoir_capacity,
            in_flight: 0,
            queue: VecDeque::new(),
            last_dispatch: None,
            previous_dispatch: None,
            next_refill: advance(now, policy.refill_interval),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Jobs currently in flight
    pub fn running(&self) -> u32 {
        self.in_flight
    }

    /// Tokens left as of the last refill evaluation
    pub fn reservoir(&self) -> u32 {
        self.reservoir
    }

    /// Live waiters in the queue
    pub fn queued(&self) -> usize {
        self.queue.iter().filter(|w| !w.is_cancelled()).count()
    }

    /// Check the three admission conditions, ignoring the queue
    pub fn check(&self, now: Instant) -> Result<(), Blocked> {
        if self.in_flight >= self.policy.max_concurrent {
            return Err(Blocked::Concurrency);
        }
        if self.reservoir == 0 {
            return Err(Blocked::Reservoir);
        }
        if let Some(last) = self.last_dispatch {
            let since = now.saturating_duration_since(last);
            if since < self.policy.min_spacing {
                return Err(Blocked::Spacing(self.policy.min_spacing - since));
            }
        }
        Ok(())
    }

    /// Admit `waiter` now, or queue it behind everyone already waiting
    ///
    /// A waiter never overtakes the queue: even when the budget allows an
    /// admission, a non-empty queue means the newcomer goes to the tail.
    pub fn submit(&mut self, waiter: W, now: Instant) -> Submission<W> {
        self.refill(now);
        self.drop_cancelled_head();

        if self.queue.is_empty() && self.check(now).is_ok() {
            self.dispatch(now);
            return Submission::Admitted(waiter);
        }

        self.queue.push_back(waiter);
        Submission::Queued {
            position: self.queue.len(),
            retry_after: self.retry_after(now),
        }
    }

    /// Admit queued waiters, in order, for as long as the head is admissible
    pub fn admit_ready(&mut self, now: Instant) -> Vec<W> {
        self.refill(now);

        let mut admitted = Vec::new();
        loop {
            self.drop_cancelled_head();
            if self.queue.is_empty() || self.check(now).is_err() {
                break;
            }
            if let Some(waiter) = self.queue.pop_front() {
                self.dispatch(now);
                admitted.push(waiter);
            }
        }
        admitted
    }

    /// A running job settled; free its slot
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Undo the admission made at `admitted_at` for a job that never ran
    ///
    /// The token and the slot are refunded. If no other dispatch happened
    /// since, the spacing window is rolled back as well.
    pub fn revoke(&mut self, admitted_at: Instant) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.reservoir = (self.reservoir + 1).min(self.policy.reservoir_capacity);
        if self.last_dispatch == Some(admitted_at) {
            self.last_dispatch = self.previous_dispatch.take();
        }
    }

    /// Apply every refill tick that is due at `now`
    ///
    /// Returns the number of ticks applied. The reservoir never exceeds its
    /// capacity, however many ticks elapsed.
    pub fn refill(&mut self, now: Instant) -> u32 {
        if now < self.next_refill {
            return 0;
        }

        let ticks = self.due_ticks(now);
        let added = u64::from(self.policy.refill_amount) * u64::from(ticks);
        let level = u64::from(self.reservoir) + added;
        self.reservoir = level.min(u64::from(self.policy.reservoir_capacity)) as u32;
        self.next_refill = advance(
            self.next_refill,
            self.policy.refill_interval.saturating_mul(ticks),
        );
        ticks
    }

    /// Earliest instant at which the queue head could become admissible
    ///
    /// Returns `None` when nobody waits, or when the head only waits for a
    /// running job to settle (its release is the wakeup).
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        if self.queued() == 0 {
            return None;
        }
        if now >= self.next_refill && self.reservoir < self.policy.reservoir_capacity {
            return Some(now);
        }
        match self.check(now) {
            Ok(()) => Some(now),
            Err(Blocked::Concurrency) => None,
            Err(Blocked::Reservoir) => Some(self.next_refill),
            Err(Blocked::Spacing(wait)) => Some(advance(now, wait)),
        }
    }

    /// Nothing running and nobody waiting
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.queued() == 0
    }

    /// Idle, with a full reservoir and no spacing debt
    ///
    /// Dropping a settled bucket loses nothing: a fresh one would make the
    /// exact same admission decisions.
    pub fn is_settled(&self, now: Instant) -> bool {
        let spacing_elapsed = self
            .last_dispatch
            .is_none_or(|last| now.saturating_duration_since(last) >= self.policy.min_spacing);
        self.is_idle()
            && self.reservoir_at(now) >= self.policy.reservoir_capacity
            && spacing_elapsed
    }

    /// Snapshot for observability; never mutates state
    pub fn status(&self, now: Instant) -> BucketStatus {
        BucketStatus {
            running: self.in_flight,
            queued: self.queued(),
            reservoir: self.reservoir_at(now),
        }
    }

    fn reservoir_at(&self, now: Instant) -> u32 {
        if now < self.next_refill {
            return self.reservoir;
        }
        let added = u64::from(self.policy.refill_amount) * u64::from(self.due_ticks(now));
        (u64::from(self.reservoir) + added).min(u64::from(self.policy.reservoir_capacity)) as u32
    }

    fn due_ticks(&self, now: Instant) -> u32 {
        let interval = self.policy.refill_interval.as_nanos().max(1);
        let overdue = now.saturating_duration_since(self.next_refill).as_nanos();
        u32::try_from(overdue / interval + 1).unwrap_or(u32::MAX)
    }

    fn retry_after(&self, now: Instant) -> Option<Duration> {
        self.next_wakeup(now)
            .map(|at| at.saturating_duration_since(now))
    }

    fn dispatch(&mut self, now: Instant) {
        self.reservoir -= 1;
        self.in_flight += 1;
        self.previous_dispatch = self.last_dispatch.replace(now);
    }

    fn drop_cancelled_head(&mut self) {
        while self.queue.front().is_some_and(|w| w.is_cancelled()) {
            self.queue.pop_front();
        }
    }
}

fn advance(at: Instant, by: Duration) -> Instant {
    at.checked_add(by).unwrap_or(at)
}
