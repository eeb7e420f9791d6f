//! # wagate
//!
//! Token-bucket limiter state machine and registry used to shape traffic
//! towards the WhatsApp Cloud Business API.
//!
//! ## Overview
//!
//! Every outbound call is admitted by one or more [`Bucket`]s. A bucket
//! enforces, at the same time:
//! - **Concurrency**: at most `max_concurrent` jobs in flight
//! - **Reservoir**: a quota of admissions, refilled on a fixed wall-clock schedule
//! - **Spacing**: a minimum delay between two dispatches
//!
//! Work that cannot be admitted waits in a strict FIFO queue.
//!
//! This crate holds state only. It never spawns tasks or sleeps; the caller
//! passes the current [`Instant`](std::time::Instant) into every operation and
//! drives timers itself. `wagate-server` wraps it in an async actor.
//!
//! ## Quick Start
//!
//! ```
//! use wagate::{Category, LimiterKey, LimiterRegistry, PolicyTable, Submission, Waiter};
//! use std::time::{Duration, Instant};
//!
//! struct Job(&'static str);
//! impl Waiter for Job {}
//!
//! let mut registry = LimiterRegistry::new(PolicyTable::default());
//! let key = LimiterKey::new("15550001111", Category::Messaging);
//! let start = Instant::now();
//!
//! // The first message is admitted right away
//! assert!(matches!(registry.submit(&key, Job("hello"), start), Submission::Admitted(_)));
//!
//! // The second one has to respect the 45 second spacing
//! assert!(matches!(registry.submit(&key, Job("again"), start), Submission::Queued { .. }));
//! registry.release(&key);
//!
//! let admitted = registry.admit_ready(start + Duration::from_secs(45));
//! assert_eq!(admitted.len(), 1);
//! ```
//!
//! ## Categories
//!
//! | category | concurrency | spacing | reservoir | refill |
//! |---|---|---|---|---|
//! | messaging | 5 | 45s | 80 | 80 / 1h |
//! | templates | 2 | 345.6s | 250 | 250 / 24h |
//! | api | 10 | 36s | 100 | 100 / 1h |
//! | global | 20 | 3.6s | 1000 | 1000 / 1h |
//! | webhook | 10 | 100ms | 1000 | 1000 / 1h |
//! | events | 50 | 50ms | 2000 | 2000 / 1h |
//!
//! Override any of them through [`PolicyTable::set`].
//!
//! ## Thread Safety
//!
//! The registry is not thread-safe. Give it a single owner (an actor task)
//! or wrap it in a mutex.
//!
//! ## Features
//!
//! - `ahash` (default): Use AHash for faster hashing

pub mod core;

pub use core::{
    Blocked, Bucket, BucketStatus, Category, GLOBAL_SCOPE, LimiterKey, LimiterRegistry, Policy,
    PolicyTable, ReapPolicy, Submission, ThrottleError, Waiter,
};
