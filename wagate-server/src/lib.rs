//! # wagate server
//!
//! A rate-limited gateway in front of the WhatsApp Cloud Business API.
//!
//! ## Purpose
//!
//! The Cloud API enforces per-phone-number messaging quotas, template quotas
//! and account-wide ceilings. Exceeding them gets requests rejected and can
//! degrade the sender's quality rating. This crate shapes outbound traffic so
//! the ceilings are never crossed:
//!
//! - **Per-resource limiters** for each phone number's messaging and
//!   template traffic and for API scopes
//! - **A global limiter** shared by every outbound request
//! - **FIFO queuing** of work that cannot be admitted yet
//! - **An event bus** reporting every API call, message outcome, webhook
//!   entry and limiter hit
//!
//! ## Quick Start
//!
//! ```bash
//! # Show all available options
//! wagate --help
//!
//! # Start on port 3000 with default limits
//! wagate --access-token EAAG... --phone-number-id 106540352242922
//!
//! # Custom limits and strict reaping
//! wagate --policy-file limits.toml --reap-policy settled
//!
//! # List all available environment variables
//! wagate --list-env-vars
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  POST /messages     POST /webhook      library callers
//!        │                  │                   │
//!  ┌─────▼──────┐           │                   │
//!  │WhatsAppClnt│           │                   │
//!  └─────┬──────┘           │                   │
//!        └──────────┬───────┴───────────────────┘
//!             ┌─────▼─────┐
//!             │ Scheduler │  global slot, then resource slot
//!             └─────┬─────┘
//!             ┌─────▼─────┐        ┌──────────┐
//!             │   Actor   │───────▶│ EventBus │──▶ listeners, /events, metrics
//!             │ (registry)│        └──────────┘
//!             └───────────┘
//! ```
//!
//! One actor task owns every limiter, so creation, admission and reaping
//! never race. Callers wait on a oneshot channel until the actor admits
//! them, and release their slot by dropping the [`actor::Permit`].
//!
//! ## Using the library
//!
//! ```no_run
//! use std::sync::Arc;
//! use wagate_server::actor::LimiterActor;
//! use wagate_server::config::SchedulerConfig;
//! use wagate_server::events::{EventBus, EventKind, Topic};
//! use wagate_server::metrics::Metrics;
//! use wagate_server::scheduler::Scheduler;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let events = EventBus::new(1024);
//! events.on(Topic::Kind(EventKind::RateLimitHit), |event| {
//!     println!("throttled: {:?}", event.payload);
//! });
//!
//! let limiter = LimiterActor::spawn(&SchedulerConfig::default(), events.clone(), Arc::new(Metrics::new()));
//! let scheduler = Scheduler::new(limiter);
//!
//! let delivered = scheduler
//!     .schedule_message("106540352242922", async { "sent" }, false)
//!     .await?;
//! assert_eq!(delivered, "sent");
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod client;
pub mod config;
pub mod events;
pub mod metrics;
pub mod scheduler;
pub mod transport;
pub mod webhook;

#[cfg(test)]
mod actor_tests;
