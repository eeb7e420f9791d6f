//! Network surface of the gateway
//!
//! - [`http`]: REST endpoints for status, metrics, webhooks, outbound
//!   messages and a Server-Sent Events feed of bus events

pub mod http;

#[cfg(test)]
mod http_test;

use crate::client::WhatsAppClient;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Shared services handed to a transport
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub client: WhatsAppClient,
    pub events: EventBus,
    pub metrics: Arc<Metrics>,
    /// Expected `hub.verify_token` for webhook subscription; `None` rejects all
    pub verify_token: Option<String>,
}

/// Common interface for transport implementations
#[async_trait]
pub trait Transport {
    /// Bind, then serve requests until an error occurs or the server shuts down
    async fn start(self, state: AppState) -> Result<()>;
}
