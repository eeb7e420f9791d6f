use anyhow::Result;
use std::sync::Arc;
use wagate_server::actor::LimiterActor;
use wagate_server::client::{HttpApiTransport, WhatsAppClient};
use wagate_server::config::Config;
use wagate_server::events::{self, EventBus};
use wagate_server::metrics::Metrics;
use wagate_server::scheduler::Scheduler;
use wagate_server::transport::http::HttpTransport;
use wagate_server::transport::{AppState, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let config = Config::from_env_and_args()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("wagate={}", config.log_level).parse()?),
        )
        .init();

    let bus = EventBus::new(config.event_capacity);
    let metrics = Arc::new(Metrics::new());
    metrics.attach(&bus);
    events::log_events(&bus);

    let limiter = LimiterActor::spawn(&config.scheduler, bus.clone(), metrics.clone());
    let scheduler = Scheduler::new(limiter);

    let transport = HttpApiTransport::new(&config.whatsapp)?;
    let client = WhatsAppClient::new(
        Arc::new(transport),
        scheduler.clone(),
        bus.clone(),
        &config.whatsapp,
    );

    let state = AppState {
        scheduler,
        client,
        events: bus,
        metrics,
        verify_token: config.whatsapp.verify_token.clone(),
    };

    tracing::info!(
        "wagate started for phone number {} (reap policy: {}, reap interval: {:?})",
        config.whatsapp.phone_number_id,
        config.scheduler.reap_policy,
        config.scheduler.reap_interval
    );
    if let Some(timeout) = config.scheduler.queue_timeout {
        tracing::info!("Queued requests time out after {:?}", timeout);
    }

    let http = HttpTransport::new(&config.http.host, config.http.port)?;

    tokio::select! {
        result = http.start(state) => {
            if let Err(e) = &result {
                tracing::error!("HTTP transport failed: {}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    }
}
