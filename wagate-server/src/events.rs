//! Event bus for WhatsApp API activity
//!
//! Every outbound call, message outcome, inbound webhook entry and limiter
//! hit is published as an [`Event`]. An event is delivered to:
//!
//! - synchronous listeners registered with [`EventBus::on`], invoked inline
//!   in [`EventBus::emit`], and
//! - async subscribers obtained from [`EventBus::subscribe`], fed through a
//!   `tokio::sync::broadcast` channel.
//!
//! Listeners pick either every event ([`Topic::All`], the `whatsapp_event`
//! channel) or a single kind ([`Topic::Kind`]).
//!
//! # Delivery
//!
//! Fan-out is in-process, at-most-once and best effort. Publishers never
//! wait for subscribers: a subscriber that falls more than the channel
//! capacity behind loses the oldest events. A listener that panics is
//! isolated; the remaining listeners still run and the panic is reported
//! as an `error` event to async subscribers.
//!
//! The bus is an explicitly constructed handle. Clone it into every
//! component that publishes or subscribes.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// Name of the channel carrying every event
pub const ALL_EVENTS_CHANNEL: &str = "whatsapp_event";

/// Listener count above which a warning is logged
const LISTENER_WARN_THRESHOLD: usize = 100;

/// Kind of an [`Event`], also the name of its dedicated channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageSent,
    MessageFailed,
    MessageReceived,
    MessageStatusUpdate,
    ApiCall,
    RateLimitHit,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::MessageSent,
        EventKind::MessageFailed,
        EventKind::MessageReceived,
        EventKind::MessageStatusUpdate,
        EventKind::ApiCall,
        EventKind::RateLimitHit,
        EventKind::Error,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::MessageSent => "message_sent",
            EventKind::MessageFailed => "message_failed",
            EventKind::MessageReceived => "message_received",
            EventKind::MessageStatusUpdate => "message_status_update",
            EventKind::ApiCall => "api_call",
            EventKind::RateLimitHit => "rate_limit_hit",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown event type: {s}"))
    }
}

/// Kind-specific data carried by an [`Event`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    MessageSent {
        message_id: String,
        phone_number_id: String,
        content: serde_json::Value,
    },
    MessageFailed {
        error: String,
        phone_number_id: String,
        content: serde_json::Value,
    },
    MessageReceived {
        message_id: String,
        from: String,
        message: serde_json::Value,
    },
    MessageStatusUpdate {
        message_id: String,
        status: String,
        recipient_id: Option<String>,
    },
    ApiCall {
        endpoint: String,
        method: String,
        response_time_ms: u64,
    },
    RateLimitHit {
        limiter_key: String,
        retry_after_ms: u64,
    },
    Error {
        error: String,
        context: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::MessageSent { .. } => EventKind::MessageSent,
            EventPayload::MessageFailed { .. } => EventKind::MessageFailed,
            EventPayload::MessageReceived { .. } => EventKind::MessageReceived,
            EventPayload::MessageStatusUpdate { .. } => EventKind::MessageStatusUpdate,
            EventPayload::ApiCall { .. } => EventKind::ApiCall,
            EventPayload::RateLimitHit { .. } => EventKind::RateLimitHit,
            EventPayload::Error { .. } => EventKind::Error,
        }
    }
}

/// One immutable activity record
///
/// # Example
///
/// ```json
/// {
///   "timestamp_ms": 1717000000000,
///   "scope_id": "106540352242922",
///   "correlation_id": "wamid.HBgLMTU1NTAwMDExMTEVAgARGBI",
///   "type": "message_sent",
///   "data": {
///     "message_id": "wamid.HBgLMTU1NTAwMDExMTEVAgARGBI",
///     "phone_number_id": "106540352242922",
///     "content": { "to": "15550001111", "type": "text" }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Phone number id the event concerns, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    /// Message id or session id tying related events together
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Event {
            timestamp_ms: now_ms(),
            scope_id: None,
            correlation_id: None,
            payload,
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Which events a listener receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Every event (the `whatsapp_event` channel)
    All,
    /// Only events of one kind
    Kind(EventKind),
}

impl Topic {
    pub fn matches(self, kind: EventKind) -> bool {
        match self {
            Topic::All => true,
            Topic::Kind(wanted) => wanted == kind,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Topic::All => ALL_EVENTS_CHANNEL,
            Topic::Kind(kind) => kind.as_str(),
        }
    }
}

impl FromStr for Topic {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == ALL_EVENTS_CHANNEL {
            return Ok(Topic::All);
        }
        s.parse().map(Topic::Kind)
    }
}

/// Synchronous event handler
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies a registered listener for [`EventBus::off`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    topic: Topic,
    handler: Handler,
}

struct BusInner {
    tx: broadcast::Sender<Event>,
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
}

/// Process-wide publish/subscribe handle
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose async subscribers may lag by up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus {
            inner: Arc::new(BusInner {
                tx,
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an event to every matching listener and subscriber
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        let mut failed = Vec::new();
        let mut reports = Vec::new();

        for (id, handler) in self.handlers_for(kind) {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                let message = panic_message(panic.as_ref());
                tracing::error!("Event listener panicked on {}: {}", kind, message);
                failed.push(id);
                reports.push(Event::new(EventPayload::Error {
                    error: message,
                    context: format!("event_listener:{kind}"),
                }));
            }
        }

        for report in reports {
            // Listeners that already failed are not handed their own report,
            // and a failure while reporting is only logged
            for (id, handler) in self.handlers_for(EventKind::Error) {
                if failed.contains(&id) {
                    continue;
                }
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&report))) {
                    tracing::error!(
                        "Event listener panicked on error report: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
            // Ignore send errors - nobody may be subscribed
            let _ = self.inner.tx.send(report);
        }

        let _ = self.inner.tx.send(event);
    }

    /// Snapshot of the handlers for `kind`, so they run outside the lock and
    /// may register or unregister listeners themselves
    fn handlers_for(&self, kind: EventKind) -> Vec<(ListenerId, Handler)> {
        self.inner
            .listeners
            .read()
            .iter()
            .filter(|listener| listener.topic.matches(kind))
            .map(|listener| (listener.id, listener.handler.clone()))
            .collect()
    }

    /// Register a synchronous listener
    pub fn on<F>(&self, topic: Topic, handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.inner.listeners.write();
        listeners.push(Listener {
            id,
            topic,
            handler: Arc::new(handler),
        });
        if listeners.len() == LISTENER_WARN_THRESHOLD + 1 {
            tracing::warn!(
                "More than {} event listeners registered; possible listener leak",
                LISTENER_WARN_THRESHOLD
            );
        }
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Open an async subscription; it sees events emitted from now on
    pub fn subscribe(&self, topic: Topic) -> EventStream {
        EventStream {
            topic,
            rx: self.inner.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    pub fn emit_api_call(&self, endpoint: &str, method: &str, response_time: Duration) {
        self.emit(Event::new(EventPayload::ApiCall {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            response_time_ms: response_time.as_millis() as u64,
        }));
    }

    pub fn emit_message_sent(
        &self,
        message_id: &str,
        phone_number_id: &str,
        content: &serde_json::Value,
    ) {
        self.emit(
            Event::new(EventPayload::MessageSent {
                message_id: message_id.to_string(),
                phone_number_id: phone_number_id.to_string(),
                content: content.clone(),
            })
            .with_scope(phone_number_id)
            .with_correlation(message_id),
        );
    }

    pub fn emit_message_failed(
        &self,
        error: &dyn fmt::Display,
        phone_number_id: &str,
        content: &serde_json::Value,
    ) {
        self.emit(
            Event::new(EventPayload::MessageFailed {
                error: error.to_string(),
                phone_number_id: phone_number_id.to_string(),
                content: content.clone(),
            })
            .with_scope(phone_number_id),
        );
    }

    pub fn emit_message_received(
        &self,
        message_id: &str,
        from: &str,
        phone_number_id: Option<&str>,
        message: serde_json::Value,
    ) {
        let mut event = Event::new(EventPayload::MessageReceived {
            message_id: message_id.to_string(),
            from: from.to_string(),
            message,
        })
        .with_correlation(message_id);
        event.scope_id = phone_number_id.map(str::to_string);
        self.emit(event);
    }

    pub fn emit_status_update(
        &self,
        message_id: &str,
        status: &str,
        recipient_id: Option<&str>,
        phone_number_id: Option<&str>,
    ) {
        let mut event = Event::new(EventPayload::MessageStatusUpdate {
            message_id: message_id.to_string(),
            status: status.to_string(),
            recipient_id: recipient_id.map(str::to_string),
        })
        .with_correlation(message_id);
        event.scope_id = phone_number_id.map(str::to_string);
        self.emit(event);
    }

    pub fn emit_rate_limit_hit(&self, limiter_key: &str, retry_after: Duration) {
        self.emit(Event::new(EventPayload::RateLimitHit {
            limiter_key: limiter_key.to_string(),
            retry_after_ms: retry_after.as_millis() as u64,
        }));
    }

    pub fn emit_error(&self, error: &dyn fmt::Display, context: &str) {
        self.emit(Event::new(EventPayload::Error {
            error: error.to_string(),
            context: context.to_string(),
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Async subscription to the bus
pub struct EventStream {
    topic: Topic,
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next matching event; `None` once the bus is gone
    ///
    /// Events dropped because this subscriber lagged are logged and skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.topic.matches(event.kind()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Subscriber on {} lagged, {} events dropped",
                        self.topic.name(),
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.topic.matches(event.kind()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Subscriber on {} lagged, {} events dropped",
                        self.topic.name(),
                        skipped
                    );
                }
                Err(_) => return None,
            }
        }
    }
}

/// Install a listener that mirrors every event into the trace log
pub fn log_events(bus: &EventBus) -> ListenerId {
    bus.on(Topic::All, |event| match &event.payload {
        EventPayload::Error { error, context } => {
            tracing::warn!("{} error: {}", context, error);
        }
        EventPayload::RateLimitHit {
            limiter_key,
            retry_after_ms,
        } => {
            tracing::debug!(
                "Rate limit hit on {}, retry after {}ms",
                limiter_key,
                retry_after_ms
            );
        }
        _ => tracing::debug!(kind = %event.kind(), "{:?}", event.payload),
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
