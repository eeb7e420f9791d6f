//! WhatsApp webhook payloads
//!
//! Only the parts the gateway republishes are typed; the rest of each
//! inbound message is kept as raw JSON.

use crate::events::EventBus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of a `POST /webhook` notification
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEntry {
    /// Business account id
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub statuses: Vec<StatusEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(default)]
    pub display_phone_number: Option<String>,
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    /// Every other field (`type`, `timestamp`, `text`, `image`, ...)
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusEntry {
    /// Id of the message the status refers to
    pub id: String,
    /// `sent`, `delivered`, `read` or `failed`
    pub status: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// What a notification contained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WebhookSummary {
    pub messages: usize,
    pub statuses: usize,
}

impl WebhookSummary {
    pub fn received(&self) -> usize {
        self.messages + self.statuses
    }
}

/// Publish one `message_received` per inbound message and one
/// `message_status_update` per status entry
pub fn publish(events: &EventBus, payload: &WebhookPayload) -> WebhookSummary {
    let mut summary = WebhookSummary::default();

    for change in payload.entry.iter().flat_map(|entry| &entry.changes) {
        let phone_number_id = change
            .value
            .metadata
            .as_ref()
            .map(|m| m.phone_number_id.as_str());

        for message in &change.value.messages {
            let mut body = message.rest.clone();
            body.insert("id".into(), Value::String(message.id.clone()));
            body.insert("from".into(), Value::String(message.from.clone()));
            events.emit_message_received(
                &message.id,
                &message.from,
                phone_number_id,
                Value::Object(body),
            );
            summary.messages += 1;
        }

        for status in &change.value.statuses {
            events.emit_status_update(
                &status.id,
                &status.status,
                status.recipient_id.as_deref(),
                phone_number_id,
            );
            summary.statuses += 1;
        }
    }

    tracing::debug!(
        "Webhook carried {} messages and {} statuses",
        summary.messages,
        summary.statuses
    );
    summary
}
