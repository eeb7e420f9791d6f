//! Outbound WhatsApp Cloud API client
//!
//! [`WhatsAppClient`] routes every Graph API request through the
//! [`Scheduler`] and reports it on the [`EventBus`]:
//!
//! - exactly one `api_call` event per settled request, timed from dispatch
//!   (or, when admission timed out, the time spent waiting)
//! - an `error` event with context `api_request` for every failure
//! - for [`send_message`](WhatsAppClient::send_message), exactly one of
//!   `message_sent` or `message_failed`
//!
//! Failures are returned to the caller unchanged.
//!
//! The HTTP layer sits behind [`ApiTransport`] so tests can swap it out.

use crate::config::WhatsAppConfig;
use crate::events::EventBus;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use wagate::ThrottleError;

/// Errors returned by the client
#[derive(Error, Debug)]
pub enum ApiError {
    /// The Graph API answered with a non-success status
    #[error("WhatsApp API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Rate limiter error: {0}")]
    Throttle(#[from] ThrottleError),

    #[error("Invalid access token: {0}")]
    Credentials(#[from] reqwest::header::InvalidHeaderValue),

    #[error("No business account id configured")]
    MissingBusinessAccount,

    #[error("Business profile update has no fields set")]
    EmptyProfileUpdate,
}

/// How a registration code is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeMethod {
    Sms,
    Voice,
}

impl CodeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CodeMethod::Sms => "SMS",
            CodeMethod::Voice => "VOICE",
        }
    }
}

/// Fields of the business profile to change; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusinessProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websites: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
}

impl BusinessProfileUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// One Graph API request, relative to the versioned base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path starting with `/`, e.g. `/106540352242922/messages`
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
        }
    }

    /// Graph node the request targets: the first path segment
    pub fn node(&self) -> Option<&str> {
        self.path
            .trim_start_matches('/')
            .split(['/', '?'])
            .next()
            .filter(|segment| !segment.is_empty())
    }
}

/// Performs a single Graph API request
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn call(&self, request: &ApiRequest) -> Result<Value, ApiError>;
}

/// [`ApiTransport`] over HTTPS with a bearer token
pub struct HttpApiTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpApiTransport {
    pub fn new(config: &WhatsAppConfig) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let mut token = HeaderValue::from_str(&format!("Bearer {}", config.access_token))?;
        token.set_sensitive(true);
        headers.insert(AUTHORIZATION, token);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: format!(
                "{}/{}",
                config.base_url.trim_end_matches('/'),
                config.api_version
            ),
        })
    }
}

#[async_trait]
impl ApiTransport for HttpApiTransport {
    async fn call(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);
        let builder = match request.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Patch => self.http.patch(&url),
            Method::Delete => self.http.delete(&url),
        };
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Rate-limited, event-reporting Graph API client
#[derive(Clone)]
pub struct WhatsAppClient {
    transport: Arc<dyn ApiTransport>,
    scheduler: Scheduler,
    events: EventBus,
    phone_number_id: String,
    business_account_id: Option<String>,
}

impl WhatsAppClient {
    pub fn new(
        transport: Arc<dyn ApiTransport>,
        scheduler: Scheduler,
        events: EventBus,
        config: &WhatsAppConfig,
    ) -> Self {
        Self {
            transport,
            scheduler,
            events,
            phone_number_id: config.phone_number_id.clone(),
            business_account_id: config.business_account_id.clone(),
        }
    }

    pub fn phone_number_id(&self) -> &str {
        &self.phone_number_id
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.request(ApiRequest::new(Method::Get, path, None)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.request(ApiRequest::new(Method::Post, path, Some(body)))
            .await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.request(ApiRequest::new(Method::Patch, path, Some(body)))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.request(ApiRequest::new(Method::Delete, path, None))
            .await
    }

    /// Send any request under the API limiter of the node it targets
    pub async fn request(&self, request: ApiRequest) -> Result<Value, ApiError> {
        let started = Instant::now();
        let outcome = self
            .scheduler
            .schedule_api_call(&request.path, self.dispatch(&request), request.node())
            .await;
        self.settle(&request, outcome, started)
    }

    /// Send a message from the configured phone number
    ///
    /// `payload` is the Graph API message object. Template messages are
    /// admitted by the template limiter, everything else by the messaging
    /// limiter.
    pub async fn send_message(&self, payload: Value) -> Result<Value, ApiError> {
        let is_template = payload.get("type").and_then(Value::as_str) == Some("template");
        let request = ApiRequest::new(
            Method::Post,
            format!("/{}/messages", self.phone_number_id),
            Some(payload),
        );

        let started = Instant::now();
        let outcome = self
            .scheduler
            .schedule_message(&self.phone_number_id, self.dispatch(&request), is_template)
            .await;
        let result = self.settle(&request, outcome, started);

        let content = request.body.clone().unwrap_or_default();
        match &result {
            Ok(response) => {
                let message_id = response
                    .pointer("/messages/0/id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                tracing::info!("Message {} sent from {}", message_id, self.phone_number_id);
                self.events
                    .emit_message_sent(message_id, &self.phone_number_id, &content);
            }
            Err(error) => {
                self.events
                    .emit_message_failed(error, &self.phone_number_id, &content);
            }
        }
        result
    }

    pub async fn send_text(&self, to: &str, body: &str) -> Result<Value, ApiError> {
        self.send_message(json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": body },
        }))
        .await
    }

    pub async fn send_template(
        &self,
        to: &str,
        name: &str,
        language: &str,
        components: Option<Value>,
    ) -> Result<Value, ApiError> {
        let mut template = json!({ "name": name, "language": { "code": language } });
        if let Some(components) = components {
            template["components"] = components;
        }
        self.send_message(json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "template",
            "template": template,
        }))
        .await
    }

    /// Mark an inbound message as read
    pub async fn mark_as_read(&self, message_id: &str) -> Result<Value, ApiError> {
        let path = format!("/{}/messages", self.phone_number_id);
        self.post(
            &path,
            json!({
                "messaging_product": "whatsapp",
                "status": "read",
                "message_id": message_id,
            }),
        )
        .await
    }

    pub async fn business_profile(&self) -> Result<Value, ApiError> {
        let path = format!(
            "/{}/whatsapp_business_profile?fields=about,address,description,email,profile_picture_url,websites,vertical",
            self.phone_number_id
        );
        self.get(&path).await
    }

    /// Change the business profile of the configured phone number
    pub async fn update_business_profile(
        &self,
        update: &BusinessProfileUpdate,
    ) -> Result<Value, ApiError> {
        if update.is_empty() {
            return Err(ApiError::EmptyProfileUpdate);
        }
        let mut body = serde_json::to_value(update)?;
        body["messaging_product"] = json!("whatsapp");
        let path = format!("/{}/whatsapp_business_profile", self.phone_number_id);
        self.patch(&path, body).await
    }

    /// Phone numbers of the configured business account
    pub async fn phone_numbers(&self) -> Result<Value, ApiError> {
        let account = self.business_account()?;
        self.get(&format!("/{account}/phone_numbers")).await
    }

    pub async fn phone_number_details(&self) -> Result<Value, ApiError> {
        self.get(&format!("/{}", self.phone_number_id)).await
    }

    /// Register the configured phone number for Cloud API use
    pub async fn register_phone_number(
        &self,
        pin: &str,
        data_localization_region: Option<&str>,
    ) -> Result<Value, ApiError> {
        let mut body = json!({ "messaging_product": "whatsapp", "pin": pin });
        if let Some(region) = data_localization_region {
            body["data_localization_region"] = json!(region);
        }
        self.post(&format!("/{}/register", self.phone_number_id), body)
            .await
    }

    pub async fn deregister_phone_number(&self) -> Result<Value, ApiError> {
        self.post(
            &format!("/{}/deregister", self.phone_number_id),
            json!({ "messaging_product": "whatsapp" }),
        )
        .await
    }

    /// Ask Meta to send a verification code to the configured number
    pub async fn request_verification_code(
        &self,
        method: CodeMethod,
        locale: Option<&str>,
    ) -> Result<Value, ApiError> {
        self.post(
            &format!("/{}/request_code", self.phone_number_id),
            json!({
                "code_method": method.as_str(),
                "locale": locale.unwrap_or("en_US"),
            }),
        )
        .await
    }

    pub async fn verify_phone_number(&self, code: &str) -> Result<Value, ApiError> {
        self.post(
            &format!("/{}/verify", self.phone_number_id),
            json!({ "messaging_product": "whatsapp", "code": code }),
        )
        .await
    }

    pub async fn enable_two_step_verification(&self, pin: &str) -> Result<Value, ApiError> {
        self.post(
            &format!("/{}/two_step", self.phone_number_id),
            json!({ "pin": pin }),
        )
        .await
    }

    pub async fn disable_two_step_verification(&self) -> Result<Value, ApiError> {
        self.delete(&format!("/{}/two_step", self.phone_number_id))
            .await
    }

    /// Message templates of the configured business account
    pub async fn message_templates(&self) -> Result<Value, ApiError> {
        let account = self.business_account()?;
        self.get(&format!("/{account}/message_templates")).await
    }

    /// Daily sent/delivered counts between two unix timestamps
    pub async fn messaging_insights(&self, start: u64, end: u64) -> Result<Value, ApiError> {
        let account = self.business_account()?;
        self.get(&format!(
            "/{account}/insights?metric=messages_sent,messages_delivered&start={start}&end={end}&granularity=DAILY"
        ))
        .await
    }

    fn business_account(&self) -> Result<&str, ApiError> {
        self.business_account_id
            .as_deref()
            .ok_or(ApiError::MissingBusinessAccount)
    }

    async fn dispatch(&self, request: &ApiRequest) -> (Result<Value, ApiError>, Duration) {
        let started = Instant::now();
        let result = self.transport.call(request).await;
        (result, started.elapsed())
    }

    /// Publish the `api_call` and `error` events for a finished request
    fn settle(
        &self,
        request: &ApiRequest,
        outcome: Result<(Result<Value, ApiError>, Duration), ThrottleError>,
        started: Instant,
    ) -> Result<Value, ApiError> {
        let (result, elapsed) = match outcome {
            Ok(done) => done,
            Err(throttled) => (Err(ApiError::Throttle(throttled)), started.elapsed()),
        };

        self.events
            .emit_api_call(&request.path, request.method.as_str(), elapsed);

        if let Err(error) = &result {
            tracing::warn!(
                "{} {} failed: {}",
                request.method.as_str(),
                request.path,
                error
            );
            self.events.emit_error(error, "api_request");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_node() {
        let request = ApiRequest::new(Method::Post, "/106540352242922/messages", None);
        assert_eq!(request.node(), Some("106540352242922"));

        let request = ApiRequest::new(Method::Get, "/123?fields=about", None);
        assert_eq!(request.node(), Some("123"));

        let request = ApiRequest::new(Method::Get, "/", None);
        assert_eq!(request.node(), None);
    }

    #[test]
    fn test_status_error_keeps_upstream_body() {
        let body = r#"{"error":{"message":"Invalid parameter","code":100}}"#;
        let error = ApiError::Status {
            status: 400,
            body: body.to_string(),
        };
        assert_eq!(error.to_string(), format!("WhatsApp API returned 400: {body}"));
    }

    #[test]
    fn test_http_transport_base_url() {
        let config = WhatsAppConfig {
            base_url: "https://graph.facebook.com/".to_string(),
            api_version: "v21.0".to_string(),
            access_token: "token".to_string(),
            phone_number_id: "1".to_string(),
            business_account_id: None,
            verify_token: None,
        };
        let transport = HttpApiTransport::new(&config).unwrap();
        assert_eq!(transport.base_url, "https://graph.facebook.com/v21.0");
    }

    #[test]
    fn test_invalid_token_rejected() {
        let config = WhatsAppConfig {
            base_url: "https://graph.facebook.com".to_string(),
            api_version: "v21.0".to_string(),
            access_token: "bad\ntoken".to_string(),
            phone_number_id: "1".to_string(),
            business_account_id: None,
            verify_token: None,
        };
        assert!(matches!(
            HttpApiTransport::new(&config),
            Err(ApiError::Credentials(_))
        ));
    }
}
