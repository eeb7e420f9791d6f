//! Simple metrics collection for observability
//!
//! Counters are plain atomics fed by a bus listener (see [`Metrics::attach`])
//! and by the limiter actor, and exported in Prometheus text format.

use crate::events::{EventBus, EventPayload, ListenerId, Topic};
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Core metrics collected by the gateway
pub struct Metrics {
    /// Server start time
    start_time: Instant,

    /// Outbound API calls
    pub api_calls_total: AtomicU64,
    pub api_calls_failed: AtomicU64,

    /// Message outcomes
    pub messages_sent: AtomicU64,
    pub messages_failed: AtomicU64,

    /// Inbound webhook entries
    pub messages_received: AtomicU64,
    pub status_updates: AtomicU64,

    /// Requests that had to queue on a limiter
    pub rate_limit_hits: AtomicU64,
    pub errors_total: AtomicU64,

    /// API call latency buckets
    pub latency_under_100ms: AtomicU64,
    pub latency_under_500ms: AtomicU64,
    pub latency_under_1s: AtomicU64,
    pub latency_under_5s: AtomicU64,
    pub latency_over_5s: AtomicU64,

    /// Histogram support
    pub latency_sum_ms: AtomicU64,

    /// Limiter registry
    pub active_limiters: AtomicUsize,
    pub limiters_reaped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            api_calls_total: AtomicU64::new(0),
            api_calls_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            status_updates: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            latency_under_100ms: AtomicU64::new(0),
            latency_under_500ms: AtomicU64::new(0),
            latency_under_1s: AtomicU64::new(0),
            latency_under_5s: AtomicU64::new(0),
            latency_over_5s: AtomicU64::new(0),
            latency_sum_ms: AtomicU64::new(0),
            active_limiters: AtomicUsize::new(0),
            limiters_reaped: AtomicU64::new(0),
        }
    }

    /// Keep these metrics up to date from the events published on `bus`
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> ListenerId {
        let metrics = Arc::clone(self);
        bus.on(Topic::All, move |event| metrics.record_event(&event.payload))
    }

    pub fn record_event(&self, payload: &EventPayload) {
        match payload {
            EventPayload::ApiCall {
                response_time_ms, ..
            } => self.record_api_call(*response_time_ms),
            EventPayload::MessageSent { .. } => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            EventPayload::MessageFailed { .. } => {
                self.messages_failed.fetch_add(1, Ordering::Relaxed);
            }
            EventPayload::MessageReceived { .. } => {
                self.messages_received.fetch_add(1, Ordering::Relaxed);
            }
            EventPayload::MessageStatusUpdate { .. } => {
                self.status_updates.fetch_add(1, Ordering::Relaxed);
            }
            EventPayload::RateLimitHit { .. } => {
                self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            }
            EventPayload::Error { context, .. } => {
                self.errors_total.fetch_add(1, Ordering::Relaxed);
                if context == "api_request" {
                    self.api_calls_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn record_api_call(&self, latency_ms: u64) {
        self.api_calls_total.fetch_add(1, Ordering::Relaxed);

        match latency_ms {
            0..=99 => self.latency_under_100ms.fetch_add(1, Ordering::Relaxed),
            100..=499 => self.latency_under_500ms.fetch_add(1, Ordering::Relaxed),
            500..=999 => self.latency_under_1s.fetch_add(1, Ordering::Relaxed),
            1000..=4999 => self.latency_under_5s.fetch_add(1, Ordering::Relaxed),
            _ => self.latency_over_5s.fetch_add(1, Ordering::Relaxed),
        };

        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn update_active_limiters(&self, count: usize) {
        self.active_limiters.store(count, Ordering::Relaxed);
    }

    pub fn record_reaped(&self, count: usize) {
        self.limiters_reaped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        gauge(
            &mut output,
            "wagate_uptime_seconds",
            "Time since server start in seconds",
            self.uptime_seconds(),
        );
        counter(
            &mut output,
            "wagate_api_calls_total",
            "Outbound WhatsApp API calls settled",
            self.api_calls_total.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "wagate_api_calls_failed",
            "Outbound WhatsApp API calls that failed",
            self.api_calls_failed.load(Ordering::Relaxed),
        );

        output.push_str("# HELP wagate_messages_total Messages by outcome\n");
        output.push_str("# TYPE wagate_messages_total counter\n");
        for (outcome, value) in [
            ("sent", &self.messages_sent),
            ("failed", &self.messages_failed),
            ("received", &self.messages_received),
        ] {
            let _ = writeln!(
                output,
                "wagate_messages_total{{outcome=\"{outcome}\"}} {}",
                value.load(Ordering::Relaxed)
            );
        }
        output.push('\n');

        counter(
            &mut output,
            "wagate_status_updates_total",
            "Delivery status updates received through the webhook",
            self.status_updates.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "wagate_rate_limit_hits_total",
            "Requests that had to queue on a limiter",
            self.rate_limit_hits.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "wagate_errors_total",
            "Error events published",
            self.errors_total.load(Ordering::Relaxed),
        );

        // Latency distribution
        output.push_str("# HELP wagate_api_call_duration_seconds API call latency distribution\n");
        output.push_str("# TYPE wagate_api_call_duration_seconds histogram\n");
        let mut cumulative = 0;
        for (le, bucket) in [
            ("0.1", &self.latency_under_100ms),
            ("0.5", &self.latency_under_500ms),
            ("1", &self.latency_under_1s),
            ("5", &self.latency_under_5s),
        ] {
            cumulative += bucket.load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "wagate_api_call_duration_seconds_bucket{{le=\"{le}\"}} {cumulative}"
            );
        }
        let total = self.api_calls_total.load(Ordering::Relaxed);
        let _ = writeln!(
            output,
            "wagate_api_call_duration_seconds_bucket{{le=\"+Inf\"}} {total}"
        );
        let latency_sum_seconds = self.latency_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        let _ = writeln!(
            output,
            "wagate_api_call_duration_seconds_sum {latency_sum_seconds:.3}"
        );
        let _ = writeln!(output, "wagate_api_call_duration_seconds_count {total}\n");

        // Limiter registry
        gauge(
            &mut output,
            "wagate_active_limiters",
            "Limiters currently held in the registry",
            self.active_limiters.load(Ordering::Relaxed) as u64,
        );
        counter(
            &mut output,
            "wagate_limiters_reaped_total",
            "Idle limiters removed by the reaper",
            self.limiters_reaped.load(Ordering::Relaxed),
        );

        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    metric(output, name, help, "counter", value);
}

fn gauge(output: &mut String, name: &str, help: &str, value: u64) {
    metric(output, name, help, "gauge", value);
}

fn metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}\n");
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.api_calls_total.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.messages_sent.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.rate_limit_hits.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.active_limiters.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_attached_metrics_follow_events() {
        let bus = EventBus::new(16);
        let metrics = Arc::new(Metrics::new());
        metrics.attach(&bus);

        let content = serde_json::json!({"to": "15550001111"});
        bus.emit_api_call("/1/messages", "POST", Duration::from_millis(40));
        bus.emit_message_sent("wamid.1", "1", &content);
        bus.emit_api_call("/1/messages", "POST", Duration::from_millis(700));
        bus.emit_error(&"HTTP 400", "api_request");
        bus.emit_message_failed(&"HTTP 400", "1", &content);
        bus.emit_rate_limit_hit("1:messaging", Duration::from_secs(45));
        bus.emit_error(&"queued too long", "rate_limiter:1:messaging");

        assert_eq!(metrics.api_calls_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.api_calls_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.messages_sent.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.messages_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.rate_limit_hits.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.errors_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.latency_under_100ms.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_under_1s.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_sum_ms.load(Ordering::Relaxed), 740);
    }

    #[test]
    fn test_latency_buckets() {
        let metrics = Metrics::new();

        for ms in [50, 250, 750, 2500, 9000] {
            metrics.record_api_call(ms);
        }

        assert_eq!(metrics.latency_under_100ms.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_under_500ms.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_under_1s.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_under_5s.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_over_5s.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.record_api_call(50);
        metrics.record_api_call(2500);
        metrics.update_active_limiters(3);
        metrics.record_reaped(2);

        let output = metrics.export_prometheus();

        assert!(output.contains("# TYPE wagate_api_calls_total counter"));
        assert!(output.contains("wagate_api_calls_total 2"));
        assert!(output.contains("wagate_api_call_duration_seconds_bucket{le=\"0.1\"} 1"));
        assert!(output.contains("wagate_api_call_duration_seconds_bucket{le=\"5\"} 2"));
        assert!(output.contains("wagate_api_call_duration_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(output.contains("wagate_api_call_duration_seconds_sum 2.550"));
        assert!(output.contains("wagate_messages_total{outcome=\"sent\"} 0"));
        assert!(output.contains("wagate_active_limiters 3"));
        assert!(output.contains("wagate_limiters_reaped_total 2"));
    }
}
