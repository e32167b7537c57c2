//! Prometheus metrics for the messaging layer
//!
//! Counters are labelled by `queue` (or exchange for exchange publishes).

use crate::error::ErrorKind;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_ok() {
                info!("Prometheus metrics initialized");
            }
        }
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Metrics helper scoped to one queue or exchange
#[derive(Clone, Debug)]
pub struct MessagingMetrics {
    queue: String,
}

impl MessagingMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn message_published(&self) {
        counter!("amqp_messages_published_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn publish_failed(&self, kind: ErrorKind) {
        counter!(
            "amqp_publish_failures_total",
            "queue" => self.queue.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn message_received(&self) {
        counter!("amqp_messages_received_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Handler succeeded; `duration` is the handler's run time
    pub fn message_handled(&self, handler: &str, duration: Duration) {
        counter!(
            "amqp_messages_acked_total",
            "queue" => self.queue.clone(),
            "handler" => handler.to_string()
        )
        .increment(1);

        histogram!(
            "amqp_handler_duration_seconds",
            "queue" => self.queue.clone(),
            "handler" => handler.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn handler_failed(&self, handler: &str, reason: &str, requeue: bool) {
        counter!(
            "amqp_handler_failures_total",
            "queue" => self.queue.clone(),
            "handler" => handler.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);

        counter!(
            "amqp_messages_nacked_total",
            "queue" => self.queue.clone(),
            "requeue" => requeue.to_string()
        )
        .increment(1);
    }

    pub fn consumer_started(&self) {
        gauge!("amqp_active_consumers", "queue" => self.queue.clone()).increment(1.0);
    }

    pub fn consumer_stopped(&self, outcome: &str) {
        gauge!("amqp_active_consumers", "queue" => self.queue.clone()).decrement(1.0);
        counter!(
            "amqp_consumer_sessions_total",
            "queue" => self.queue.clone(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
    }

    pub fn supervisor_restart(&self) {
        counter!("amqp_supervisor_restarts_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn connection_opened(&self) {
        counter!("amqp_connections_opened_total").increment(1);
        gauge!("amqp_open_connections").increment(1.0);
    }

    pub fn connection_closed(&self) {
        counter!("amqp_connections_closed_total").increment(1);
        gauge!("amqp_open_connections").decrement(1.0);
    }
}
