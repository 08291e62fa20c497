//! Prometheus metrics for broker routes
//!
//! Provides observability into dispatch, reclaim and promotion.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Metrics helper labelled by stream and delivery mode
#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    stream: String,
    mode: &'static str,
}

impl BrokerMetrics {
    pub fn new(stream: impl Into<String>, mode: &'static str) -> Self {
        Self {
            stream: stream.into(),
            mode,
        }
    }

    pub fn message_enqueued(&self) {
        counter!(
            "broker_messages_enqueued_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .increment(1);
    }

    pub fn duplicate_rejected(&self) {
        counter!(
            "broker_duplicates_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .increment(1);
    }

    pub fn lock_busy(&self) {
        counter!(
            "broker_lock_busy_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .increment(1);
    }

    pub fn batch_received(&self, size: usize) {
        counter!(
            "broker_messages_received_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .increment(size as u64);
    }

    /// Record a finished handler run
    pub fn message_processed(&self, status: &'static str, retries: u32, duration: Duration) {
        counter!(
            "broker_messages_processed_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode,
            "status" => status
        )
        .increment(1);

        if retries > 0 {
            counter!(
                "broker_messages_retried_total",
                "stream" => self.stream.clone(),
                "mode" => self.mode
            )
            .increment(u64::from(retries));
        }

        histogram!(
            "broker_handler_duration_seconds",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .record(duration.as_secs_f64());
    }

    pub fn log_write_failed(&self) {
        counter!(
            "broker_log_write_failures_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .increment(1);
    }

    pub fn decode_failed(&self) {
        counter!(
            "broker_decode_failures_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .increment(1);
    }

    pub fn message_requeued(&self) {
        counter!(
            "broker_messages_requeued_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .increment(1);
    }

    pub fn message_dead_lettered(&self) {
        counter!(
            "broker_messages_dead_letter_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .increment(1);
    }

    pub fn messages_promoted(&self, count: usize) {
        counter!(
            "broker_messages_promoted_total",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .increment(count as u64);
    }

    pub fn pending_count(&self, count: usize) {
        gauge!(
            "broker_pending_count",
            "stream" => self.stream.clone(),
            "mode" => self.mode
        )
        .set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = BrokerMetrics::new("broker:{c:t}:normal_stream:stream", "normal");
        assert_eq!(metrics.stream, "broker:{c:t}:normal_stream:stream");
        assert_eq!(metrics.mode, "normal");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = BrokerMetrics::new("s", "scheduled");
        metrics.message_processed("success", 2, Duration::from_millis(5));
        metrics.messages_promoted(3);
        assert!(render_metrics().is_empty() || prometheus_handle().is_some());
    }
}
