//! Process-wide inference counters with Prometheus text rendering

use parking_lot::Mutex;

/// Content type of the text exposition format
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Default)]
struct MetricsState {
    inference_count: u64,
    total_inference_time_ms: f64,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub count: u64,
    pub total_ms: f64,
}

impl MetricsSnapshot {
    /// Mean latency in milliseconds, 0 before the first inference
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

/// Counters for successful inferences
///
/// Both values are updated under one lock so a snapshot never sees one
/// without the other.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    state: Mutex<MetricsState>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful inference
    pub fn record(&self, elapsed_ms: f64) {
        let elapsed_ms = if elapsed_ms.is_finite() { elapsed_ms.max(0.0) } else { 0.0 };
        let mut state = self.state.lock();
        state.inference_count += 1;
        state.total_inference_time_ms += elapsed_ms;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            count: state.inference_count,
            total_ms: state.total_inference_time_ms,
        }
    }

    /// Render the three series in Prometheus text format
    pub fn render(&self) -> String {
        let snap = self.snapshot();
        format!(
            "# HELP npu_inference_total Total number of inferences\n\
             # TYPE npu_inference_total counter\n\
             npu_inference_total {}\n\
             \n\
             # HELP npu_inference_time_seconds_total Total inference time in seconds\n\
             # TYPE npu_inference_time_seconds_total counter\n\
             npu_inference_time_seconds_total {:.6}\n\
             \n\
             # HELP npu_inference_time_seconds_avg Average inference time in seconds\n\
             # TYPE npu_inference_time_seconds_avg gauge\n\
             npu_inference_time_seconds_avg {:.6}\n",
            snap.count,
            snap.total_ms / 1000.0,
            snap.avg_ms() / 1000.0,
        )
    }
}
