//! Destination of metrics produced by the input plugin

use std::sync::Arc;

use modbus_memory::Metric;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

pub trait MetricSink: Send + Sync + 'static {
    fn add_metric(&self, metric: Metric);
}

impl MetricSink for mpsc::UnboundedSender<Metric> {
    fn add_metric(&self, metric: Metric) {
        if self.send(metric).is_err() {
            debug!("Metric receiver closed, dropping metric");
        }
    }
}

/// Sink that keeps every metric in memory
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    metrics: Arc<Mutex<Vec<Metric>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything collected so far
    pub fn take(&self) -> Vec<Metric> {
        std::mem::take(&mut *self.metrics.lock())
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.lock().is_empty()
    }
}

impl MetricSink for CollectingSink {
    fn add_metric(&self, metric: Metric) {
        self.metrics.lock().push(metric);
    }
}
