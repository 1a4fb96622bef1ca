use std::sync::Arc;

use derive_new::new;

use crate::ingest::IngestMonitor;
use crate::predict::PredictionService;

/// Shared state of every request handler.
#[derive(Clone, new)]
pub struct App {
    pub predictions: Arc<PredictionService>,
    /// Absent when the API runs without an ingestion pipeline.
    #[new(default)]
    pub monitor: Option<Arc<dyn IngestMonitor>>,
}

impl App {
    pub fn with_monitor(mut self, monitor: Arc<dyn IngestMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("predictions", &self.predictions)
            .field("monitor", &self.monitor.is_some())
            .finish()
    }
}
