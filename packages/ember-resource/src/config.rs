//! Resource provider configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-frame serve budget and resource root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Nanoseconds the serve workers may spend per `execute` call
    pub serve_budget_ns: u64,

    /// Root directory scanned for resource files
    pub resource_directory: PathBuf,

    /// Worker count for the serve pool; defaults to the logical core count
    #[serde(default)]
    pub worker_count: Option<usize>,
}

impl ProviderConfig {
    pub fn new(serve_budget_ns: u64, resource_directory: impl Into<PathBuf>) -> Self {
        Self {
            serve_budget_ns,
            resource_directory: resource_directory.into(),
            worker_count: None,
        }
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = Some(workers);
        self
    }

    pub fn effective_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(num_cpus::get).max(1)
    }
}
